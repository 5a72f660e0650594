//! WAV file export
//!
//! Renders a configured chip straight to a 16-bit mono PCM WAV file. The
//! chip must have had its registers and sampling parameters set up by the
//! caller; this helper only clocks and writes.

use std::path::Path;

use crate::{Result, Sid, SidError};

/// Cycles rendered per chunk; bounds the sample buffer.
const CHUNK_CYCLES: u32 = 8192;

/// Clock `sid` for `cycles` chip cycles and write the produced samples to
/// `path` as 16-bit mono PCM at `sample_rate`.
///
/// `sample_rate` is only stamped into the WAV header; it should match the
/// output rate passed to [`Sid::set_sampling_parameters`].
///
/// # Errors
///
/// [`SidError::Export`] when the file cannot be created or written.
pub fn render_to_wav<P: AsRef<Path>>(
    sid: &mut Sid,
    cycles: u32,
    sample_rate: u32,
    path: P,
) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| SidError::Export(format!("failed to create WAV file: {e}")))?;

    let mut buf = vec![0.0f32; CHUNK_CYCLES as usize];
    let mut remaining = cycles;
    while remaining > 0 {
        let step = remaining.min(CHUNK_CYCLES);
        let produced = sid.clock(step, &mut buf, 0);
        for &sample in &buf[..produced] {
            let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(value)
                .map_err(|e| SidError::Export(format!("failed to write sample: {e}")))?;
        }
        remaining -= step;
    }

    writer
        .finalize()
        .map_err(|e| SidError::Export(format!("failed to finalize WAV file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChipModel, SamplingMethod};

    #[test]
    fn test_render_writes_expected_length() {
        let mut sid = Sid::new(ChipModel::Mos8580);
        sid.set_sampling_parameters(985_248.0, SamplingMethod::Decimate, 44_100.0, 20_000.0)
            .unwrap();
        sid.write(0x18, 0x0f);
        sid.write(0x00, 0x45);
        sid.write(0x01, 0x1d);
        sid.write(0x06, 0xf0);
        sid.write(0x04, 0x21);

        let path = std::env::temp_dir().join("residfp_render_test.wav");
        render_to_wav(&mut sid, 98_524, 44_100, &path).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        // ~0.1 s of audio.
        let len = reader.len();
        assert!((4300..=4500).contains(&len), "unexpected length {len}");
        std::fs::remove_file(&path).ok();
    }
}
