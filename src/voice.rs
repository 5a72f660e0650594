//! Voice: one oscillator amplitude-modulated by one envelope
//!
//! The waveform DAC generates a voltage corresponding to oscillator state
//! 0..4095; the envelope DAC scales it by envelope state 0..255, giving an
//! ideal range of [-2048*255, 2047*255]. On top of that sits a static,
//! model-dependent offset: some level leaks from each voice even with the
//! envelope down and the oscillator stopped, which is what makes 6581 digis
//! loud and 8580 digis faint.

use std::sync::Arc;

use crate::envelope::EnvelopeGenerator;
use crate::waveform::{Control, WaveformGenerator};
use crate::wavetable::WaveformTables;
use crate::ChipModel;

/// One of the three SID voices.
#[derive(Clone, Debug)]
pub(crate) struct Voice {
    pub(crate) wave: WaveformGenerator,
    pub(crate) envelope: EnvelopeGenerator,

    /// Multiplying D/A DC offset.
    voice_offset: f32,

    muted: bool,
}

impl Voice {
    pub(crate) fn new(tables: Arc<WaveformTables>) -> Self {
        Self {
            wave: WaveformGenerator::new(tables),
            envelope: EnvelopeGenerator::new(),
            voice_offset: 0.0,
            muted: false,
        }
    }

    /// Amplitude-modulated waveform output.
    ///
    /// `ring_modulator` is the neighbouring oscillator ring-modulating this
    /// voice (voice i - 1 for voice i).
    #[inline]
    pub(crate) fn output(&self, ring_modulator: &WaveformGenerator) -> f32 {
        self.wave.output(ring_modulator) * self.envelope.output() + self.voice_offset
    }

    /// Update the model-dependent DC offset and envelope DAC curve.
    pub(crate) fn set_chip_model(&mut self, model: ChipModel, nonlinearity: f32) {
        self.voice_offset = match model {
            ChipModel::Mos6581 => (0x800 * 0xff) as f32,
            ChipModel::Mos8580 => -((0x100 * 0xff) as f32),
        };
        self.envelope.set_nonlinearity(nonlinearity);
    }

    /// Control register write fans out to the oscillator and the envelope.
    pub(crate) fn write_control_reg(&mut self, ring_accumulator: u32, control: Control) {
        self.wave.write_control_reg(ring_accumulator, control);
        self.envelope.write_control_reg(control);
    }

    /// Voice mute. Output is killed at the next envelope event.
    pub(crate) fn mute(&mut self, enable: bool) {
        self.muted = enable;
        self.envelope.mute(enable);
    }

    #[allow(dead_code)]
    pub(crate) fn is_muted(&self) -> bool {
        self.muted
    }

    /// SID reset.
    pub(crate) fn reset(&mut self) {
        self.wave.reset();
        self.envelope.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TableCache;

    fn test_voice(model: ChipModel, nonlinearity: f32) -> Voice {
        let tables = TableCache::global().waveform_tables(model, nonlinearity);
        let mut voice = Voice::new(tables);
        voice.set_chip_model(model, nonlinearity);
        voice
    }

    #[test]
    fn test_static_offset_differs_per_model() {
        let v6581 = test_voice(ChipModel::Mos6581, 0.96);
        let v8580 = test_voice(ChipModel::Mos8580, 1.0);

        // Envelope is down: only the static leakage remains.
        let ring = test_voice(ChipModel::Mos8580, 1.0);
        assert_eq!(v6581.output(&ring.wave), (0x800 * 0xff) as f32);
        assert_eq!(v8580.output(&ring.wave), -((0x100 * 0xff) as f32));
    }

    #[test]
    fn test_mute_silences_envelope() {
        let mut voice = test_voice(ChipModel::Mos8580, 1.0);
        let ring = test_voice(ChipModel::Mos8580, 1.0);

        voice.envelope.write_attack_decay(0x00);
        voice.envelope.write_sustain_release(0xf0);
        voice.write_control_reg(0, Control::SAWTOOTH | Control::GATE);
        voice.mute(true);
        for _ in 0..1000 {
            voice.wave.clock();
            voice.envelope.clock();
        }
        assert_eq!(voice.output(&ring.wave), voice.voice_offset);
    }
}
