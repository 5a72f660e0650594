//! Combined waveform table builder
//!
//! The SID selects waveforms by ANDing the outputs of its oscillator onto a
//! shared 12-bit DAC bus. Selecting more than one waveform at once produces
//! "combined" waveforms whose bit patterns do not match a logical AND/OR of
//! the ideal shapes - neighbouring bus lines pull each other through the
//! finite output impedance of the waveform selector FETs. This module
//! reproduces sampled hardware behavior with a per-model empirical model and
//! bakes the result into lookup tables consumed by the oscillators.
//!
//! Table layout: indices 0..=6 hold waveforms 1..=7 with the pulse
//! comparator low (never triggered), indices 7..=10 hold waveforms 4..=7
//! with the comparator high (always triggered).

use crate::dac::kinked_dac;
use crate::ChipModel;

/// Number of phase entries per waveform table (12-bit phase).
pub(crate) const TABLE_LEN: usize = 4096;

/// Number of tables: waveforms 1-7 plus pulse-high variants of 4-7.
pub(crate) const TABLE_COUNT: usize = 11;

/// Bit turn-on/off threshold steepness. Sampling indicates the transition
/// is very steep; 512 approximates the residual analog character.
const SHARPNESS: f32 = 512.0;

/// Empirically fitted constants for one waveform group on one chip model.
///
/// These are opaque curve-fit results against hardware samplings; there is
/// no derivable formula behind them and they must not be "cleaned up".
#[derive(Clone, Copy)]
struct CombinedWaveformConfig {
    bias: f32,
    pulsestrength: f32,
    topbit: f32,
    distance: f32,
    stmix: f32,
}

const fn cwf(
    bias: f32,
    pulsestrength: f32,
    topbit: f32,
    distance: f32,
    stmix: f32,
) -> CombinedWaveformConfig {
    CombinedWaveformConfig { bias, pulsestrength, topbit, distance, stmix }
}

/// Fitted against kevtris' samplings: chip G (6581 R2/R3) and chip V (8580).
/// Rows: [ST, PT, PS, PST, unused/default] per model.
const WFCONFIG: [[CombinedWaveformConfig; 5]; 2] = [
    [
        cwf(0.880_815, 0.0, 0.0, 0.327_961_4, 0.599_954_5),
        cwf(0.892_461_8, 2.014_781, 1.003_332, 0.029_923_22, 0.0),
        cwf(0.864_650_1, 1.712_586, 1.137_704, 0.028_454_23, 0.0),
        cwf(0.952_783_4, 1.794_777, 0.0, 0.098_062_72, 0.775_248_2),
        cwf(0.5, 0.0, 1.0, 0.0, 0.0),
    ],
    [
        cwf(0.978_166_5, 0.0, 0.989_946_9, 8.087_667, 0.822_641_2),
        cwf(0.909_776_9, 2.039_997, 0.958_409_6, 0.176_544_7, 0.0),
        cwf(0.923_121_2, 2.084_788, 0.949_389_5, 0.171_251_8, 0.0),
        cwf(0.984_555_2, 1.415_612, 0.970_388_3, 3.688_29, 0.826_500_8),
        cwf(0.5, 0.0, 1.0, 0.0, 0.0),
    ],
];

/// Waveform output tables for one (chip model, DAC nonlinearity) pair.
///
/// Built once per configuration and shared between all voices of all chips
/// through [`crate::TableCache`]. Read-only after construction.
pub(crate) struct WaveformTables {
    analog: Box<[[f32; TABLE_LEN]; TABLE_COUNT]>,
    digital: Box<[[u8; TABLE_LEN]; TABLE_COUNT]>,
    dac: [f32; 12],
}

impl WaveformTables {
    /// Build the full table suite for a chip model and DAC nonlinearity.
    pub(crate) fn build(model: ChipModel, nonlinearity: f32) -> Self {
        let mut dac = [0.0f32; 12];
        for (i, entry) in dac.iter_mut().enumerate() {
            *entry = kinked_dac(1 << i, nonlinearity, 12);
        }

        let wave_zero = match model {
            ChipModel::Mos6581 => -(0x380 as f32),
            ChipModel::Mos8580 => -(0x800 as f32),
        };

        let mut analog = Box::new([[0.0f32; TABLE_LEN]; TABLE_COUNT]);
        let mut digital = Box::new([[0u8; TABLE_LEN]; TABLE_COUNT]);

        let mut bits = [0.0f32; 12];
        for waveform in 1usize..8 {
            for phase in 0..TABLE_LEN {
                let accumulator = (phase << 12) as u32;

                // Pulse-low variant. For waveforms < 4 the comparator state
                // is irrelevant and only this table is used.
                fill_waveform_bits(&mut bits, model, waveform, accumulator, 0x1000);
                analog[waveform - 1][phase] = make_sample(&dac, &bits) + wave_zero;
                digital[waveform - 1][phase] = make_digital(&bits);

                // Pulse-high variants follow the pulse-low state variants.
                if waveform >= 4 {
                    fill_waveform_bits(&mut bits, model, waveform, accumulator, 0x000);
                    analog[waveform + 3][phase] = make_sample(&dac, &bits) + wave_zero;
                    digital[waveform + 3][phase] = make_digital(&bits);
                }
            }
        }

        log::debug!("built waveform tables for {model:?}, nonlinearity {nonlinearity}");
        Self { analog, digital, dac }
    }

    /// Analog output for a table index (0..=10) and 12-bit phase.
    #[inline]
    pub(crate) fn analog(&self, table: usize, phase: usize) -> f32 {
        self.analog[table][phase]
    }

    /// Digital OSC3 bit state for a table index and 12-bit phase.
    #[inline]
    pub(crate) fn digital(&self, table: usize, phase: usize) -> u8 {
        self.digital[table][phase]
    }

    /// Analog weight of a single waveform DAC bit.
    #[inline]
    pub(crate) fn dac_bit(&self, bit: usize) -> f32 {
        self.dac[bit]
    }

    /// The waveform DAC offset; ideally corresponds to digital 0x800.
    #[inline]
    pub(crate) fn zero_level(&self) -> f32 {
        self.analog[0][0]
    }
}

/// Render the analog sample from a floating-point bit state.
fn make_sample(dac: &[f32; 12], bits: &[f32; 12]) -> f32 {
    let mut out = 0.0;
    for i in 0..12 {
        out += bits[i] * dac[i];
    }
    out
}

/// Render the OSC3 byte (bus bits 11..4) from a floating-point bit state.
fn make_digital(bits: &[f32; 12]) -> u8 {
    let mut out = 0u8;
    for i in (4..=11).rev() {
        out <<= 1;
        if bits[i] > 0.5 {
            out |= 1;
        }
    }
    out
}

/// Explode a 12-bit value into a floating-point bit array.
fn populate(value: u32, bits: &mut [f32; 12]) {
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = if value & (1 << i) != 0 { 1.0 } else { 0.0 };
    }
}

/// Compute the analog bit state of one waveform (1..=7) at one accumulator
/// position, with the pulse comparator threshold `pw` (0x1000 = never
/// triggered, 0x000 = always triggered).
fn fill_waveform_bits(
    bits: &mut [f32; 12],
    model: ChipModel,
    waveform: usize,
    accumulator: u32,
    pw: u32,
) {
    let phase = accumulator >> 12;

    // Pure pulse is a two-level ideal waveform.
    if waveform == 4 {
        populate(if phase >= pw { 0xfff } else { 0x000 }, bits);
        return;
    }

    let model_index = match model {
        ChipModel::Mos6581 => 0,
        ChipModel::Mos8580 => 1,
    };
    let config = &WFCONFIG[model_index][match waveform {
        3 => 0,
        5 => 1,
        6 => 2,
        7 => 3,
        _ => 4,
    }];

    // Start from the sawtooth bit state.
    populate(phase, bits);

    // Convert to triangle: reflect the lower bits when the accumulator MSB
    // is set. The bottom bit is grounded by the triangle selector.
    if waveform & 3 == 1 {
        let top = accumulator & 0x80_0000 != 0;
        for i in (1..12).rev() {
            bits[i] = if top { 1.0 - bits[i - 1] } else { bits[i - 1] };
        }
        bits[0] = 0.0;
    }

    // Convert to sawtooth+triangle: each bus line is dragged by its lower
    // neighbour through the selector FETs.
    if waveform & 3 == 3 {
        bits[0] *= config.stmix;
        for i in 1..12 {
            bits[i] = bits[i - 1] * (1.0 - config.stmix) + bits[i] * config.stmix;
        }
    }

    bits[11] *= config.topbit;

    // ST and pulse-combined waveforms: distance-weighted averaging of the
    // neighbouring bus lines, plus the pulse control line for P* variants.
    if waveform == 3 || waveform > 4 {
        let mut distancetable = [0.0f32; 12 * 2 + 1];
        for i in 0..=12usize {
            let weight = 1.0 / (1.0 + (i * i) as f32 * config.distance);
            distancetable[12 + i] = weight;
            distancetable[12 - i] = weight;
        }

        let pulse = if phase >= pw {
            config.pulsestrength
        } else {
            -config.pulsestrength
        };

        let mut tmp = [0.0f32; 12];
        for i in 0..12 {
            let mut avg = 0.0;
            let mut n = 0.0;
            for j in 0..12 {
                let weight = distancetable[i + 12 - j];
                avg += bits[j] * weight;
                n += weight;
            }
            if waveform > 4 {
                let weight = distancetable[i];
                avg += pulse * weight;
                n += weight;
            }
            tmp[i] = (bits[i] + avg / n) * 0.5;
        }
        *bits = tmp;
    }

    // Set or clear each DAC bit depending on the environment around the
    // bias value; measurements indicate the threshold is very sharp.
    for bit in bits.iter_mut() {
        *bit = ((*bit - config.bias) * SHARPNESS + 0.5).clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sawtooth_digital_matches_phase() {
        let tables = WaveformTables::build(ChipModel::Mos8580, 1.0);
        for phase in [0usize, 1, 0x123, 0x7ff, 0x800, 0xfff] {
            assert_eq!(tables.digital(1, phase), (phase >> 4) as u8);
        }
    }

    #[test]
    fn test_triangle_digital_reflects() {
        let tables = WaveformTables::build(ChipModel::Mos8580, 1.0);
        // Rising half: value doubles; falling half mirrors.
        assert_eq!(tables.digital(0, 0x000), 0x00);
        assert_eq!(tables.digital(0, 0x400), 0x80);
        assert_eq!(tables.digital(0, 0x7ff), 0xff);
        assert_eq!(tables.digital(0, 0x800), 0xff);
        assert_eq!(tables.digital(0, 0xbff), 0x80);
    }

    #[test]
    fn test_pulse_tables_are_two_level() {
        let tables = WaveformTables::build(ChipModel::Mos8580, 1.0);
        for phase in (0..TABLE_LEN).step_by(97) {
            // Comparator low: all bits clear; comparator high: all set.
            assert_eq!(tables.digital(3, phase), 0x00);
            assert_eq!(tables.digital(7, phase), 0xff);
            assert!(tables.analog(3, phase) < 0.0);
            assert!(tables.analog(7, phase) > 0.0);
        }
    }

    #[test]
    fn test_combined_pulse_sawtooth_differs_from_or() {
        // The 6581 PS waveform famously zeroes most low bits compared to an
        // ideal OR of pulse and sawtooth.
        let tables = WaveformTables::build(ChipModel::Mos6581, 0.96);
        let mut differs = false;
        for phase in 0..TABLE_LEN {
            let ideal_or = ((phase >> 4) as u8) | 0xff;
            if tables.digital(9, phase) != ideal_or {
                differs = true;
                break;
            }
        }
        assert!(differs, "combined waveform should not be an ideal OR");
    }

    #[test]
    fn test_zero_level_tracks_model_offset() {
        let t6581 = WaveformTables::build(ChipModel::Mos6581, 0.96);
        let t8580 = WaveformTables::build(ChipModel::Mos8580, 1.0);
        assert_eq!(t6581.zero_level(), -(0x380 as f32));
        assert_eq!(t8580.zero_level(), -(0x800 as f32));
    }
}
