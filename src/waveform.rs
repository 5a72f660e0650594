//! Waveform generator (oscillator)
//!
//! A 24-bit accumulator is the basis for waveform generation: the 16-bit
//! frequency value is added to it each cycle while the TEST bit is clear.
//! The noise waveform is taken from intermediate bits of a 23-bit shift
//! register clocked by accumulator bit 19. Waveform shaping itself is table
//! driven; the tables are built in the `wavetable` module.

use std::sync::Arc;

use bitflags::bitflags;

use crate::wavetable::WaveformTables;
use crate::ChipModel;

bitflags! {
    /// Voice control register bit assignments ($D404/$D40B/$D412).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Control: u8 {
        /// Envelope gate.
        const GATE = 0x01;
        /// Hard-sync this oscillator to its neighbour.
        const SYNC = 0x02;
        /// Ring-modulate the triangle output with the neighbour's MSB.
        const RING_MOD = 0x04;
        /// Freeze and zero the accumulator.
        const TEST = 0x08;
        /// Triangle waveform select.
        const TRIANGLE = 0x10;
        /// Sawtooth waveform select.
        const SAWTOOTH = 0x20;
        /// Pulse waveform select.
        const PULSE = 0x40;
        /// Noise waveform select.
        const NOISE = 0x80;
    }
}

/// Noise shift register state forced in after the TEST-bit fade completes.
const NOISE_RESET_VALUE: u32 = 0x7f_fffc;

/// Cycles the noise register retains its charge while TEST is held.
const NOISE_TTL: u32 = 200_000;

/// Per-voice waveform generator.
#[derive(Clone)]
pub struct WaveformGenerator {
    tables: Arc<WaveformTables>,

    /// Current and previous cycle's accumulator value. The previous value
    /// drives sync edge detection and the 8580's delayed OSC3 read.
    accumulator: u32,
    accumulator_prev: u32,

    /// Fout = (Fn * Fclk / 16777216) Hz
    frequency: u32,

    /// PWout = (PWn / 40.95) %
    pulse_width: u32,

    /// Control register shifted right 4 bits; selects the output table.
    waveform: u32,

    test: bool,
    ring: bool,
    sync: bool,

    noise_shift_register: u32,
    noise_shift_register_ttl: u32,

    /// Digital and analog OSC output held while waveform select is zero.
    previous: u8,
    previous_dac: f32,
}

impl WaveformGenerator {
    pub(crate) fn new(tables: Arc<WaveformTables>) -> Self {
        let mut wave = Self {
            tables,
            accumulator: 0,
            accumulator_prev: 0,
            frequency: 0,
            pulse_width: 0,
            waveform: 0,
            test: false,
            ring: false,
            sync: false,
            noise_shift_register: NOISE_RESET_VALUE,
            noise_shift_register_ttl: 0,
            previous: 0,
            previous_dac: 0.0,
        };
        wave.reset();
        wave
    }

    /// Swap the shared waveform tables on a chip model change.
    pub(crate) fn set_tables(&mut self, tables: Arc<WaveformTables>) {
        self.tables = tables;
    }

    /// SID clocking - 1 cycle.
    #[inline]
    pub(crate) fn clock(&mut self) {
        // No digital operation while the test bit is set; only emulate the
        // analog fade of the noise register charge.
        if self.test {
            if self.noise_shift_register_ttl != 0 {
                self.noise_shift_register_ttl -= 1;
                if self.noise_shift_register_ttl == 0 {
                    self.noise_shift_register |= NOISE_RESET_VALUE;
                    self.clock_noise(false);
                }
            }
            return;
        }

        self.accumulator_prev = self.accumulator;
        self.accumulator = (self.accumulator + self.frequency) & 0xff_ffff;

        // Shift the noise register once for each rising edge of
        // accumulator bit 19.
        if !self.accumulator_prev & self.accumulator & 0x08_0000 != 0 {
            self.clock_noise(true);
        }
    }

    /// Whether the accumulator MSB rose during the last clock.
    #[inline]
    pub(crate) fn msb_rising(&self) -> bool {
        !self.accumulator_prev & self.accumulator & 0x80_0000 != 0
    }

    #[inline]
    pub(crate) fn sync_enabled(&self) -> bool {
        self.sync
    }

    /// Zero the accumulator (hard sync from the neighbouring oscillator).
    #[inline]
    pub(crate) fn hard_sync(&mut self) {
        self.accumulator = 0;
    }

    #[inline]
    pub(crate) fn accumulator(&self) -> u32 {
        self.accumulator
    }

    /// 12-bit waveform output through the analog tables.
    ///
    /// `ring_modulator` is the oscillator ring-modulating this one
    /// (voice i - 1 for voice i).
    #[inline]
    pub fn output(&self, ring_modulator: &WaveformGenerator) -> f32 {
        self.output_at(ring_modulator.accumulator)
    }

    #[inline]
    fn output_at(&self, ring_accumulator: u32) -> f32 {
        if self.waveform == 0 || self.waveform > 7 {
            return self.previous_dac;
        }
        let (table, phase) = self.table_index(ring_accumulator, self.accumulator);
        self.tables.analog(table, phase)
    }

    /// OSC3 readout for the given chip model. The 8580 latches the
    /// accumulator for one cycle, the 6581 reads it combinatorially.
    #[inline]
    pub fn read_osc(&self, model: ChipModel, ring_modulator: &WaveformGenerator) -> u8 {
        match model {
            ChipModel::Mos6581 => {
                self.read_osc_at(ring_modulator.accumulator, self.accumulator)
            }
            ChipModel::Mos8580 => {
                // Waveforms 0 and >= 8 are not delayed here; noise is
                // therefore one cycle early, which is not audible on OSC3.
                self.read_osc_at(ring_modulator.accumulator_prev, self.accumulator_prev)
            }
        }
    }

    fn read_osc_at(&self, ring_accumulator: u32, accumulator: u32) -> u8 {
        if self.waveform == 0 || self.waveform >= 8 {
            return self.previous;
        }
        let (table, phase) = self.table_index(ring_accumulator, accumulator);
        self.tables.digital(table, phase)
    }

    /// Select the output table and phase for waveforms 1..=7.
    #[inline]
    fn table_index(&self, ring_accumulator: u32, accumulator: u32) -> (usize, usize) {
        let mut phase = (accumulator >> 12) as usize;

        // Pulse on/off selects the 4 variant tables behind the main types.
        let table = if self.waveform >= 4 && (self.test || phase as u32 >= self.pulse_width) {
            self.waveform as usize + 3
        } else {
            self.waveform as usize - 1
        };

        // Triangle XOR circuit: the tables already fold the triangle, so
        // only the ring-mod source's MSB needs accounting for here.
        if self.ring && ring_accumulator & 0x80_0000 != 0 {
            phase ^= 0x800;
        }

        (table, phase)
    }

    // ------------------------------------------------------------------
    // Register functions.
    // ------------------------------------------------------------------

    pub(crate) fn write_freq_lo(&mut self, value: u8) {
        self.frequency = self.frequency & 0xff00 | value as u32;
    }

    pub(crate) fn write_freq_hi(&mut self, value: u8) {
        self.frequency = (value as u32) << 8 | self.frequency & 0x00ff;
    }

    pub(crate) fn write_pw_lo(&mut self, value: u8) {
        self.pulse_width = self.pulse_width & 0xf00 | value as u32;
    }

    pub(crate) fn write_pw_hi(&mut self, value: u8) {
        self.pulse_width = (value as u32) << 8 & 0xf00 | self.pulse_width & 0x0ff;
    }

    /// Control register write. `ring_accumulator` is the current accumulator
    /// of the ring-modulating neighbour, needed to latch the held output
    /// sample when the waveform select drops to zero.
    pub(crate) fn write_control_reg(&mut self, ring_accumulator: u32, control: Control) {
        let waveform_next = (control.bits() >> 4 & 0x0f) as u32;

        // When deselecting all waveforms the previous output is held for a
        // while in the DAC MOSFET gates. The latch always reads the
        // non-delayed (6581-style) value.
        if waveform_next == 0 && (1..=7).contains(&self.waveform) {
            self.previous = self.read_osc_at(ring_accumulator, self.accumulator);
            self.previous_dac = self.output_at(ring_accumulator);
        }

        self.waveform = waveform_next;
        self.ring = control.contains(Control::RING_MOD) && waveform_next & 0x3 == 1;
        self.sync = control.contains(Control::SYNC);
        let test_next = control.contains(Control::TEST);

        if test_next && !self.test {
            // Test bit rising: freeze the accumulator and invert noise
            // register bit 19 into bit 1, then start the charge fade.
            self.accumulator = 0;
            self.accumulator_prev = 0;
            let bit19 = self.noise_shift_register >> 18 & 2;
            self.noise_shift_register =
                self.noise_shift_register & 0x7f_fffd | (bit19 ^ 2);
            self.noise_shift_register_ttl = NOISE_TTL;
        } else if !test_next {
            // Clock noise if the test bit is falling.
            self.clock_noise(self.test);
        }

        self.test = test_next;
    }

    /// Shift the noise register and refresh the cached noise output.
    ///
    /// ```text
    ///                        ------------------------>--------------------
    ///                        |                                            |
    ///                   ----EOR----                                       |
    ///                   |         |                                       |
    ///                   2 2 2 1 1 1 1 1 1 1 1 1 1                         |
    /// Register bits:    2 1 0 9 8 7 6 5 4 3 2 1 0 9 8 7 6 5 4 3 2 1 0 <---
    ///                   |   |       |     |   |       |     |   |
    /// OSC3 bits:        7   6       5     4   3       2     1   0
    /// ```
    fn clock_noise(&mut self, shift: bool) {
        if shift {
            let bit0 = (self.noise_shift_register >> 22
                ^ self.noise_shift_register >> 17)
                & 0x1;
            self.noise_shift_register =
                (self.noise_shift_register << 1 | bit0) & 0x7f_ffff;
        }

        // Output bits are pulled down when noise and another waveform are
        // selected simultaneously.
        if self.waveform > 8 {
            self.noise_shift_register &= 0x7f_ffff
                ^ 1 << 22
                ^ 1 << 20
                ^ 1 << 16
                ^ 1 << 13
                ^ 1 << 11
                ^ 1 << 7
                ^ 1 << 4
                ^ 1 << 2;
        }

        if self.waveform >= 8 {
            self.previous = self.noise_value();
            self.previous_dac = self.tables.zero_level();
            for i in 0..8 {
                if self.previous & 1 << i != 0 {
                    self.previous_dac += self.tables.dac_bit(i + 4);
                }
            }
        }
    }

    /// Assemble the OSC output byte from the noise register taps.
    fn noise_value(&self) -> u8 {
        let sr = self.noise_shift_register;
        ((sr & 0x40_0000) >> 15
            | (sr & 0x10_0000) >> 14
            | (sr & 0x01_0000) >> 11
            | (sr & 0x00_2000) >> 9
            | (sr & 0x00_0800) >> 8
            | (sr & 0x00_0080) >> 5
            | (sr & 0x00_0010) >> 3
            | (sr & 0x00_0004) >> 2) as u8
    }

    /// SID reset.
    pub(crate) fn reset(&mut self) {
        self.accumulator = 0;
        self.accumulator_prev = 0;
        self.previous = 0;
        self.previous_dac = 0.0;
        self.noise_shift_register = NOISE_RESET_VALUE;
        self.frequency = 0;
        self.pulse_width = 0;
        self.test = false;
        self.waveform = 0;
        let accumulator = self.accumulator;
        self.write_control_reg(accumulator, Control::empty());
    }
}

impl std::fmt::Debug for WaveformGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaveformGenerator")
            .field("accumulator", &self.accumulator)
            .field("frequency", &self.frequency)
            .field("pulse_width", &self.pulse_width)
            .field("waveform", &self.waveform)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TableCache;

    fn test_wave() -> WaveformGenerator {
        let tables = TableCache::global().waveform_tables(ChipModel::Mos8580, 1.0);
        WaveformGenerator::new(tables)
    }

    #[test]
    fn test_accumulator_wraps_after_full_period() {
        let mut wave = test_wave();
        wave.write_freq_lo(0x21);
        wave.write_freq_hi(0x43);

        // 2^24 additions of any 16-bit value return to the start state.
        for _ in 0..(1u32 << 24) {
            wave.clock();
        }
        assert_eq!(wave.accumulator(), 0);
    }

    #[test]
    fn test_accumulator_frozen_while_test_set() {
        let mut wave = test_wave();
        wave.write_freq_lo(0xff);
        wave.write_freq_hi(0xff);
        wave.write_control_reg(0, Control::TEST);
        for _ in 0..100 {
            wave.clock();
        }
        assert_eq!(wave.accumulator(), 0);
    }

    #[test]
    fn test_noise_shift_register_determinism() {
        let mut wave = test_wave();
        // Accumulator bit 19 rises once every 32 clocks at this frequency:
        // exactly one LFSR shift per 32-cycle group.
        wave.write_freq_lo(0x00);
        wave.write_freq_hi(0x80);
        wave.write_control_reg(0, Control::NOISE);

        // Recorded OSC3 bytes for successive shifts out of the reset seed
        // 0x7ffffc.
        let expected = [0xfe, 0xfe, 0xfc, 0xfc, 0xfc, 0xf8, 0xf8, 0xf8, 0xf8, 0xf0];

        let partner = test_wave();
        assert_eq!(wave.read_osc(ChipModel::Mos6581, &partner), 0xff);
        for &value in &expected {
            for _ in 0..32 {
                wave.clock();
            }
            assert_eq!(wave.read_osc(ChipModel::Mos6581, &partner), value);
        }
    }

    #[test]
    fn test_pulse_output_follows_comparator() {
        let mut wave = test_wave();
        wave.write_pw_lo(0x00);
        wave.write_pw_hi(0x08); // 50%
        wave.write_freq_lo(0x00);
        wave.write_freq_hi(0x10); // phase advances 1 per cycle
        wave.write_control_reg(0, Control::PULSE);

        let partner = test_wave();
        let mut seen_low = false;
        let mut seen_high = false;
        for _ in 0..4096 {
            wave.clock();
            match wave.read_osc(ChipModel::Mos6581, &partner) {
                0x00 => seen_low = true,
                0xff => seen_high = true,
                other => panic!("pulse output must be two-level, got {other:#04x}"),
            }
        }
        assert!(seen_low && seen_high);
    }

    #[test]
    fn test_waveform_zero_holds_previous_output() {
        let mut wave = test_wave();
        wave.write_freq_lo(0x00);
        wave.write_freq_hi(0x40);
        wave.write_control_reg(0, Control::SAWTOOTH);
        for _ in 0..7 {
            wave.clock();
        }
        let partner = test_wave();
        let held = wave.read_osc(ChipModel::Mos6581, &partner);
        assert_ne!(held, 0);

        wave.write_control_reg(0, Control::empty());
        for _ in 0..100 {
            wave.clock();
        }
        assert_eq!(wave.read_osc(ChipModel::Mos6581, &partner), held);
    }

    #[test]
    fn test_ring_mod_flips_phase_with_partner_msb() {
        let tables = TableCache::global().waveform_tables(ChipModel::Mos8580, 1.0);
        let mut wave = WaveformGenerator::new(Arc::clone(&tables));
        wave.write_freq_lo(0x00);
        wave.write_freq_hi(0x10);
        wave.write_control_reg(0, Control::TRIANGLE | Control::RING_MOD);
        wave.clock();

        let mut partner_low = WaveformGenerator::new(Arc::clone(&tables));
        let mut partner_high = WaveformGenerator::new(tables);
        partner_high.write_freq_lo(0xff);
        partner_high.write_freq_hi(0xff);
        partner_high.write_control_reg(0, Control::SAWTOOTH);
        for _ in 0..129 {
            partner_high.clock(); // accumulator MSB ends up set
        }
        assert_ne!(partner_high.accumulator() & 0x80_0000, 0);
        partner_low.clock();

        let plain = wave.read_osc(ChipModel::Mos6581, &partner_low);
        let rung = wave.read_osc(ChipModel::Mos6581, &partner_high);
        assert_ne!(plain, rung);
    }
}
