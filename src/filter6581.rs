//! 6581 filter with voltage-dependent distortion
//!
//! The 6581 cutoff FET behaves as a voltage-controlled resistor whose value
//! depends on the signal level at the integrator input. The integrator gain
//! `w0` is therefore a function of both the cutoff register and the current
//! signal amplitude, precomputed into a table indexed by cutoff-derived row
//! and quantized distortion level. A final waveshaper emulates the output
//! inverter saturating on loud signals.
//!
//! Filter distortion model by Antti S. Lankila.

use crate::dac::kinked_dac;
use crate::filter::FilterCommon;

/// 6581 integrator capacitance.
const SIDCAPS_6581: f64 = 470e-12;

/// Oscillator-level to cutoff-voltage conversion factor.
const OSC_TO_FC: f32 = 1.0 / 512.0;

/// Distortion quantization. Succeeding table entries differ by about 1% at
/// this resolution.
const W0_RESOLUTION: f32 = 1.0 / 5e3;

/// Cutoff rows: the real chip has line #0 disconnected, leaving 1024
/// distinct settings of the 11-bit register.
const FC_ROWS: usize = 1024;

/// Distortion levels; the bound is exceeded only during the most extreme
/// distortion.
const DIST_LEVELS: usize = 256;

/// MOS 6581 filter.
pub struct Filter6581 {
    pub(crate) common: FilterCommon,

    /* Distortion params */
    attenuation: f32,
    nonlinearity: f32,

    /* Type 3 curve params */
    baseresistance: f32,
    offset: f32,
    steepness: f32,
    minimumfetresistance: f32,
    voice_nonlinearity: f32,

    /// `w0` per (cutoff row, distortion level).
    w0: Box<[[f32; DIST_LEVELS]; FC_ROWS]>,

    /// Row selected by the cutoff register.
    w0_row: usize,
}

impl Filter6581 {
    pub(crate) fn new() -> Self {
        let mut filter = Self {
            common: FilterCommon::new(),
            attenuation: 0.64,
            nonlinearity: 3.3e6,
            baseresistance: 1_147_036.5,
            offset: 2.742_288e8,
            steepness: 1.006_663_4,
            minimumfetresistance: 16_125.155,
            voice_nonlinearity: 0.961_316_05,
            w0: Box::new([[0.0; DIST_LEVELS]; FC_ROWS]),
            w0_row: 0,
        };
        filter.recalculate();
        filter.updated_resonance();
        filter.updated_center_frequency();
        filter
    }

    /// Signal-dependent integrator gain.
    #[inline]
    fn type3_w0(&self, dist: f32) -> f32 {
        let row = &self.w0[self.w0_row];
        if dist < 0.0 {
            return row[0];
        }
        let index = (dist * W0_RESOLUTION) as usize;
        row[index.min(DIST_LEVELS - 1)]
    }

    /// Output inverter saturation: compress excursions above the
    /// nonlinearity threshold.
    #[inline]
    fn waveshaper1(&self, mut value: f32) -> f32 {
        if value > self.nonlinearity {
            value -= (value - self.nonlinearity) * 0.5;
        }
        value
    }

    /// SID clocking - 1 cycle.
    #[inline]
    pub(crate) fn clock(&mut self, voice1: f32, voice2: f32, voice3: f32, ext_in: f32) -> f32 {
        let (vi, vf) = self.common.route(voice1, voice2, voice3, ext_in);

        // The integrator gain tracks the signal level at each stage.
        let w0_bp = self.type3_w0(self.common.vbp);
        self.common.vlp -= self.common.vbp * w0_bp;
        let w0_hp = self.type3_w0(self.common.vhp);
        self.common.vbp -= self.common.vhp * w0_hp;
        self.common.vhp =
            (self.common.vbp * self.common.inv_q - self.common.vlp - vi) * self.attenuation;

        self.waveshaper1(self.common.mix(vf))
    }

    /// Update the voice DAC nonlinearity used for the cutoff curve.
    pub(crate) fn set_nonlinearity(&mut self, nonlinearity: f32) {
        self.voice_nonlinearity = nonlinearity;
        self.recalculate();
        self.updated_center_frequency();
    }

    pub(crate) fn set_clock_frequency(&mut self, clock: f64) {
        self.common.clock_frequency = clock;
        self.recalculate();
        self.updated_center_frequency();
    }

    /// Distortion properties: attenuation, nonlinearity, resonance factor.
    pub fn distortion_properties(&self) -> (f32, f32, f32) {
        (self.attenuation, self.nonlinearity, self.common.resonance_factor)
    }

    /// Set distortion properties. See [`Filter6581::distortion_properties`].
    pub fn set_distortion_properties(
        &mut self,
        attenuation: f32,
        nonlinearity: f32,
        resonance_factor: f32,
    ) {
        self.attenuation = attenuation;
        self.nonlinearity = nonlinearity;
        self.common.resonance_factor = resonance_factor;
        self.updated_resonance();
    }

    /// Curve properties: base resistance, offset, steepness, minimum FET
    /// resistance.
    pub fn curve_properties(&self) -> (f32, f32, f32, f32) {
        (
            self.baseresistance,
            self.offset,
            self.steepness,
            self.minimumfetresistance,
        )
    }

    /// Set curve properties. Flushes the integrator state, see
    /// [`Filter6581::curve_properties`].
    pub fn set_curve_properties(
        &mut self,
        baseresistance: f32,
        offset: f32,
        steepness: f32,
        minimumfetresistance: f32,
    ) {
        self.baseresistance = baseresistance;
        self.offset = offset;
        self.steepness = steepness;
        self.minimumfetresistance = minimumfetresistance;
        self.recalculate();
        self.updated_center_frequency();
    }

    // ------------------------------------------------------------------
    // Register functions.
    // ------------------------------------------------------------------

    pub(crate) fn write_fc_lo(&mut self, value: u8) {
        self.common.write_fc_lo(value);
        self.updated_center_frequency();
    }

    pub(crate) fn write_fc_hi(&mut self, value: u8) {
        self.common.write_fc_hi(value);
        self.updated_center_frequency();
    }

    pub(crate) fn write_res_filt(&mut self, value: u8) {
        self.common.write_res_filt(value);
        self.updated_resonance();
    }

    pub(crate) fn write_mode_vol(&mut self, value: u8) {
        self.common.write_mode_vol(value);
    }

    pub(crate) fn enable(&mut self, enable: bool) {
        self.common.enable(enable);
    }

    pub(crate) fn updated_center_frequency(&mut self) {
        self.w0_row = (self.common.fc >> 1) as usize;
    }

    /// Resonance tuned by ear: there is a small notch even in allpass mode
    /// and the resonance hump is about 8 dB.
    pub(crate) fn updated_resonance(&mut self) {
        self.common.inv_q =
            1.0 / (0.5 + self.common.resonance_factor * self.common.res as f32 / 18.0);
    }

    /// Rebuild the `w0` tables from the curve parameters.
    fn recalculate(&mut self) {
        let mut fc_base = [0.0f32; FC_ROWS];
        for (j, base) in fc_base.iter_mut().enumerate() {
            let fc_kink = kinked_dac((j as u32) << 1, self.voice_nonlinearity, 11);
            *base = self.offset / self.steepness.powf(fc_kink);
        }

        let mut dist_base = [0.0f32; DIST_LEVELS];
        for (i, base) in dist_base.iter_mut().enumerate() {
            let dist = if i > 0 { (i as f32 + 0.5) / W0_RESOLUTION } else { 0.0 };
            *base = 1.0 / self.steepness.powf(dist * OSC_TO_FC);
        }

        let inv_caps_freq = (1.0 / (SIDCAPS_6581 * self.common.clock_frequency)) as f32;

        // Flush the integrators: a curve change mid-stream would otherwise
        // overflow the feedback loop.
        self.common.flush_state();

        for (j, row) in self.w0.iter_mut().enumerate() {
            let fc_base_value = fc_base[j];
            for (i, w0) in row.iter_mut().enumerate() {
                let fetresistance = fc_base_value * dist_base[i];
                let dynamic_resistance = self.minimumfetresistance + fetresistance;

                // Base and FET resistances in parallel.
                let inv_resistance = (self.baseresistance + dynamic_resistance)
                    / (self.baseresistance * dynamic_resistance);
                *w0 = inv_caps_freq * inv_resistance;
            }
        }
    }

    pub(crate) fn zero_denormals(&mut self) {
        self.common.zero_denormals();
    }

    pub(crate) fn reset(&mut self) {
        self.common.reset();
        self.updated_resonance();
        self.updated_center_frequency();
    }
}

impl std::fmt::Debug for Filter6581 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter6581")
            .field("fc", &self.common.fc)
            .field("res", &self.common.res)
            .field("attenuation", &self.attenuation)
            .field("w0_row", &self.w0_row)
            .finish_non_exhaustive()
    }
}
