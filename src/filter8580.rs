//! 8580 filter
//!
//! The 8580 cutoff curve is close to linear in the register value and the
//! integrators behave like proper op-amps, so a simple `k * fc + b` fit of
//! the cutoff frequency suffices and no output waveshaper is needed.

use std::f64::consts::PI;

use crate::filter::FilterCommon;

/// MOS 8580 filter.
pub struct Filter8580 {
    pub(crate) common: FilterCommon,

    /* Type 4 curve params */
    k: f32,
    b: f32,

    /// Cached integrator gain for the current cutoff register.
    w0: f32,
}

impl Filter8580 {
    pub(crate) fn new() -> Self {
        let mut filter = Self {
            common: FilterCommon::new(),
            k: 6.55,
            b: 20.0,
            w0: 0.0,
        };
        filter.updated_resonance();
        filter.updated_center_frequency();
        filter
    }

    /// SID clocking - 1 cycle.
    #[inline]
    pub(crate) fn clock(&mut self, voice1: f32, voice2: f32, voice3: f32, ext_in: f32) -> f32 {
        let (vi, vf) = self.common.route(voice1, voice2, voice3, ext_in);

        let c = &mut self.common;
        c.vlp -= c.vbp * self.w0;
        c.vbp -= c.vhp * self.w0;
        c.vhp = c.vbp * c.inv_q - c.vlp - vi;

        self.common.mix(vf)
    }

    pub(crate) fn set_clock_frequency(&mut self, clock: f64) {
        self.common.clock_frequency = clock;
        self.updated_center_frequency();
    }

    /// Curve properties: the linear cutoff fit `freq = k * fc + b`.
    pub fn curve_properties(&self) -> (f32, f32) {
        (self.k, self.b)
    }

    /// Set curve properties. Flushes the integrator state, see
    /// [`Filter8580::curve_properties`].
    pub fn set_curve_properties(&mut self, k: f32, b: f32) {
        self.k = k;
        self.b = b;
        self.common.flush_state();
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
        let freq = self.k * self.common.fc as f32 + self.b;
        self.w0 = (2.0 * PI * freq as f64 / self.common.clock_frequency) as f32;
    }

    pub(crate) fn updated_resonance(&mut self) {
        self.common.inv_q =
            1.0 / (0.707 + self.common.resonance_factor * self.common.res as f32 / 15.0);
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

impl std::fmt::Debug for Filter8580 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter8580")
            .field("fc", &self.common.fc)
            .field("res", &self.common.res)
            .field("k", &self.k)
            .field("b", &self.b)
            .field("w0", &self.w0)
            .finish_non_exhaustive()
    }
}
