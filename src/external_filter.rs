//! External RC output network
//!
//! Off-chip, the SID output passes through a fixed low-pass (R = 10 kOhm,
//! C = 1000 pF) and a coupling high-pass (R = 1 kOhm, C = 10 uF). The
//! low-pass takes the edge off sampling noise above ~16 kHz, the high-pass
//! removes the DC operating point.

use crate::filter::DEFAULT_CLOCK_FREQUENCY;

/// Fixed external RC filter stage.
#[derive(Clone, Debug)]
pub(crate) struct ExternalFilter {
    vlp: f32,
    vhp: f32,

    /// Per-cycle integrator gains, 1/(RC * clock).
    w0lp: f32,
    w0hp: f32,
}

impl ExternalFilter {
    pub(crate) fn new() -> Self {
        let mut filter = Self {
            vlp: 0.0,
            vhp: 0.0,
            w0lp: 0.0,
            w0hp: 0.0,
        };
        filter.set_clock_frequency(DEFAULT_CLOCK_FREQUENCY);
        filter
    }

    /// SID clocking - 1 cycle.
    #[inline]
    pub(crate) fn clock(&mut self, vi: f32) -> f32 {
        let dvlp = self.w0lp * (vi - self.vlp);
        let dvhp = self.w0hp * (self.vlp - self.vhp);
        self.vlp += dvlp;
        self.vhp += dvhp;
        self.vlp - self.vhp
    }

    pub(crate) fn set_clock_frequency(&mut self, clock_frequency: f64) {
        // Low-pass:  w0 = 1/RC = 1/(10e3 * 1000e-12) = 100000
        // High-pass: w0 = 1/RC = 1/(1e3 * 10e-6)     = 100
        self.w0lp = (100_000.0 / clock_frequency) as f32;
        self.w0hp = (100.0 / clock_frequency) as f32;
    }

    pub(crate) fn zero_denormals(&mut self) {
        if self.vlp > -1e-12 && self.vlp < 1e-12 {
            self.vlp = 0.0;
        }
        if self.vhp > -1e-12 && self.vhp < 1e-12 {
            self.vhp = 0.0;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.vlp = 0.0;
        self.vhp = 0.0;
    }
}
