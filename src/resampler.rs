//! Chip-rate to output-rate sample conversion
//!
//! Two interchangeable strategies. `Decimator` simply emits the chip sample
//! nearest each output sample boundary - cheap and aliasing-prone.
//! `SincResampler` is the theoretically correct conversion: a bank of
//! phase-shifted Kaiser-windowed sinc FIR kernels convolved against a ring
//! buffer of raw chip samples, as described in "A Flexible Sampling-Rate
//! Conversion Method" (J. O. Smith, P. Gosset) and the Digital Audio
//! Resampling Home Page. Building shifted tables per sub-phase removes the
//! interpolation from the inner loop without loss of accuracy.

use std::sync::Arc;

use crate::{SidError, TableCache};

/// Ring buffer capacity; bounds the maximum convolution length.
pub(crate) const RING_SIZE: usize = 2048;

/// We do not care about accurate reproduction above this frequency, which
/// widens the transition band and shortens the FIR accordingly.
const MAXIMUM_AUDIBLE_FREQUENCY: f64 = 20_000.0;

/// Maximum error acceptable in I0: 1e-6, or about 96 dB.
const I0E: f64 = 1e-6;

/// 0th order modified Bessel function of the first kind, used to build the
/// Kaiser window. Originally from resample-1.5/filterkit.c by J. O. Smith.
fn i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut u = 1.0;
    let mut n = 1.0;
    let halfx = x / 2.0;

    loop {
        let temp = halfx / n;
        u *= temp * temp;
        sum += u;
        n += 1.0;
        if u < I0E * sum {
            break;
        }
    }

    sum
}

/// A bank of sub-phase FIR tables for one sampling configuration.
pub(crate) struct FirTable {
    /// `fir_res` rows of `fir_n` coefficients.
    rows: Vec<Vec<f32>>,
    fir_n: usize,
    fir_res: usize,
}

/// Cache key for a FIR table: convolution length, sub-phase count, cutoff
/// and half-cycles-per-sample (bit patterns, the values are derived
/// deterministically from the sampling parameters).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FirKey {
    fir_n: usize,
    fir_res: usize,
    wc: u64,
    half_cycles_per_sample: u64,
}

/// Everything needed to build (or look up) the FIR bank.
#[derive(Debug)]
struct FirSpec {
    fir_n: usize,
    fir_res: usize,
    beta: f64,
    i0_beta: f64,
    wc: f64,
    half_cycles_per_sample: f64,
}

impl FirSpec {
    fn key(&self) -> FirKey {
        FirKey {
            fir_n: self.fir_n,
            fir_res: self.fir_res,
            wc: self.wc.to_bits(),
            half_cycles_per_sample: self.half_cycles_per_sample.to_bits(),
        }
    }

    /// Compute the Kaiser-windowed sinc coefficient tables.
    fn build(&self) -> FirTable {
        let half_n = (self.fir_n / 2) as f64;
        let scale = self.wc / self.half_cycles_per_sample / std::f64::consts::PI;

        let mut rows = Vec::with_capacity(self.fir_res);
        for i in 0..self.fir_res {
            let j_phase = i as f64 / self.fir_res as f64 + half_n;
            let mut row = Vec::with_capacity(self.fir_n);
            for j in 0..self.fir_n {
                let x = j as f64 - j_phase;

                let xt = x / half_n;
                let kaiser = if xt.abs() < 1.0 {
                    i0(self.beta * (1.0 - xt * xt).sqrt()) / self.i0_beta
                } else {
                    0.0
                };

                let wt = self.wc * x / self.half_cycles_per_sample;
                let sinc = if wt.abs() >= 1e-8 { wt.sin() / wt } else { 1.0 };

                row.push((scale * sinc * kaiser) as f32);
            }
            rows.push(row);
        }

        log::debug!(
            "built FIR table: length {}, {} subphases",
            self.fir_n,
            self.fir_res
        );
        FirTable {
            rows,
            fir_n: self.fir_n,
            fir_res: self.fir_res,
        }
    }
}

/// Derive the FIR dimensions for a sampling configuration, or fail if the
/// configuration cannot be satisfied.
fn design_fir(
    clock_frequency: f64,
    sampling_frequency: f64,
    highest_accurate_frequency: f64,
) -> Result<FirSpec, SidError> {
    // Allow specifying at most 90% of the passband to limit the CPU time
    // spent on resampling.
    if 2.0 * highest_accurate_frequency / sampling_frequency > 0.95 {
        return Err(SidError::PassbandTooNarrow {
            highest_accurate_frequency,
            sampling_frequency,
        });
    }

    // 16 bits -> -96 dB stopband attenuation.
    let attenuation = -20.0 * (1.0 / f64::from(1u32 << 16)).log10();

    // For beta and N see the kaiserord function reference in the MATLAB
    // Signal Processing Toolbox.
    let beta = 0.1102 * (attenuation - 8.7);
    let i0_beta = i0(beta);
    let half_cycles_per_sample = clock_frequency / sampling_frequency / 2.0;

    // Widen the transition band to allow aliasing down to the specified
    // highest correctly reproduced frequency.
    let aliasing_allowance =
        (sampling_frequency / 2.0 - MAXIMUM_AUDIBLE_FREQUENCY).max(0.0);
    let transition_bandwidth =
        sampling_frequency / 2.0 - highest_accurate_frequency + aliasing_allowance;

    // The filter order equals the number of zero crossings and must be
    // even (sinc is symmetric about x = 0); the length must be odd.
    let mut order = ((attenuation - 7.95)
        / (2.0 * std::f64::consts::PI * 2.285 * transition_bandwidth / sampling_frequency)
        + 0.5) as usize;
    order += order & 1;

    let mut fir_n = (order as f64 * half_cycles_per_sample) as usize + 1;
    fir_n |= 1;

    if fir_n > RING_SIZE - 1 {
        return Err(SidError::FirLengthOverflow {
            fir_length: fir_n,
            capacity: RING_SIZE - 1,
        });
    }

    // Error is bound by 1.234 / L^2, so for 16 bits: sqrt(1.234 * 2^16).
    let fir_res =
        ((1.234 * f64::from(1u32 << 16)).sqrt() / half_cycles_per_sample + 0.5) as usize;

    // The cutoff frequency is midway through the transition band.
    let wc = (highest_accurate_frequency + transition_bandwidth / 2.0) / sampling_frequency
        * std::f64::consts::PI
        * 2.0;

    Ok(FirSpec {
        fir_n,
        fir_res,
        beta,
        i0_beta,
        wc,
        half_cycles_per_sample,
    })
}

/// Fractional output-sample scheduler shared by both strategies.
#[derive(Clone, Debug)]
struct SampleScheduler {
    cycles_per_sample: f32,
    /// Sub-cycle phase of the upcoming sample, [0, 1[.
    sample_offset: f32,
    cycles_until_sample: u32,
}

impl SampleScheduler {
    fn new(clock_frequency: f64, sampling_frequency: f64) -> Self {
        let mut scheduler = Self {
            cycles_per_sample: (clock_frequency / sampling_frequency) as f32,
            sample_offset: 0.0,
            cycles_until_sample: 0,
        };
        scheduler.schedule();
        scheduler
    }

    /// Schedule the next output sample and keep the residual phase.
    fn schedule(&mut self) {
        let next_sample_offset = self.sample_offset + self.cycles_per_sample;
        self.cycles_until_sample = next_sample_offset as u32;
        self.sample_offset = next_sample_offset - self.cycles_until_sample as f32;
    }

    /// Count down one chip cycle; true when this cycle produces a sample.
    #[inline]
    fn tick(&mut self) -> bool {
        self.cycles_until_sample -= 1;
        self.cycles_until_sample == 0
    }
}

/// Nearest-sample decimation.
#[derive(Clone, Debug)]
pub(crate) struct Decimator {
    scheduler: SampleScheduler,
}

impl Decimator {
    pub(crate) fn new(clock_frequency: f64, sampling_frequency: f64) -> Self {
        Self {
            scheduler: SampleScheduler::new(clock_frequency, sampling_frequency),
        }
    }

    #[inline]
    pub(crate) fn input(&mut self, sample: f32) -> Option<f32> {
        if !self.scheduler.tick() {
            return None;
        }
        self.scheduler.schedule();
        Some(sample)
    }
}

/// Kaiser-windowed sinc resampling against a ring buffer of chip samples.
pub(crate) struct SincResampler {
    fir: Arc<FirTable>,
    scheduler: SampleScheduler,

    /// Samples stored twice for contiguous convolution windows.
    ring: Box<[f32; RING_SIZE * 2]>,
    /// Index of the next unused ring slot.
    index: usize,
}

impl SincResampler {
    /// Design (or fetch from `cache`) the FIR bank for this configuration.
    pub(crate) fn new(
        clock_frequency: f64,
        sampling_frequency: f64,
        highest_accurate_frequency: f64,
        cache: &TableCache,
    ) -> Result<Self, SidError> {
        let spec = design_fir(
            clock_frequency,
            sampling_frequency,
            highest_accurate_frequency,
        )?;
        let fir = cache.fir_table(spec.key(), || spec.build());

        Ok(Self {
            fir,
            scheduler: SampleScheduler::new(clock_frequency, sampling_frequency),
            ring: Box::new([0.0; RING_SIZE * 2]),
            index: 0,
        })
    }

    #[inline]
    pub(crate) fn input(&mut self, sample: f32) -> Option<f32> {
        self.ring[self.index] = sample;
        self.ring[self.index + RING_SIZE] = sample;
        self.index = self.index + 1 & RING_SIZE - 1;

        if !self.scheduler.tick() {
            return None;
        }

        let output = self.compute_output();
        self.scheduler.schedule();
        Some(output)
    }

    /// Convolve the two nearest sub-phase tables and interpolate linearly
    /// between them by the residual phase fraction.
    fn compute_output(&self) -> f32 {
        let fir_table_offset = self.scheduler.sample_offset * self.fir.fir_res as f32;
        let mut fir_table_first = fir_table_offset as usize;
        let fraction = fir_table_offset - fir_table_first as f32;

        // The most recent fir_n samples, plus one extra in case the FIR
        // wraps to the first table.
        let mut sample_start = self.index + RING_SIZE - self.fir.fir_n - 1;

        let v1 = convolve(
            &self.ring[sample_start..sample_start + self.fir.fir_n],
            &self.fir.rows[fir_table_first],
        );
        fir_table_first += 1;
        if fir_table_first == self.fir.fir_res {
            fir_table_first = 0;
            sample_start += 1;
        }
        let v2 = convolve(
            &self.ring[sample_start..sample_start + self.fir.fir_n],
            &self.fir.rows[fir_table_first],
        );

        v1 + fraction * (v2 - v1)
    }
}

#[inline]
fn convolve(samples: &[f32], coefficients: &[f32]) -> f32 {
    samples
        .iter()
        .zip(coefficients)
        .map(|(sample, coefficient)| sample * coefficient)
        .sum()
}

/// The active sample-production strategy of a chip instance.
pub(crate) enum Resampler {
    Decimate(Decimator),
    Sinc(Box<SincResampler>),
}

impl Resampler {
    /// Offer one chip-rate sample; returns an output-rate sample when a
    /// sample boundary was crossed.
    #[inline]
    pub(crate) fn input(&mut self, sample: f32) -> Option<f32> {
        match self {
            Resampler::Decimate(decimator) => decimator.input(sample),
            Resampler::Sinc(sinc) => sinc.input(sample),
        }
    }
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resampler::Decimate(decimator) => std::fmt::Debug::fmt(decimator, f),
            Resampler::Sinc(sinc) => f
                .debug_struct("SincResampler")
                .field("fir_n", &sinc.fir.fir_n)
                .field("fir_res", &sinc.fir.fir_res)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAL_CLOCK: f64 = 985_248.0;

    #[test]
    fn test_decimator_emission_rate() {
        let mut decimator = Decimator::new(PAL_CLOCK, 44_100.0);
        let cycles = 985_248;
        let mut produced = 0usize;
        for _ in 0..cycles {
            if decimator.input(0.0).is_some() {
                produced += 1;
            }
        }
        // One second of cycles yields one second of samples.
        assert!((produced as i64 - 44_100).abs() <= 1, "{produced}");
    }

    #[test]
    fn test_passband_too_narrow_rejected() {
        let err = design_fir(PAL_CLOCK, 44_100.0, 21_500.0).unwrap_err();
        assert!(matches!(err, SidError::PassbandTooNarrow { .. }));
    }

    #[test]
    fn test_fir_overflow_rejected() {
        // Very low output rates blow through the ring buffer.
        let err = design_fir(PAL_CLOCK, 8_000.0, 3_700.0).unwrap_err();
        assert!(matches!(err, SidError::FirLengthOverflow { .. }));
    }

    #[test]
    fn test_fir_dimensions_within_bounds() {
        let spec = design_fir(PAL_CLOCK, 44_100.0, 20_000.0).unwrap();
        assert!(spec.fir_n % 2 == 1, "FIR length must be odd");
        assert!(spec.fir_n <= RING_SIZE - 1);
        assert!(spec.fir_res > 0);
    }

    #[test]
    fn test_kaiser_window_peak_is_center() {
        let spec = design_fir(PAL_CLOCK, 44_100.0, 20_000.0).unwrap();
        let table = spec.build();
        let row = &table.rows[0];
        let peak_index = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
            .unwrap()
            .0;
        let center = table.fir_n / 2;
        assert!(
            (peak_index as i64 - center as i64).abs() <= 1,
            "peak {peak_index} should sit at the center {center}"
        );
    }

    #[test]
    fn test_sinc_passband_magnitude() {
        // A pure tone below the highest accurate frequency must come
        // through within +/- 0.5 dB.
        let sampling_frequency = 44_100.0;
        let tone = 1000.0;
        let cache = TableCache::new();
        let mut resampler =
            SincResampler::new(PAL_CLOCK, sampling_frequency, 20_000.0, &cache).unwrap();

        let mut output = Vec::new();
        let cycles = PAL_CLOCK as usize / 2;
        for cycle in 0..cycles {
            let t = cycle as f64 / PAL_CLOCK;
            let sample = (2.0 * std::f64::consts::PI * tone * t).sin() as f32;
            if let Some(out) = resampler.input(sample) {
                output.push(out);
            }
        }

        // Correlate against the tone over an integer number of periods,
        // skipping the FIR warmup.
        let warmup = 2048;
        let periods = ((output.len() - warmup) as f64 * tone / sampling_frequency).floor();
        let span = (periods * sampling_frequency / tone) as usize;
        let mut sin_sum = 0.0f64;
        let mut cos_sum = 0.0f64;
        for (i, &sample) in output[warmup..warmup + span].iter().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * tone * i as f64 / sampling_frequency;
            sin_sum += f64::from(sample) * phase.sin();
            cos_sum += f64::from(sample) * phase.cos();
        }
        let magnitude = 2.0 * (sin_sum * sin_sum + cos_sum * cos_sum).sqrt() / span as f64;

        let db = 20.0 * magnitude.log10();
        assert!(
            db.abs() < 0.5,
            "passband magnitude off by {db} dB (amplitude {magnitude})"
        );
    }
}
