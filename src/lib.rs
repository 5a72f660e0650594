//! MOS 6581/8580 SID Emulator Engine
//!
//! A cycle-accurate emulator of the MOS Technology 6581/8580 Sound Interface
//! Device as used in the Commodore 64. The engine reproduces the analog
//! quirks of the real silicon: empirically fitted "combined" waveforms, the
//! ADSR delay bug, R-2R DAC nonlinearity and the voltage-dependent filter
//! distortion of the 6581.
//!
//! # Features
//! - 3 voices with 24-bit phase accumulators, hard sync and ring modulation
//! - 23-bit noise shift register clocked by accumulator bit 19
//! - ADSR envelope generators including the hardware rate-counter delay bug
//! - Two-integrator-loop filter with per-model distortion (6581/8580)
//! - External RC output network
//! - Decimating and Kaiser-windowed sinc resampling to any output rate
//! - Shared, build-once waveform and FIR table caches for multi-chip setups
//!
//! # Crate feature flags
//! - `serde` (optional): `Serialize`/`Deserialize` on the configuration enums
//! - `export-wav` (optional): render a clocked chip to a WAV file via hound
//!
//! # Quick start
//! ```
//! use residfp::{ChipModel, SamplingMethod, Sid};
//!
//! let mut sid = Sid::new(ChipModel::Mos6581);
//! sid.set_sampling_parameters(985_248.0, SamplingMethod::Decimate, 44_100.0, 20_000.0)
//!     .unwrap();
//!
//! // 440 Hz pulse on voice 1, full sustain
//! sid.write(0x00, 0x45); // FREQ LO
//! sid.write(0x01, 0x1d); // FREQ HI
//! sid.write(0x02, 0x00); // PW LO
//! sid.write(0x03, 0x08); // PW HI (50%)
//! sid.write(0x05, 0x00); // attack/decay
//! sid.write(0x06, 0xf0); // sustain/release
//! sid.write(0x04, 0x41); // pulse + gate
//!
//! let mut buf = vec![0.0f32; 1024];
//! let produced = sid.clock(20_000, &mut buf, 0);
//! assert!(produced > 0);
//! ```

#![warn(missing_docs)]

mod cache;
mod chip;
mod dac;
mod envelope;
mod external_filter;
mod filter;
mod filter6581;
mod filter8580;
mod resampler;
mod voice;
mod wavetable;

pub mod waveform;

#[cfg(feature = "export-wav")]
pub mod export;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// SID chip model.
///
/// The two production revisions differ audibly: the 6581 has a strongly
/// nonlinear DAC and a distorting filter, the 8580 is close to ideal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChipModel {
    /// Original NMOS chip (C64 "breadbin" era).
    Mos6581,
    /// HMOS-II revision (C64C era).
    Mos8580,
}

/// Output sample generation strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SamplingMethod {
    /// Emit the nearest chip-rate sample at each output sample boundary.
    /// Cheap, but aliases.
    Decimate,
    /// Kaiser-windowed sinc resampling with ~96 dB stopband attenuation.
    Resample,
}

/// Error type for SID engine configuration.
///
/// Only sampling configuration can fail; register writes accept any byte,
/// as on hardware.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SidError {
    /// The requested passband exceeds 95% of the output Nyquist frequency.
    #[error(
        "requested passband is too narrow: {highest_accurate_frequency} Hz exceeds 95% of the \
         Nyquist frequency for {sampling_frequency} Hz output; raise the sampling frequency or \
         lower the highest accurate frequency"
    )]
    PassbandTooNarrow {
        /// Caller-specified highest accurately reproduced frequency in Hz.
        highest_accurate_frequency: f64,
        /// Requested output sampling frequency in Hz.
        sampling_frequency: f64,
    },

    /// The FIR kernel for the requested configuration would not fit the
    /// resampler ring buffer.
    #[error("FIR length {fir_length} exceeds the resampler ring buffer capacity {capacity}")]
    FirLengthOverflow {
        /// Computed FIR convolution length in samples.
        fir_length: usize,
        /// Maximum supported length.
        capacity: usize,
    },

    /// WAV rendering failed.
    #[cfg(feature = "export-wav")]
    #[error("WAV export failed: {0}")]
    Export(String),
}

/// Result type for engine configuration operations.
pub type Result<T> = std::result::Result<T, SidError>;

// Public API exports
pub use cache::TableCache;
pub use chip::Sid;
pub use filter6581::Filter6581;
pub use filter8580::Filter8580;
pub use waveform::Control;
