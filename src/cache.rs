//! Shared build-once table caches
//!
//! Waveform tables and FIR banks are expensive to build but derived from a
//! very small set of configurations, so they are built once per distinct
//! key and shared. The cache object is explicit and injectable: chips
//! created with [`crate::Sid::new`] share the process-wide instance, while
//! [`crate::Sid::with_cache`] accepts a private one (useful for tests or to
//! control cache lifetime). Only construction is synchronized; concurrent
//! lookups during a build block until the entry exists and the first caller
//! per key pays the construction cost.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::resampler::{FirKey, FirTable};
use crate::wavetable::WaveformTables;
use crate::ChipModel;

/// Waveform table cache key: chip model and DAC nonlinearity bit pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct WaveformKey {
    model: ChipModel,
    nonlinearity: u32,
}

/// Process-wide (or injected) cache of waveform tables and FIR banks.
pub struct TableCache {
    waveform: Mutex<HashMap<WaveformKey, Arc<WaveformTables>>>,
    fir: Mutex<HashMap<FirKey, Arc<FirTable>>>,
}

impl TableCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            waveform: Mutex::new(HashMap::new()),
            fir: Mutex::new(HashMap::new()),
        }
    }

    /// The shared process-wide cache used by [`crate::Sid::new`].
    pub fn global() -> &'static Arc<TableCache> {
        static GLOBAL: OnceLock<Arc<TableCache>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(TableCache::new()))
    }

    /// Fetch (building on first use) the waveform tables for a chip model
    /// and DAC nonlinearity.
    pub(crate) fn waveform_tables(
        &self,
        model: ChipModel,
        nonlinearity: f32,
    ) -> Arc<WaveformTables> {
        let key = WaveformKey {
            model,
            nonlinearity: nonlinearity.to_bits(),
        };
        let mut map = self.waveform.lock();
        Arc::clone(
            map.entry(key)
                .or_insert_with(|| Arc::new(WaveformTables::build(model, nonlinearity))),
        )
    }

    /// Fetch (building on first use) a FIR bank.
    pub(crate) fn fir_table(
        &self,
        key: FirKey,
        build: impl FnOnce() -> FirTable,
    ) -> Arc<FirTable> {
        let mut map = self.fir.lock();
        Arc::clone(map.entry(key).or_insert_with(|| Arc::new(build())))
    }
}

impl Default for TableCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCache")
            .field("waveform_entries", &self.waveform.lock().len())
            .field("fir_entries", &self.fir.lock().len())
            .finish()
    }
}
