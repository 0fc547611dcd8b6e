//! Impulse-response catalog and the per-engine reverb cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::buffer::AudioBuffer;
use crate::dsp::ImpulseSpectra;

/// Impulse responses shipped with the data directory, as (file key, description).
/// The empty key means no reverb.
pub const REVERBS: &[(&str, &str)] = &[
    ("", "None"),
    ("ir.stalbans.wav", "The Lady Chapel, St Albans Cathedral"),
    ("ir.middle_tunnel.wav", "Innocent Railway Tunnel, Edinburgh"),
    ("ir.grange-centre.wav", "Grange stone circle, County Limerick"),
];

/// Description of a built-in reverb key.
pub fn reverb_description(key: &str) -> Option<&'static str> {
    REVERBS.iter().find(|(k, _)| *k == key).map(|(_, d)| *d)
}

/// A processed impulse response, ready to be connected to the output graph.
#[derive(Debug)]
pub struct ReverbUnit {
    file: String,
    spectra: Arc<ImpulseSpectra>,
}

impl ReverbUnit {
    /// Partition and normalize a decoded impulse response. CPU-heavy for long responses.
    pub fn from_impulse(file: impl Into<String>, impulse: &AudioBuffer) -> Self {
        Self {
            file: file.into(),
            spectra: Arc::new(ImpulseSpectra::new(impulse, true)),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn spectra(&self) -> Arc<ImpulseSpectra> {
        Arc::clone(&self.spectra)
    }
}

/// Append-only cache of reverb units keyed by file name.
///
/// Owned by one engine and shared across its sessions. A file is never loaded twice
/// concurrently and never stored twice.
#[derive(Debug, Default)]
pub struct ImpulseResponseCache {
    units: HashMap<String, Arc<ReverbUnit>>,
    loading: HashSet<String>,
}

impl ImpulseResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file: &str) -> Option<Arc<ReverbUnit>> {
        self.units.get(file).cloned()
    }

    /// Store a unit unless one already exists for its file; returns the cached unit.
    pub fn insert(&mut self, unit: ReverbUnit) -> Arc<ReverbUnit> {
        self.loading.remove(unit.file());
        let file = unit.file().to_string();
        Arc::clone(self.units.entry(file).or_insert_with(|| Arc::new(unit)))
    }

    /// Mark `file` as being fetched. Returns false when it is cached or already in flight.
    pub fn begin_load(&mut self, file: &str) -> bool {
        if self.units.contains_key(file) {
            return false;
        }
        self.loading.insert(file.to_string())
    }

    /// Forget an in-flight load that failed, so a later session may retry.
    pub fn abandon_load(&mut self, file: &str) {
        self.loading.remove(file);
    }

    pub fn is_loading(&self, file: &str) -> bool {
        self.loading.contains(file)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
