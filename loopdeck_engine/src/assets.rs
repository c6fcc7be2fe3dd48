use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use loopdeck_shared::{SampleId, SampleProvenance};

use crate::buffer::{AudioBuffer, Sample};

/// Decode state of a pooled sample.
#[derive(Debug, Clone)]
pub enum SampleEntry {
    /// Registered, decode still in flight.
    Pending { filename: String },
    Ready(Sample),
    /// Decoding failed; the sample is skipped by every scheduling pass.
    Failed { filename: String, reason: String },
}

/// Every sample known to the session, keyed by id.
///
/// Shared with the render side as `Arc<ArcSwap<SamplePool>>`: writers clone,
/// modify, and store a new pool so readers never wait.
#[derive(Debug, Clone, Default)]
pub struct SamplePool {
    entries: HashMap<SampleId, SampleEntry>,
}

pub type SharedPool = Arc<ArcSwap<SamplePool>>;

pub fn shared_pool() -> SharedPool {
    Arc::new(ArcSwap::from_pointee(SamplePool::new()))
}

impl SamplePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: SampleId) -> Option<&SampleEntry> {
        self.entries.get(&id)
    }

    /// The sample when it is decoded and playable.
    pub fn ready(&self, id: SampleId) -> Option<&Sample> {
        match self.entries.get(&id) {
            Some(SampleEntry::Ready(sample)) => Some(sample),
            _ => None,
        }
    }

    pub fn mark_pending(&mut self, id: SampleId, filename: impl Into<String>) {
        self.entries.insert(
            id,
            SampleEntry::Pending {
                filename: filename.into(),
            },
        );
    }

    pub fn insert(&mut self, sample: Sample) {
        log::info!(
            "[SamplePool] Ready {} ({}): {:.3}s, {} ch @ {} Hz",
            sample.filename,
            sample.id,
            sample.duration_seconds(),
            sample.buffer.channel_count(),
            sample.buffer.sample_rate
        );
        self.entries.insert(sample.id, SampleEntry::Ready(sample));
    }

    pub fn mark_failed(&mut self, id: SampleId, filename: impl Into<String>, reason: impl Into<String>) {
        let filename = filename.into();
        let reason = reason.into();
        log::error!("[SamplePool] Decode failed for {} ({}): {}", filename, id, reason);
        self.entries.insert(id, SampleEntry::Failed { filename, reason });
    }

    /// Create a sample from raw PCM (recordings, restored sessions).
    pub fn add_from_buffer(
        &mut self,
        id: SampleId,
        filename: impl Into<String>,
        provenance: SampleProvenance,
        buffer: AudioBuffer,
    ) -> Sample {
        let sample = Sample::new(id, filename, provenance, buffer);
        self.insert(sample.clone());
        sample
    }

    pub fn remove(&mut self, id: SampleId) -> Option<SampleEntry> {
        self.entries.remove(&id)
    }

    /// Ready samples loaded from a file or remote storage, which a saved
    /// session refers to instead of embedding.
    pub fn sources(&self) -> Vec<&Sample> {
        let mut out: Vec<&Sample> = self
            .entries
            .values()
            .filter_map(|e| match e {
                SampleEntry::Ready(s) if s.provenance != SampleProvenance::Recording => Some(s),
                _ => None,
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Ready samples that came from the microphone.
    pub fn recordings(&self) -> Vec<&Sample> {
        let mut out: Vec<&Sample> = self
            .entries
            .values()
            .filter_map(|e| match e {
                SampleEntry::Ready(s) if s.provenance == SampleProvenance::Recording => Some(s),
                _ => None,
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

/// Read-copy-update on a shared pool.
pub fn update_pool(pool: &SharedPool, f: impl FnOnce(&mut SamplePool)) {
    let current = pool.load();
    let mut next = (**current).clone();
    f(&mut next);
    pool.store(Arc::new(next));
}
