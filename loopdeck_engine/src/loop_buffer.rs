use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use loopdeck_shared::SampleId;
use rayon::prelude::*;

use crate::buffer::AudioBuffer;

/// Frame layout of a sample inside one loop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLayout {
    pub loop_frames: usize,
    pub offset_frame: usize,
    pub copied_frames: usize,
}

impl LoopLayout {
    pub fn compute(source_frames: usize, sample_rate: u32, x_pos: f64, loop_duration: f64) -> Self {
        let rate = sample_rate as f64;
        let loop_frames = (loop_duration * rate).ceil().max(0.0) as usize;
        let offset_frame = ((x_pos * loop_duration * rate).floor().max(0.0) as usize).min(loop_frames);
        let copied_frames = source_frames.min(loop_frames - offset_frame);
        Self {
            loop_frames,
            offset_frame,
            copied_frames,
        }
    }
}

/// One loop-length buffer holding `sample` at its offset and silence elsewhere.
///
/// The sample is truncated at the loop boundary; it never wraps. Pure: the same
/// inputs always produce the same buffer.
pub fn build(sample: &AudioBuffer, x_pos: f64, loop_duration: f64) -> AudioBuffer {
    let layout = LoopLayout::compute(sample.frames(), sample.sample_rate, x_pos, loop_duration);
    let mut out = AudioBuffer::silent(sample.channel_count(), layout.loop_frames, sample.sample_rate);

    let dst = layout.offset_frame..layout.offset_frame + layout.copied_frames;
    for (out_ch, src_ch) in out.channels.iter_mut().zip(&sample.channels) {
        out_ch[dst.clone()].copy_from_slice(&src_ch[..layout.copied_frames]);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    sample_id: SampleId,
    x_pos_bits: u64,
}

/// Loop buffers for one loop duration.
///
/// The whole map is dropped when a build asks for a different duration; there is
/// no per-entry eviction.
#[derive(Debug, Clone, Default)]
pub struct LoopBufferCache {
    duration_bits: Option<u64>,
    entries: HashMap<CacheKey, Arc<AudioBuffer>>,
}

/// A cache miss to fill: (sample, source buffer, offset).
pub type BuildRequest = (SampleId, Arc<AudioBuffer>, f64);

impl LoopBufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Duration the cached buffers were built for.
    pub fn duration(&self) -> Option<f64> {
        self.duration_bits.map(f64::from_bits)
    }

    pub fn get(&self, sample_id: SampleId, x_pos: f64) -> Option<Arc<AudioBuffer>> {
        self.entries
            .get(&CacheKey {
                sample_id,
                x_pos_bits: x_pos.to_bits(),
            })
            .cloned()
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.duration_bits = None;
    }

    fn retarget(&mut self, loop_duration: f64) {
        if self.duration_bits != Some(loop_duration.to_bits()) {
            if !self.entries.is_empty() {
                log::debug!(
                    "[LoopCache] Duration {:?} -> {:.3}s, dropping {} buffers",
                    self.duration(),
                    loop_duration,
                    self.entries.len()
                );
            }
            self.entries.clear();
            self.duration_bits = Some(loop_duration.to_bits());
        }
    }

    /// Builds every request not already cached, in parallel, and returns buffers
    /// in request order. Entries no request asked for are dropped, so a moved or
    /// removed placement does not leave its old buffer behind.
    pub fn get_or_build_all(&mut self, requests: &[BuildRequest], loop_duration: f64) -> Vec<Arc<AudioBuffer>> {
        self.retarget(loop_duration);

        let missing: Vec<&BuildRequest> = requests
            .iter()
            .filter(|(id, _, x)| self.get(*id, *x).is_none())
            .collect();
        let built: Vec<(CacheKey, Arc<AudioBuffer>)> = missing
            .par_iter()
            .map(|(id, src, x)| {
                let key = CacheKey {
                    sample_id: *id,
                    x_pos_bits: x.to_bits(),
                };
                (key, Arc::new(build(src, *x, loop_duration)))
            })
            .collect();
        self.entries.extend(built);

        let wanted: HashSet<CacheKey> = requests
            .iter()
            .map(|(id, _, x)| CacheKey {
                sample_id: *id,
                x_pos_bits: x.to_bits(),
            })
            .collect();
        self.entries.retain(|key, _| wanted.contains(key));

        requests
            .iter()
            .filter_map(|(id, _, x)| self.get(*id, *x))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize, sample_rate: u32) -> AudioBuffer {
        let ch: Vec<f32> = (0..frames).map(|i| (i + 1) as f32).collect();
        AudioBuffer::new(vec![ch.clone(), ch.iter().map(|v| -v).collect()], sample_rate)
    }

    #[test]
    fn places_sample_at_offset() {
        let src = ramp(3, 10);
        let out = build(&src, 0.5, 1.0);
        assert_eq!(out.frames(), 10);
        assert_eq!(out.channel_count(), 2);
        assert_eq!(out.sample_rate, 10);
        assert_eq!(out.channels[0], vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0]);
        assert_eq!(out.channels[1][5], -1.0);
    }

    #[test]
    fn truncates_at_loop_boundary_without_wrapping() {
        let src = ramp(6, 10);
        let out = build(&src, 0.75, 1.0);
        assert_eq!(out.channels[0], vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn length_uses_ceil_and_offset_uses_floor() {
        let layout = LoopLayout::compute(100, 44_100, 0.3, 1.000_01);
        assert_eq!(layout.loop_frames, 44_101);
        assert_eq!(layout.offset_frame, (0.3 * 1.000_01 * 44_100.0f64).floor() as usize);
        assert_eq!(layout.copied_frames, 100);
    }

    #[test]
    fn build_is_pure() {
        let src = ramp(1_000, 8_000);
        assert_eq!(build(&src, 0.25, 2.0), build(&src, 0.25, 2.0));
    }

    #[test]
    fn cache_survives_until_next_build_at_new_duration() {
        let mut cache = LoopBufferCache::new();
        let src = Arc::new(ramp(4, 10));
        let id = SampleId::new();
        let req = [(id, src.clone(), 0.0)];
        let first = cache.get_or_build_all(&req, 1.0);
        let again = cache.get_or_build_all(&req, 1.0);
        assert!(Arc::ptr_eq(&first[0], &again[0]));
        assert_eq!(cache.duration(), Some(1.0));

        let rebuilt = cache.get_or_build_all(&req, 2.0);
        assert_eq!(rebuilt[0].frames(), 20);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.duration(), Some(2.0));
    }

    #[test]
    fn moved_placement_replaces_its_old_buffer() {
        let mut cache = LoopBufferCache::new();
        let src = Arc::new(ramp(4, 100));
        let (id, other) = (SampleId::new(), SampleId::new());
        for step in 0..50 {
            let x = step as f64 / 50.0;
            cache.get_or_build_all(&[(id, src.clone(), x), (other, src.clone(), 0.5)], 1.0);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(id, 49.0 / 50.0).is_some());
        assert!(cache.get(id, 0.0).is_none());
        assert!(cache.get(other, 0.5).is_some());

        cache.get_or_build_all(&[(other, src, 0.5)], 1.0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn parallel_builds_follow_request_order() {
        let mut cache = LoopBufferCache::new();
        let a = Arc::new(ramp(2, 10));
        let b = Arc::new(ramp(3, 10));
        let (ia, ib) = (SampleId::new(), SampleId::new());
        let reqs = vec![(ia, a.clone(), 0.0), (ib, b.clone(), 0.5)];
        let out = cache.get_or_build_all(&reqs, 1.0);
        assert_eq!(out.len(), 2);
        assert_eq!(*out[0], build(&a, 0.0, 1.0));
        assert_eq!(*out[1], build(&b, 0.5, 1.0));
        assert_eq!(cache.len(), 2);
    }
}
