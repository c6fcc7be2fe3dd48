//! Turns the placed-sample list into timed playback sources.
//!
//! Two strategies share the same routing through [`TrackGraphRegistry`]:
//! - [`PlaybackStrategy::Retrigger`]: every transport boundary stops the
//!   previous sources and schedules fresh one-shots at `now + x_pos * duration`.
//! - [`PlaybackStrategy::NativeLoop`]: each placement gets a loop-length buffer
//!   with the sample already at its offset; the source repeats on its own until
//!   a tempo change forces a rebuild.
//!
//! Native-loop buffers are built by a [`LoopJob`], which owns everything it
//! needs and may run on any thread. Its [`PreparedLoop`] is committed back on the
//! render side, where a superseded generation is dropped.

use std::collections::HashSet;
use std::sync::Arc;

use loopdeck_shared::{PlacedSample, SampleId};
use petgraph::stable_graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::assets::{SampleEntry, SamplePool};
use crate::buffer::AudioBuffer;
use crate::context::AudioContext;
use crate::loop_buffer::{BuildRequest, LoopBufferCache};
use crate::nodes::BufferSourceNode;
use crate::registry::TrackGraphRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStrategy {
    #[default]
    Retrigger,
    NativeLoop,
}

/// A source the scheduler created and still owns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveSource {
    /// Never reused, unlike `node`, whose slot the graph hands out again.
    pub id: u64,
    pub node: NodeIndex,
    pub sample_id: SampleId,
    pub track_id: u32,
    /// Scheduled start on the audio clock, in seconds.
    pub start_time: f64,
}

#[derive(Debug, Clone)]
struct PreparedVoice {
    sample_id: SampleId,
    track_id: u32,
    buffer: Arc<AudioBuffer>,
}

/// A native-loop build detached from the scheduler. `run` is pure and may be
/// sent to a worker thread.
#[derive(Debug)]
pub struct LoopJob {
    generation: u64,
    loop_duration: f64,
    requests: Vec<BuildRequest>,
    tracks: Vec<u32>,
    cache: LoopBufferCache,
}

impl LoopJob {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn run(self) -> PreparedLoop {
        let LoopJob {
            generation,
            loop_duration,
            requests,
            tracks,
            mut cache,
        } = self;
        let buffers = cache.get_or_build_all(&requests, loop_duration);
        let voices = requests
            .iter()
            .zip(tracks)
            .zip(buffers)
            .map(|(((sample_id, _, _), track_id), buffer)| PreparedVoice {
                sample_id: *sample_id,
                track_id,
                buffer,
            })
            .collect();

        PreparedLoop {
            generation,
            loop_duration,
            voices,
            cache,
        }
    }
}

/// Loop buffers built for one rebuild request, plus the cache they came from.
#[derive(Debug, Clone)]
pub struct PreparedLoop {
    generation: u64,
    loop_duration: f64,
    voices: Vec<PreparedVoice>,
    cache: LoopBufferCache,
}

impl PreparedLoop {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loop_duration(&self) -> f64 {
        self.loop_duration
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    active: Vec<ActiveSource>,
    cache: LoopBufferCache,
    generation: u64,
    next_source_id: u64,
    reported_failures: HashSet<SampleId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_sources(&self) -> &[ActiveSource] {
        &self.active
    }

    pub fn cache(&self) -> &LoopBufferCache {
        &self.cache
    }

    pub fn invalidate_cache(&mut self) {
        self.cache.invalidate();
    }

    fn track_source(&mut self, node: NodeIndex, sample_id: SampleId, track_id: u32, start_time: f64) {
        self.next_source_id += 1;
        self.active.push(ActiveSource {
            id: self.next_source_id,
            node,
            sample_id,
            track_id,
            start_time,
        });
    }

    /// Decoded buffer for a placement, or `None` when it must sit this pass out.
    fn playable(&mut self, pool: &SamplePool, placed: &PlacedSample) -> Option<Arc<AudioBuffer>> {
        match pool.entry(placed.sample_id) {
            Some(SampleEntry::Ready(sample)) => Some(sample.buffer.clone()),
            Some(SampleEntry::Pending { filename }) => {
                log::debug!("[Scheduler] {} still decoding, skipped this pass", filename);
                None
            }
            Some(SampleEntry::Failed { filename, reason }) => {
                if self.reported_failures.insert(placed.sample_id) {
                    log::warn!("[Scheduler] {} is unplayable: {}", filename, reason);
                }
                None
            }
            None => {
                log::debug!("[Scheduler] {} not in pool, skipped", placed.filename);
                None
            }
        }
    }

    /// Retrigger pass for the cycle beginning at `cycle_start` on the audio
    /// clock. Sources from the previous cycle are cut at `cycle_start`.
    /// Returns how many sources were scheduled.
    pub fn schedule_cycle(
        &mut self,
        ctx: &mut AudioContext,
        registry: &mut TrackGraphRegistry,
        pool: &SamplePool,
        placed: &[PlacedSample],
        cycle_start: f64,
        loop_duration: f64,
    ) -> usize {
        for source in &self.active {
            ctx.stop_at(source.node, cycle_start);
        }
        self.prune_finished(ctx);
        let retiring = self.active.len();
        let cycle_end = cycle_start + loop_duration;

        for p in placed {
            let Some(x_pos) = p.offset() else {
                continue;
            };
            let Some(buffer) = self.playable(pool, p) else {
                continue;
            };

            let input = registry.chain_input(ctx, p.track_id);
            let node = ctx.add_node(Box::new(BufferSourceNode::new(buffer, false)));
            ctx.graph.connect(node, input);

            let start_time = cycle_start + x_pos * loop_duration;
            ctx.start_at(node, start_time);
            // Anything still sounding at the boundary is cut there.
            ctx.stop_at(node, cycle_end);
            self.track_source(node, p.sample_id, p.track_id, start_time);
        }

        let scheduled = self.active.len() - retiring;
        log::debug!(
            "[Scheduler] Cycle at {:.4}s: {} of {} placements scheduled",
            cycle_start,
            scheduled,
            placed.len()
        );
        scheduled
    }

    /// Supersede any rebuild in flight and capture a new one. Only the returned
    /// job's generation may commit.
    pub fn begin_rebuild(&mut self, pool: &SamplePool, placed: &[PlacedSample], loop_duration: f64) -> LoopJob {
        self.generation += 1;
        let mut requests: Vec<BuildRequest> = Vec::new();
        let mut tracks = Vec::new();
        for p in placed {
            let Some(x_pos) = p.offset() else {
                continue;
            };
            let Some(buffer) = self.playable(pool, p) else {
                continue;
            };
            requests.push((p.sample_id, buffer, x_pos));
            tracks.push(p.track_id);
        }

        LoopJob {
            generation: self.generation,
            loop_duration,
            requests,
            tracks,
            cache: self.cache.clone(),
        }
    }

    /// Invalidate every rebuild in flight without starting another.
    pub fn cancel_rebuilds(&mut self) {
        self.generation += 1;
    }

    pub fn current_generation(&self) -> u64 {
        self.generation
    }

    /// Start native-loop sources for a prepared loop, `phase` seconds into the
    /// cycle. A loop prepared for a superseded generation is dropped and nothing
    /// changes.
    pub fn commit(
        &mut self,
        ctx: &mut AudioContext,
        registry: &mut TrackGraphRegistry,
        prepared: PreparedLoop,
        phase: f64,
    ) -> bool {
        if prepared.generation != self.generation {
            log::debug!(
                "[Scheduler] Discarding stale loop build (generation {}, latest {})",
                prepared.generation,
                self.generation
            );
            return false;
        }

        self.stop_all(ctx);
        self.cache = prepared.cache;
        let now = ctx.current_time();
        let phase = if prepared.loop_duration > 0.0 {
            phase.rem_euclid(prepared.loop_duration)
        } else {
            0.0
        };
        for voice in prepared.voices {
            let input = registry.chain_input(ctx, voice.track_id);
            let source = BufferSourceNode::new(voice.buffer, true).with_offset(phase);
            let node = ctx.add_node(Box::new(source));
            ctx.graph.connect(node, input);
            ctx.start_at(node, now);
            self.track_source(node, voice.sample_id, voice.track_id, now - phase);
        }

        log::info!(
            "[Scheduler] Native loop started: {} sources, {:.3}s cycle, phase {:.3}s",
            self.active.len(),
            prepared.loop_duration,
            phase
        );
        true
    }

    /// Build and commit on the calling thread, at the start of a cycle.
    pub fn play_native(
        &mut self,
        ctx: &mut AudioContext,
        registry: &mut TrackGraphRegistry,
        pool: &SamplePool,
        placed: &[PlacedSample],
        loop_duration: f64,
    ) -> usize {
        let job = self.begin_rebuild(pool, placed, loop_duration);
        self.commit(ctx, registry, job.run(), 0.0);
        self.active.len()
    }

    /// Stop and disconnect every source this scheduler created. Returns how
    /// many were active; a second call returns 0.
    pub fn stop_all(&mut self, ctx: &mut AudioContext) -> usize {
        let now = ctx.current_time();
        let count = self.active.len();
        for source in self.active.drain(..) {
            ctx.stop_at(source.node, now);
            ctx.graph.disconnect(source.node);
            ctx.graph.remove_node(source.node);
        }
        count
    }

    /// Drop one-shot sources that have played out.
    pub fn prune_finished(&mut self, ctx: &mut AudioContext) {
        self.active.retain(|source| {
            let finished = ctx.graph.node(source.node).is_none_or(|n| n.is_finished());
            if finished {
                ctx.graph.remove_node(source.node);
            }
            !finished
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Sample;
    use loopdeck_shared::SampleProvenance;

    fn pool_with(samples: &[(SampleId, usize)], rate: u32) -> SamplePool {
        let mut pool = SamplePool::new();
        for &(id, frames) in samples {
            pool.insert(Sample::new(
                id,
                format!("{id}.wav"),
                SampleProvenance::Recording,
                AudioBuffer::new(vec![vec![1.0; frames]], rate),
            ));
        }
        pool
    }

    #[test]
    fn retrigger_schedules_by_offset_and_skips_unplaced() {
        let (a, b, c) = (SampleId::new(), SampleId::new(), SampleId::new());
        let pool = pool_with(&[(a, 10), (b, 10), (c, 10)], 100);
        let mut ctx = AudioContext::new(100);
        let mut reg = TrackGraphRegistry::new();
        let mut sched = Scheduler::new();

        let mut unplaced = PlacedSample::new(c, "c", 3, 0.0);
        unplaced.x_pos = None;
        let placed = vec![
            PlacedSample::new(a, "a", 1, 0.0),
            PlacedSample::new(b, "b", 2, 0.5),
            unplaced,
        ];

        assert_eq!(sched.schedule_cycle(&mut ctx, &mut reg, &pool, &placed, 0.0, 2.0), 2);
        let starts: Vec<f64> = sched.active_sources().iter().map(|s| s.start_time).collect();
        assert_eq!(starts, vec![0.0, 1.0]);
        assert!(!reg.has_track(3));

        // The next pass replaces, not accumulates.
        ctx.render_offline(200, 64);
        assert_eq!(sched.schedule_cycle(&mut ctx, &mut reg, &pool, &placed, 2.0, 2.0), 2);
        assert_eq!(sched.active_sources().len(), 2);
        assert_eq!(sched.active_sources()[1].start_time, 3.0);
    }

    #[test]
    fn pending_and_failed_samples_are_skipped() {
        let ready = SampleId::new();
        let mut pool = pool_with(&[(ready, 4)], 100);
        let pending = SampleId::new();
        let failed = SampleId::new();
        pool.mark_pending(pending, "p.wav");
        pool.mark_failed(failed, "f.wav", "bad header");

        let mut ctx = AudioContext::new(100);
        let mut reg = TrackGraphRegistry::new();
        let mut sched = Scheduler::new();
        let placed = vec![
            PlacedSample::new(pending, "p.wav", 1, 0.0),
            PlacedSample::new(failed, "f.wav", 1, 0.0),
            PlacedSample::new(ready, "r.wav", 1, 0.0),
            PlacedSample::new(SampleId::new(), "ghost.wav", 1, 0.0),
        ];
        assert_eq!(sched.schedule_cycle(&mut ctx, &mut reg, &pool, &placed, 0.0, 1.0), 1);
        assert_eq!(sched.play_native(&mut ctx, &mut reg, &pool, &placed, 1.0), 1);
    }

    #[test]
    fn stop_all_is_idempotent() {
        let a = SampleId::new();
        let pool = pool_with(&[(a, 4)], 100);
        let mut ctx = AudioContext::new(100);
        let mut reg = TrackGraphRegistry::new();
        let mut sched = Scheduler::new();
        let baseline = ctx.graph.node_count();

        assert_eq!(sched.stop_all(&mut ctx), 0);
        sched.play_native(&mut ctx, &mut reg, &pool, &[PlacedSample::new(a, "a", 1, 0.25)], 1.0);
        assert_eq!(sched.active_sources().len(), 1);
        assert_eq!(sched.stop_all(&mut ctx), 1);
        assert_eq!(sched.stop_all(&mut ctx), 0);
        assert!(sched.active_sources().is_empty());
        // Only the track chain remains.
        assert_eq!(ctx.graph.node_count(), baseline + 4);
    }

    #[test]
    fn stale_generation_is_discarded() {
        let a = SampleId::new();
        let pool = pool_with(&[(a, 4)], 100);
        let mut ctx = AudioContext::new(100);
        let mut reg = TrackGraphRegistry::new();
        let mut sched = Scheduler::new();
        let placed = [PlacedSample::new(a, "a", 1, 0.0)];

        let old = sched.begin_rebuild(&pool, &placed, 1.0);
        let latest = sched.begin_rebuild(&pool, &placed, 2.0);
        assert!(latest.generation() > old.generation());

        // The newer build finishes first; the older one arrives afterwards.
        assert!(sched.commit(&mut ctx, &mut reg, latest.run(), 0.0));
        let committed = sched.active_sources()[0].id;
        assert!(!sched.commit(&mut ctx, &mut reg, old.run(), 0.0));
        assert_eq!(sched.active_sources().len(), 1);
        assert_eq!(sched.active_sources()[0].id, committed);
        assert_eq!(sched.cache().duration(), Some(2.0));

        let cancelled = sched.begin_rebuild(&pool, &placed, 3.0);
        sched.cancel_rebuilds();
        assert!(!sched.commit(&mut ctx, &mut reg, cancelled.run(), 0.0));
        assert_eq!(sched.cache().duration(), Some(2.0));
    }

    #[test]
    fn build_job_runs_on_another_thread() {
        let a = SampleId::new();
        let pool = pool_with(&[(a, 4)], 100);
        let mut ctx = AudioContext::new(100);
        let mut reg = TrackGraphRegistry::new();
        let mut sched = Scheduler::new();

        let job = sched.begin_rebuild(&pool, &[PlacedSample::new(a, "a", 1, 0.5)], 1.0);
        let prepared = std::thread::spawn(move || job.run()).join().unwrap();
        assert_eq!(prepared.len(), 1);
        assert!(sched.commit(&mut ctx, &mut reg, prepared, 0.25));

        let source = sched.active_sources()[0];
        assert_eq!(source.start_time, -0.25);
        assert_eq!(sched.cache().get(a, 0.5).unwrap().frames(), 100);
    }

    #[test]
    fn source_ids_are_never_reused() {
        let a = SampleId::new();
        let pool = pool_with(&[(a, 4)], 100);
        let mut ctx = AudioContext::new(100);
        let mut reg = TrackGraphRegistry::new();
        let mut sched = Scheduler::new();
        let placed = [PlacedSample::new(a, "a", 1, 0.0)];

        sched.play_native(&mut ctx, &mut reg, &pool, &placed, 1.0);
        let first = sched.active_sources()[0];
        sched.stop_all(&mut ctx);
        sched.play_native(&mut ctx, &mut reg, &pool, &placed, 1.0);
        let second = sched.active_sources()[0];
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn finished_one_shots_are_pruned() {
        let a = SampleId::new();
        let pool = pool_with(&[(a, 5)], 100);
        let mut ctx = AudioContext::new(100);
        let mut reg = TrackGraphRegistry::new();
        let mut sched = Scheduler::new();
        sched.schedule_cycle(&mut ctx, &mut reg, &pool, &[PlacedSample::new(a, "a", 1, 0.0)], 0.0, 1.0);
        ctx.render_offline(20, 10);
        sched.prune_finished(&mut ctx);
        assert!(sched.active_sources().is_empty());
    }
}
