use crossbeam_channel::{Receiver, Sender, unbounded};
use loopdeck_shared::{
    LoopSettings, PersistedPcm, PersistedRecording, PersistedSource, PlacedSample, SampleProvenance,
    SessionSnapshot, TrackAudioState,
};

use crate::assets::{SharedPool, update_pool};
use crate::buffer::AudioBuffer;
use crate::commands::EngineCommand;
use crate::config::EngineConfig;
use crate::context::AudioContext;
use crate::error::EngineResult;
use crate::registry::TrackGraphRegistry;
use crate::scheduler::{PlaybackStrategy, PreparedLoop, Scheduler};
use crate::transport::{LoopBoundary, LoopDurationHandle, Transport};

/// Called once per loop cycle, on whichever thread renders.
pub type LoopListener = Box<dyn FnMut(LoopBoundary) + Send>;

/// The loop sequencer: settings, placements, per-track chains and playback,
/// rendered block by block on the audio clock.
pub struct LoopEngine {
    ctx: AudioContext,
    registry: TrackGraphRegistry,
    scheduler: Scheduler,
    transport: Transport,
    pool: SharedPool,
    placed: Vec<PlacedSample>,
    settings: LoopSettings,
    strategy: PlaybackStrategy,
    listener: Option<LoopListener>,
    playing: bool,
    /// Build native loops on the rayon pool instead of the calling thread.
    background_builds: bool,
    build_tx: Sender<EngineCommand>,
    build_rx: Receiver<EngineCommand>,
}

impl LoopEngine {
    pub fn new(sample_rate: u32, config: &EngineConfig, pool: SharedPool) -> Self {
        let settings = config.settings.clamped();
        let mut registry = TrackGraphRegistry::new();
        for track_id in 1..=config.initial_tracks {
            registry.add_track(track_id);
        }
        log::info!(
            "[Engine] {} Hz, {:?}, {} bpm x {} beats ({:.3}s loop)",
            sample_rate,
            config.strategy,
            settings.bpm,
            settings.beats_per_loop,
            settings.loop_duration()
        );

        let (build_tx, build_rx) = unbounded();

        Self {
            ctx: AudioContext::new(sample_rate),
            registry,
            scheduler: Scheduler::new(),
            transport: Transport::new(LoopDurationHandle::new(settings.loop_duration())),
            pool,
            placed: Vec::new(),
            settings,
            strategy: config.strategy,
            listener: None,
            playing: false,
            background_builds: false,
            build_tx,
            build_rx,
        }
    }

    pub fn context(&self) -> &AudioContext {
        &self.ctx
    }

    pub fn registry(&self) -> &TrackGraphRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    pub fn settings(&self) -> LoopSettings {
        self.settings
    }

    pub fn strategy(&self) -> PlaybackStrategy {
        self.strategy
    }

    pub fn placed_samples(&self) -> &[PlacedSample] {
        &self.placed
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn set_loop_listener(&mut self, listener: LoopListener) {
        self.listener = Some(listener);
    }

    /// With background builds on, native-loop buffers are built on the rayon
    /// pool and committed by a later `render`. Off, they are built inline.
    pub fn set_background_builds(&mut self, enabled: bool) {
        self.background_builds = enabled;
    }

    fn loop_duration(&self) -> f64 {
        self.transport.duration_handle().get()
    }

    fn on_boundary(&mut self, boundary: LoopBoundary) {
        if self.strategy == PlaybackStrategy::Retrigger {
            let pool = self.pool.load();
            let duration = self.loop_duration();
            self.scheduler.schedule_cycle(
                &mut self.ctx,
                &mut self.registry,
                &pool,
                &self.placed,
                boundary.at,
                duration,
            );
        }
        if let Some(listener) = self.listener.as_mut() {
            listener(boundary);
        }
    }

    /// Capture a native-loop build for the current placements. The sources
    /// already playing keep going until it commits.
    fn request_native_build(&mut self) {
        let pool = self.pool.load();
        let duration = self.loop_duration();
        let job = self.scheduler.begin_rebuild(&pool, &self.placed, duration);

        if self.background_builds {
            let tx = self.build_tx.clone();
            rayon::spawn(move || {
                let _ = tx.send(EngineCommand::CommitLoop(job.run()));
            });
        } else {
            self.commit_loop(job.run());
        }
    }

    /// Start a prepared native loop in phase with the transport.
    fn commit_loop(&mut self, prepared: PreparedLoop) {
        if !self.playing || self.strategy != PlaybackStrategy::NativeLoop {
            log::debug!("[Engine] Dropping loop build {}: not playing natively", prepared.generation());
            return;
        }
        let phase = if self.transport.is_running() {
            self.ctx.current_time() - self.transport.last_boundary()
        } else {
            0.0
        };
        self.scheduler.commit(&mut self.ctx, &mut self.registry, prepared, phase);
    }

    /// Restart the transport at the current audio time.
    fn restart_transport(&mut self) {
        self.transport.stop();
        if let Some(boundary) = self.transport.start(self.ctx.current_time()) {
            self.on_boundary(boundary);
        }
    }

    pub fn play(&mut self) {
        if self.playing {
            return;
        }
        self.playing = true;
        log::info!("[Engine] Play ({:?})", self.strategy);

        if let Some(boundary) = self.transport.start(self.ctx.current_time()) {
            self.on_boundary(boundary);
        }
        if self.strategy == PlaybackStrategy::NativeLoop {
            self.request_native_build();
        }
    }

    /// Halts the transport and every source. Safe when already stopped.
    pub fn stop(&mut self) {
        self.transport.stop();
        self.scheduler.cancel_rebuilds();
        let stopped = self.scheduler.stop_all(&mut self.ctx);
        if self.playing {
            log::info!("[Engine] Stop ({} sources)", stopped);
        }
        self.playing = false;
    }

    /// Apply new tempo settings. While playing, everything scheduled for the old
    /// duration is torn down and the loop restarts at the new one.
    pub fn set_settings(&mut self, settings: LoopSettings) {
        let settings = settings.clamped();
        if settings == self.settings {
            return;
        }
        self.settings = settings;
        self.transport.duration_handle().set(settings.loop_duration());
        log::info!(
            "[Engine] Tempo {} bpm x {} beats ({:.3}s loop)",
            settings.bpm,
            settings.beats_per_loop,
            settings.loop_duration()
        );

        if !self.playing {
            return;
        }
        self.scheduler.cancel_rebuilds();
        self.scheduler.stop_all(&mut self.ctx);
        if self.strategy == PlaybackStrategy::NativeLoop {
            self.scheduler.invalidate_cache();
        }
        self.restart_transport();
        if self.strategy == PlaybackStrategy::NativeLoop {
            self.request_native_build();
        }
    }

    /// Replace the placement list. Retrigger playback picks it up at the next
    /// boundary; a native loop is rebuilt and rejoins at the current phase.
    pub fn set_placed_samples(&mut self, placed: Vec<PlacedSample>) {
        self.placed = placed;
        if self.playing && self.strategy == PlaybackStrategy::NativeLoop {
            self.request_native_build();
        }
    }

    pub fn set_strategy(&mut self, strategy: PlaybackStrategy) {
        if strategy == self.strategy {
            return;
        }
        let was_playing = self.playing;
        self.stop();
        self.strategy = strategy;
        if was_playing {
            self.play();
        }
    }

    pub fn add_track(&mut self, track_id: u32) -> bool {
        self.registry.add_track(track_id)
    }

    pub fn remove_track(&mut self, track_id: u32) -> bool {
        self.registry.remove_track(&mut self.ctx, track_id)
    }

    pub fn set_track_gain(&mut self, track_id: u32, gain: f32) {
        self.registry.set_gain(&mut self.ctx, track_id, gain);
    }

    pub fn set_track_pan(&mut self, track_id: u32, pan: f32) {
        self.registry.set_pan(&mut self.ctx, track_id, pan);
    }

    pub fn set_low_pass(&mut self, track_id: u32, hz: f32) {
        self.registry.set_low_pass(&mut self.ctx, track_id, hz);
    }

    pub fn set_high_pass(&mut self, track_id: u32, hz: f32) {
        self.registry.set_high_pass(&mut self.ctx, track_id, hz);
    }

    pub fn set_low_pass_bypass(&mut self, track_id: u32, bypassed: bool) {
        self.registry.set_low_pass_bypass(&mut self.ctx, track_id, bypassed);
    }

    pub fn set_high_pass_bypass(&mut self, track_id: u32, bypassed: bool) {
        self.registry.set_high_pass_bypass(&mut self.ctx, track_id, bypassed);
    }

    pub fn track_state(&self, track_id: u32) -> Option<TrackAudioState> {
        self.registry.state(track_id).copied()
    }

    /// Render one interleaved block.
    ///
    /// The transport is ticked with the time at the end of the block, so a
    /// boundary that falls inside the block is scheduled before it is rendered.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        while let Ok(cmd) = self.build_rx.try_recv() {
            self.handle_command(cmd);
        }
        if self.playing {
            let frames = out.len() / channels.max(1);
            let block_end = (self.ctx.current_frame() + frames as u64) as f64 / self.ctx.sample_rate() as f64;
            if let Some(boundary) = self.transport.tick(block_end) {
                self.on_boundary(boundary);
            }
        }
        self.ctx.render(out, channels);
        if self.strategy == PlaybackStrategy::Retrigger {
            self.scheduler.prune_finished(&mut self.ctx);
        }
    }

    /// Render `frames` of stereo output in `block_size` chunks.
    pub fn render_offline(&mut self, frames: usize, block_size: usize) -> AudioBuffer {
        let block_size = block_size.max(1);
        let mut interleaved = vec![0.0f32; frames * 2];
        for chunk in interleaved.chunks_mut(block_size * 2) {
            self.render(chunk, 2);
        }
        AudioBuffer::from_interleaved(&interleaved, 2, self.ctx.sample_rate())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let pool = self.pool.load();
        let recordings = pool
            .recordings()
            .into_iter()
            .map(|sample| PersistedRecording {
                sample_id: sample.id,
                filename: sample.filename.clone(),
                pcm: PersistedPcm::from_channels(&sample.buffer.channels, sample.buffer.sample_rate),
            })
            .collect();

        let sources = pool
            .sources()
            .into_iter()
            .map(|sample| PersistedSource {
                sample_id: sample.id,
                filename: sample.filename.clone(),
                provenance: sample.provenance.clone(),
            })
            .collect();

        SessionSnapshot {
            bpm: self.settings.bpm,
            beats_per_loop: self.settings.beats_per_loop,
            tracks: self.registry.states(),
            placed_samples: self.placed.clone(),
            recordings,
            sources,
        }
    }

    /// Load a saved session. Playback stops; nothing changes if any recording
    /// fails to decode.
    pub fn restore(&mut self, snapshot: SessionSnapshot) -> EngineResult<()> {
        let mut recordings = Vec::with_capacity(snapshot.recordings.len());
        for rec in &snapshot.recordings {
            let channels = rec.pcm.to_channels()?;
            recordings.push((rec.sample_id, rec.filename.clone(), AudioBuffer::new(channels, rec.pcm.sample_rate)));
        }

        self.stop();
        self.registry.clear(&mut self.ctx);
        for (&track_id, &state) in &snapshot.tracks {
            self.registry.add_track(track_id);
            self.registry.apply_state(&mut self.ctx, track_id, state);
        }

        let restored = recordings.len();
        update_pool(&self.pool, |pool| {
            for (id, filename, buffer) in recordings {
                pool.add_from_buffer(id, filename, SampleProvenance::Recording, buffer);
            }
        });

        self.set_settings(snapshot.settings());
        self.placed = snapshot.placed_samples;
        log::info!(
            "[Engine] Restored session: {} tracks, {} placements, {} recordings",
            snapshot.tracks.len(),
            self.placed.len(),
            restored
        );
        Ok(())
    }

    pub fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Play => self.play(),
            EngineCommand::Stop => self.stop(),
            EngineCommand::SetSettings(settings) => self.set_settings(settings),
            EngineCommand::SetPlacedSamples(placed) => self.set_placed_samples(placed),
            EngineCommand::SetStrategy(strategy) => self.set_strategy(strategy),
            EngineCommand::CommitLoop(prepared) => self.commit_loop(prepared),
            EngineCommand::AddTrack { track_id } => {
                self.add_track(track_id);
            }
            EngineCommand::RemoveTrack { track_id } => {
                self.remove_track(track_id);
            }
            EngineCommand::SetTrackGain { track_id, gain } => self.set_track_gain(track_id, gain),
            EngineCommand::SetTrackPan { track_id, pan } => self.set_track_pan(track_id, pan),
            EngineCommand::SetLowPass { track_id, hz } => self.set_low_pass(track_id, hz),
            EngineCommand::SetHighPass { track_id, hz } => self.set_high_pass(track_id, hz),
            EngineCommand::SetLowPassBypass { track_id, bypassed } => self.set_low_pass_bypass(track_id, bypassed),
            EngineCommand::SetHighPassBypass { track_id, bypassed } => {
                self.set_high_pass_bypass(track_id, bypassed)
            }
            EngineCommand::GetSnapshot(response_tx) => {
                let _ = response_tx.send(self.snapshot());
            }
            EngineCommand::Restore { snapshot, response_tx } => {
                let result = self.restore(snapshot).map_err(|e| {
                    log::error!("[Engine] Restore failed: {}", e);
                    e.to_string()
                });
                let _ = response_tx.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::shared_pool;
    use crate::buffer::Sample;
    use loopdeck_shared::SampleId;
    use std::sync::{Arc, Mutex};

    fn engine(rate: u32) -> LoopEngine {
        LoopEngine::new(rate, &EngineConfig::default(), shared_pool())
    }

    #[test]
    fn listener_fires_once_per_cycle() {
        let mut eng = engine(1_000);
        eng.set_settings(LoopSettings::new(120.0, 4));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        eng.set_loop_listener(Box::new(move |b: LoopBoundary| sink.lock().unwrap().push(b.cycle)));

        eng.play();
        eng.play();
        eng.render_offline(6_500, 128);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn stop_without_play_is_harmless() {
        let mut eng = engine(1_000);
        eng.stop();
        eng.stop();
        assert!(!eng.is_playing());
        assert!(eng.scheduler().active_sources().is_empty());
    }

    #[test]
    fn snapshot_restores_into_fresh_engine() {
        let mut eng = engine(8_000);
        let rec = SampleId::new();
        update_pool(eng.pool(), |p| {
            p.insert(Sample::new(
                rec,
                "take.wav",
                SampleProvenance::Recording,
                AudioBuffer::new(vec![vec![0.25, -0.5, 1.0]], 8_000),
            ));
        });
        eng.set_settings(LoopSettings::new(90.0, 8));
        eng.set_track_gain(2, 0.3);
        eng.set_low_pass_bypass(2, true);
        eng.set_placed_samples(vec![PlacedSample::new(rec, "take.wav", 2, 0.25)]);

        let json = serde_json::to_string(&eng.snapshot()).unwrap();
        let snapshot: SessionSnapshot = serde_json::from_str(&json).unwrap();

        let mut other = engine(8_000);
        other.restore(snapshot).unwrap();
        assert_eq!(other.settings(), LoopSettings::new(90.0, 8));
        assert_eq!(other.placed_samples(), eng.placed_samples());
        let state = other.track_state(2).unwrap();
        assert_eq!(state.gain, 0.3);
        assert!(state.low_pass_bypassed);
        let pool = other.pool().load();
        assert_eq!(pool.ready(rec).unwrap().buffer.channels[0], vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn corrupt_recording_leaves_engine_untouched() {
        let mut eng = engine(8_000);
        eng.set_track_gain(1, 0.7);
        let mut snapshot = eng.snapshot();
        snapshot.bpm = 60.0;
        snapshot.recordings.push(PersistedRecording {
            sample_id: SampleId::new(),
            filename: "bad.wav".into(),
            pcm: PersistedPcm {
                sample_rate: 8_000,
                frame_count: 4,
                channels: vec!["not base64!".into()],
            },
        });
        assert!(eng.restore(snapshot).is_err());
        assert_eq!(eng.settings(), LoopSettings::default());
        assert_eq!(eng.track_state(1).unwrap().gain, 0.7);
    }

    #[test]
    fn strategy_switch_keeps_playing() {
        let mut eng = engine(1_000);
        eng.play();
        eng.set_strategy(PlaybackStrategy::NativeLoop);
        assert!(eng.is_playing());
        assert_eq!(eng.strategy(), PlaybackStrategy::NativeLoop);
    }
}
