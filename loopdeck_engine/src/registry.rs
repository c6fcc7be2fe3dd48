//! Per-track signal chains shared by the mixer controls and the scheduler.
//!
//! Each track owns at most one node per [`Stage`], wired
//! `gain -> pan -> high-pass -> low-pass -> destination`. Nodes are created on
//! first use and reused for every play until the track is removed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use loopdeck_shared::TrackAudioState;
use petgraph::stable_graph::NodeIndex;

use crate::context::AudioContext;
use crate::nodes::{AudioNode, BiquadFilterNode, FilterType, GainNode, Param, StereoPannerNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Gain,
    Pan,
    HighPass,
    LowPass,
}

impl Stage {
    /// Signal order of a track chain.
    pub const CHAIN: [Stage; 4] = [Stage::Gain, Stage::Pan, Stage::HighPass, Stage::LowPass];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Gain => "gain",
            Stage::Pan => "pan",
            Stage::HighPass => "highpass",
            Stage::LowPass => "lowpass",
        }
    }

    fn build(self, state: &TrackAudioState) -> Box<dyn AudioNode> {
        match self {
            Stage::Gain => Box::new(GainNode::new(state.gain)),
            Stage::Pan => Box::new(StereoPannerNode::new(state.pan)),
            Stage::HighPass => Box::new(BiquadFilterNode::new(FilterType::HighPass, state.high_pass_hz)),
            Stage::LowPass => Box::new(BiquadFilterNode::new(FilterType::LowPass, state.low_pass_hz)),
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::CHAIN
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Lookup key of the form `"{track_id}_{stage}"`, e.g. `"3_lowpass"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageKey {
    pub track_id: u32,
    pub stage: Stage,
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.track_id, self.stage.name())
    }
}

impl FromStr for StageKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (track, stage) = s.split_once('_').ok_or_else(|| format!("malformed key '{s}'"))?;
        let track_id = track.parse().map_err(|_| format!("bad track id in '{s}'"))?;
        Ok(Self {
            track_id,
            stage: stage.parse()?,
        })
    }
}

#[derive(Debug, Default)]
struct TrackNodes {
    gain: Option<NodeIndex>,
    pan: Option<NodeIndex>,
    high_pass: Option<NodeIndex>,
    low_pass: Option<NodeIndex>,
    state: TrackAudioState,
}

impl TrackNodes {
    fn slot(&mut self, stage: Stage) -> &mut Option<NodeIndex> {
        match stage {
            Stage::Gain => &mut self.gain,
            Stage::Pan => &mut self.pan,
            Stage::HighPass => &mut self.high_pass,
            Stage::LowPass => &mut self.low_pass,
        }
    }

    fn get(&self, stage: Stage) -> Option<NodeIndex> {
        match stage {
            Stage::Gain => self.gain,
            Stage::Pan => self.pan,
            Stage::HighPass => self.high_pass,
            Stage::LowPass => self.low_pass,
        }
    }

    fn existing(&self) -> Vec<NodeIndex> {
        Stage::CHAIN.iter().filter_map(|&s| self.get(s)).collect()
    }
}

/// Owned table of track id -> stage handles, scoped to one session.
#[derive(Debug, Default)]
pub struct TrackGraphRegistry {
    tracks: BTreeMap<u32, TrackNodes>,
}

impl TrackGraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a track with default state. Returns false if it already existed.
    pub fn add_track(&mut self, track_id: u32) -> bool {
        if self.tracks.contains_key(&track_id) {
            return false;
        }
        self.tracks.insert(track_id, TrackNodes::default());
        log::debug!("[Registry] Added track {}", track_id);
        true
    }

    pub fn has_track(&self, track_id: u32) -> bool {
        self.tracks.contains_key(&track_id)
    }

    pub fn track_ids(&self) -> Vec<u32> {
        self.tracks.keys().copied().collect()
    }

    pub fn state(&self, track_id: u32) -> Option<&TrackAudioState> {
        self.tracks.get(&track_id).map(|t| &t.state)
    }

    pub fn states(&self) -> BTreeMap<u32, TrackAudioState> {
        self.tracks.iter().map(|(&id, t)| (id, t.state)).collect()
    }

    pub fn node(&self, track_id: u32, stage: Stage) -> Option<NodeIndex> {
        self.tracks.get(&track_id).and_then(|t| t.get(stage))
    }

    pub fn node_by_key(&self, key: &str) -> Option<NodeIndex> {
        let key: StageKey = key.parse().ok()?;
        self.node(key.track_id, key.stage)
    }

    /// Existing node for the track/stage, or a freshly built one wired into the chain.
    /// Unknown tracks are created on the fly.
    pub fn get_or_create(&mut self, ctx: &mut AudioContext, track_id: u32, stage: Stage) -> NodeIndex {
        let track = self.tracks.entry(track_id).or_default();
        if let Some(idx) = track.get(stage) {
            if ctx.graph.contains(idx) {
                return idx;
            }
        }

        let idx = ctx.add_node(stage.build(&track.state));
        *track.slot(stage) = Some(idx);
        log::debug!("[Registry] Created node {}", StageKey { track_id, stage });
        Self::rewire(ctx, track);
        idx
    }

    /// Entry point of the track's chain, creating any missing stage.
    pub fn chain_input(&mut self, ctx: &mut AudioContext, track_id: u32) -> NodeIndex {
        for stage in Stage::CHAIN.into_iter().rev() {
            self.get_or_create(ctx, track_id, stage);
        }
        self.get_or_create(ctx, track_id, Stage::Gain)
    }

    fn rewire(ctx: &mut AudioContext, track: &TrackNodes) {
        let chain = track.existing();
        for &idx in &chain {
            ctx.graph.disconnect(idx);
        }
        for pair in chain.windows(2) {
            ctx.graph.connect(pair[0], pair[1]);
        }
        if let Some(&last) = chain.last() {
            let dest = ctx.destination();
            ctx.graph.connect(last, dest);
        }
    }

    pub fn set_gain(&mut self, ctx: &mut AudioContext, track_id: u32, gain: f32) {
        let gain = gain.clamp(0.0, 1.0);
        let idx = self.get_or_create(ctx, track_id, Stage::Gain);
        self.state_mut(track_id).gain = gain;
        ctx.set_param(idx, Param::Gain, gain);
    }

    pub fn set_pan(&mut self, ctx: &mut AudioContext, track_id: u32, pan: f32) {
        let pan = pan.clamp(-1.0, 1.0);
        let idx = self.get_or_create(ctx, track_id, Stage::Pan);
        self.state_mut(track_id).pan = pan;
        ctx.set_param(idx, Param::Pan, pan);
    }

    /// Stores the cutoff; the node only follows it while the filter is not bypassed.
    pub fn set_low_pass(&mut self, ctx: &mut AudioContext, track_id: u32, hz: f32) {
        let hz = hz.max(0.0);
        let idx = self.get_or_create(ctx, track_id, Stage::LowPass);
        let state = self.state_mut(track_id);
        state.low_pass_hz = hz;
        if !state.low_pass_bypassed {
            ctx.set_param(idx, Param::Frequency, hz);
        }
    }

    pub fn set_high_pass(&mut self, ctx: &mut AudioContext, track_id: u32, hz: f32) {
        let hz = hz.max(0.0);
        let idx = self.get_or_create(ctx, track_id, Stage::HighPass);
        let state = self.state_mut(track_id);
        state.high_pass_hz = hz;
        if !state.high_pass_bypassed {
            ctx.set_param(idx, Param::Frequency, hz);
        }
    }

    /// Freezes or releases the low-pass cutoff. Routing never changes.
    pub fn set_low_pass_bypass(&mut self, ctx: &mut AudioContext, track_id: u32, bypassed: bool) {
        let idx = self.get_or_create(ctx, track_id, Stage::LowPass);
        let state = self.state_mut(track_id);
        let released = state.low_pass_bypassed && !bypassed;
        state.low_pass_bypassed = bypassed;
        if released {
            let hz = state.low_pass_hz;
            ctx.set_param(idx, Param::Frequency, hz);
        }
    }

    pub fn set_high_pass_bypass(&mut self, ctx: &mut AudioContext, track_id: u32, bypassed: bool) {
        let idx = self.get_or_create(ctx, track_id, Stage::HighPass);
        let state = self.state_mut(track_id);
        let released = state.high_pass_bypassed && !bypassed;
        state.high_pass_bypassed = bypassed;
        if released {
            let hz = state.high_pass_hz;
            ctx.set_param(idx, Param::Frequency, hz);
        }
    }

    /// Applies a whole saved state through the same paths the controls use.
    pub fn apply_state(&mut self, ctx: &mut AudioContext, track_id: u32, state: TrackAudioState) {
        self.set_gain(ctx, track_id, state.gain);
        self.set_pan(ctx, track_id, state.pan);
        self.set_low_pass_bypass(ctx, track_id, false);
        self.set_high_pass_bypass(ctx, track_id, false);
        self.set_low_pass(ctx, track_id, state.low_pass_hz);
        self.set_high_pass(ctx, track_id, state.high_pass_hz);
        self.set_low_pass_bypass(ctx, track_id, state.low_pass_bypassed);
        self.set_high_pass_bypass(ctx, track_id, state.high_pass_bypassed);
    }

    /// Disconnects and drops every node of the track. Other tracks are untouched.
    pub fn remove_track(&mut self, ctx: &mut AudioContext, track_id: u32) -> bool {
        let Some(track) = self.tracks.remove(&track_id) else {
            return false;
        };
        for idx in track.existing() {
            ctx.graph.disconnect(idx);
            ctx.graph.remove_node(idx);
        }
        log::debug!("[Registry] Removed track {}", track_id);
        true
    }

    pub fn clear(&mut self, ctx: &mut AudioContext) {
        for id in self.track_ids() {
            self.remove_track(ctx, id);
        }
    }

    fn state_mut(&mut self, track_id: u32) -> &mut TrackAudioState {
        &mut self.tracks.entry(track_id).or_default().state
    }
}
