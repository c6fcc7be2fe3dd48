use crossbeam_channel::Sender;
use loopdeck_shared::{LoopSettings, PlacedSample, SessionSnapshot};

use crate::scheduler::{PlaybackStrategy, PreparedLoop};

pub enum EngineCommand {
    Play,
    Stop,
    SetSettings(LoopSettings),
    /// Replaces the whole placement list.
    SetPlacedSamples(Vec<PlacedSample>),
    SetStrategy(PlaybackStrategy),
    /// A native-loop build finished off the audio thread. Dropped if a newer
    /// build was requested since.
    CommitLoop(PreparedLoop),

    // Tracks
    AddTrack { track_id: u32 },
    RemoveTrack { track_id: u32 },
    SetTrackGain { track_id: u32, gain: f32 },
    SetTrackPan { track_id: u32, pan: f32 },
    SetLowPass { track_id: u32, hz: f32 },
    SetHighPass { track_id: u32, hz: f32 },
    SetLowPassBypass { track_id: u32, bypassed: bool },
    SetHighPassBypass { track_id: u32, bypassed: bool },

    // Session state
    GetSnapshot(Sender<SessionSnapshot>),
    Restore { snapshot: SessionSnapshot, response_tx: Sender<Result<(), String>> },
}
