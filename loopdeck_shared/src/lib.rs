use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod pcm;
pub mod session;

pub use pcm::PersistedPcm;
pub use session::{
    LoopSettings, PersistedRecording, PersistedSource, PlacedSample, SessionSnapshot,
    TrackAudioState,
};

/// Tempo range accepted by the loop controls.
pub const MIN_BPM: f32 = 40.0;
pub const MAX_BPM: f32 = 200.0;

/// Loop length range, in beats.
pub const MIN_BEATS_PER_LOOP: u32 = 4;
pub const MAX_BEATS_PER_LOOP: u32 = 16;

/// A low-pass cutoff at or above this is treated as fully open.
pub const LOW_PASS_OPEN_HZ: f32 = 20_000.0;
/// A high-pass cutoff at or below this is treated as fully open.
pub const HIGH_PASS_OPEN_HZ: f32 = 20.0;

/// Unique identity of a sample, stable across save/load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleId(pub Uuid);

impl SampleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SampleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a sample's audio came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleProvenance {
    /// Bundled asset loaded from a path.
    Static { path: String },
    /// Object fetched from remote storage.
    Remote { key: String },
    /// Captured from the microphone during this or a previous session.
    Recording,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("channel {channel} holds {found} frames, expected {expected}")]
    FrameCountMismatch {
        channel: usize,
        expected: usize,
        found: usize,
    },
    #[error("channel {channel} is not valid base64: {source}")]
    Base64 {
        channel: usize,
        #[source]
        source: base64::DecodeError,
    },
    #[error("channel {0} byte length is not a multiple of 4")]
    Truncated(usize),
    #[error("recording has no channels")]
    NoChannels,
}
