use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Resample error: {0}")]
    Resample(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session error: {0}")]
    Session(#[from] loopdeck_shared::SessionError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Upload failed for '{key}': {reason}")]
    Upload { key: String, reason: String },
}

/// Failures surfaced by the recorder to its caller. None of them are fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("capture device unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,

    #[error("recording captured no audio")]
    Empty,
}

pub type EngineResult<T> = Result<T, EngineError>;
