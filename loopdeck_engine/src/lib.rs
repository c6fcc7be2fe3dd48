pub mod assets;
pub mod buffer;
pub mod capture;
pub mod commands;
pub mod config;
pub mod context;
pub mod decode;
pub mod engine; // LoopEngine lives here
pub mod error;
pub mod export;
pub mod graph;
pub mod loop_buffer;
pub mod nodes;
pub mod output;
pub mod recorder;
pub mod registry;
pub mod resampler;
pub mod scheduler;
pub mod transport;


// Re-exports
pub use assets::{SampleEntry, SamplePool, SharedPool, shared_pool, update_pool};
pub use buffer::{AudioBuffer, Sample};
pub use commands::EngineCommand;
pub use config::EngineConfig;
pub use engine::{LoopEngine, LoopListener};
pub use error::{EngineError, EngineResult, RecorderError};
pub use recorder::{CaptureDevice, CaptureStream, LevelReading, Recorder, TrimConfig, trim_silence};
pub use scheduler::{LoopJob, PlaybackStrategy, PreparedLoop};
pub use transport::{LoopBoundary, LoopDurationHandle, Transport};
