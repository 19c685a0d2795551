pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod history;
pub mod materialize;

#[cfg(test)]
mod test_support;

pub use config::{AppConfig, EngineConfig, FitConfig};
pub use controller::{next_bitrate, BitrateFitter, EncodeAttempt, ProcessingResult, Termination};
pub use engine::{EncodeRequest, Encoder, FfmpegEngine, FfmpegVersion};
pub use error::{EngineError, FitError};
pub use events::{EventSink, FitEvent, NoHistory};
pub use format::TargetFormat;
pub use history::{HistoryLog, LogCategory, LogEntry};
pub use materialize::{best_effort_display_name, materialize, sweep_stale_inputs, BytesInput, InputHandle, PathInput};
