use std::fmt;
use std::path::PathBuf;

/// Errors that terminate a fitting run.
///
/// An oversized result at the floor bitrate is not represented here: it is a
/// successful run, see [`crate::Termination::FloorAccepted`].
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    /// Materialization or file-system failure (open, copy, stat, delete).
    #[error("I/O error while {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    /// The transcoding engine reported an error for an attempt.
    #[error("transcode failed on attempt {attempt} at {bitrate_bps} bps: {source}")]
    TranscodeFailure {
        attempt: u32,
        bitrate_bps: u32,
        #[source]
        source: EngineError,
    },

    /// The run configuration cannot terminate or cannot name an output.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another run of the same fitter is already writing this output path.
    #[error("output path already in use by another run: {}", path.display())]
    OutputBusy { path: PathBuf },
}

impl FitError {
    pub fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action: action.into(),
            source,
        }
    }

    /// The engine's own diagnostic message, when the run failed in the engine.
    pub fn engine_message(&self) -> Option<&str> {
        match self {
            FitError::TranscodeFailure { source, .. } => Some(source.message()),
            _ => None,
        }
    }
}

/// Failure reported by a transcoding engine.
#[derive(Debug)]
pub struct EngineError {
    message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap an underlying engine error, keeping it as the source.
    pub fn with_cause(
        message: impl Into<String>,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
