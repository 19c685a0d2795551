//! Transcoding engine contract.
//!
//! The bitrate search only ever talks to an [`Encoder`]: one awaitable
//! encode per attempt. Engines with a listener/callback API implement
//! [`CallbackEngine`] instead and are adapted through [`Bridged`].

pub mod bridge;
pub mod ffmpeg;

use std::future::Future;
use std::path::PathBuf;
use crate::error::EngineError;
use crate::format::TargetFormat;

pub use bridge::{Bridged, CallbackEngine, EncodeHandle, EncodeListener};
pub use ffmpeg::{FfmpegEngine, FfmpegVersion};

/// One encode of `input` into `output` at a constant audio bitrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub bitrate_bps: u32,
    pub target: TargetFormat,
}

/// Awaitable encode operation.
///
/// Resolves once the engine has finished writing `request.output` or has
/// failed. Dropping the returned future must stop the encode.
pub trait Encoder: Send + Sync {
    fn encode(&self, request: &EncodeRequest)
        -> impl Future<Output = Result<(), EngineError>> + Send;
}
