use std::future::Future;
use std::path::PathBuf;
use crate::controller::{EncodeAttempt, Termination};

/// Structured event emitted by a fitting run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitEvent {
    RunStarted {
        run_id: String,
        input: String,
        initial_bitrate_bps: u32,
        max_size_bytes: u64,
    },
    InputMaterialized {
        run_id: String,
        temp_input: PathBuf,
        original_size_bytes: u64,
    },
    AttemptFinished {
        run_id: String,
        attempt: EncodeAttempt,
    },
    Terminated {
        run_id: String,
        reason: Termination,
        attempts: u32,
        final_bitrate_bps: u32,
        final_size_bytes: u64,
    },
    Failed {
        run_id: String,
        message: String,
    },
    TeardownComplete {
        run_id: String,
        output: Option<PathBuf>,
    },
}

/// Receiver of [`FitEvent`]s. Recording must never fail the run.
pub trait EventSink: Send + Sync {
    fn record(&self, event: FitEvent) -> impl Future<Output = ()> + Send;
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHistory;

impl EventSink for NoHistory {
    async fn record(&self, _event: FitEvent) {}
}

impl<S: EventSink> EventSink for std::sync::Arc<S> {
    fn record(&self, event: FitEvent) -> impl Future<Output = ()> + Send {
        S::record(self, event)
    }
}
