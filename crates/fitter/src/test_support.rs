//! Scripted collaborators shared by the unit tests

use std::path::Path;
use std::sync::{Arc, Mutex};
use crate::engine::{EncodeRequest, Encoder};
use crate::error::EngineError;
use crate::events::{EventSink, FitEvent};

/// Output size produced for a requested bitrate
#[derive(Debug, Clone)]
pub enum SizeModel {
    /// Sizes per attempt of a run; the last one repeats
    Fixed(Vec<u64>),
    /// `bitrate / 1000 * bytes_per_kbps + overhead`
    Linear { bytes_per_kbps: u64, overhead: u64 },
    /// Scales linearly through `size` bytes at `at_bitrate_bps`
    Ratio { size: u64, at_bitrate_bps: u32 },
}

impl SizeModel {
    fn size_for(&self, attempt: usize, bitrate_bps: u32) -> u64 {
        match self {
            SizeModel::Fixed(sizes) => sizes
                .get(attempt)
                .or_else(|| sizes.last())
                .copied()
                .unwrap_or(0),
            SizeModel::Linear { bytes_per_kbps, overhead } => {
                u64::from(bitrate_bps) * bytes_per_kbps / 1000 + overhead
            }
            SizeModel::Ratio { size, at_bitrate_bps } => {
                u64::from(bitrate_bps) * size / u64::from(*at_bitrate_bps)
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    requests: Vec<EncodeRequest>,
    saw_existing_output: bool,
}

/// Encoder that writes files of scripted sizes instead of transcoding
#[derive(Debug, Clone)]
pub struct ScriptedEncoder {
    model: SizeModel,
    fail_on: Option<(usize, String)>,
    hang_on: Option<usize>,
    write_output: bool,
    state: Arc<Mutex<State>>,
}

impl ScriptedEncoder {
    pub fn new(model: SizeModel) -> Self {
        Self {
            model,
            fail_on: None,
            hang_on: None,
            write_output: true,
            state: Arc::default(),
        }
    }

    /// Report `message` as an engine error on the 1-based `attempt` of every run
    pub fn failing_on(mut self, attempt: usize, message: &str) -> Self {
        self.fail_on = Some((attempt, message.to_string()));
        self
    }

    /// Never resolve the 1-based `attempt` of a run
    pub fn hanging_on(mut self, attempt: usize) -> Self {
        self.hang_on = Some(attempt);
        self
    }

    /// Report success without producing a file
    pub fn writing_nothing(mut self) -> Self {
        self.write_output = false;
        self
    }

    pub fn requested_bitrates(&self) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|r| r.bitrate_bps)
            .collect()
    }

    /// Whether any attempt started while an output file already existed
    pub fn saw_existing_output(&self) -> bool {
        self.state.lock().unwrap().saw_existing_output
    }
}

impl Encoder for ScriptedEncoder {
    async fn encode(&self, request: &EncodeRequest) -> Result<(), EngineError> {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            if request.output.exists() {
                state.saw_existing_output = true;
            }
            state.requests.push(request.clone());
            // Attempts are numbered per run; each run has its own temp input
            state
                .requests
                .iter()
                .filter(|r| r.input == request.input)
                .count()
        };

        if self.hang_on == Some(attempt) {
            std::future::pending::<()>().await;
        }
        if let Some((n, message)) = &self.fail_on {
            if *n == attempt {
                return Err(EngineError::new(message.clone()));
            }
        }
        if !self.write_output {
            return Ok(());
        }

        let size = self.model.size_for(attempt - 1, request.bitrate_bps);
        tokio::fs::write(&request.output, vec![0u8; size as usize])
            .await
            .map_err(|e| EngineError::with_cause("failed to write output", e))
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FitEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<FitEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    async fn record(&self, event: FitEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// File names directly under `dir`; empty if it does not exist
pub fn dir_entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}
