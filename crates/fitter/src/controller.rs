//! Bitrate search: re-encode until the output fits under the size ceiling.
//!
//! Each attempt encodes the materialized input into one fixed output path
//! and measures the result. An oversized candidate is deleted before the next
//! attempt, whose bitrate is scaled down proportionally to the overshoot
//! (at least 1000 bps lower, never below the floor). A run ends when the
//! output fits, when the floor bitrate has been tried, or when the attempt
//! cap is reached; the last output is the result in all three cases.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use log::{debug, error, info, warn};
use serde::Serialize;
use crate::config::FitConfig;
use crate::engine::{EncodeRequest, Encoder};
use crate::error::FitError;
use crate::events::{EventSink, FitEvent, NoHistory};
use crate::materialize::{best_effort_display_name, materialize, InputHandle};

/// Smallest bitrate cut between two attempts
pub const MIN_STEP_DOWN_BPS: u32 = 1000;

/// One encode-and-measure cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodeAttempt {
    /// 1-based
    pub attempt_number: u32,
    pub requested_bitrate_bps: u32,
    /// Absent until the engine has completed
    pub resulting_size_bytes: Option<u64>,
}

/// Why the attempt loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    /// Output is within the ceiling
    SizeSatisfied,
    /// Output is still oversized but the floor bitrate was used
    FloorAccepted,
    /// Attempt cap reached before either of the above
    AttemptsExhausted,
}

/// Outcome of a successful run. The caller owns `processed_file` and is
/// responsible for deleting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingResult {
    pub processed_file: PathBuf,
    pub original_file_size_bytes: u64,
    pub processed_file_size_bytes: u64,
    pub original_file_name: Option<String>,
    pub final_bitrate_bps: u32,
    pub termination: Termination,
    pub attempts: Vec<EncodeAttempt>,
}

impl ProcessingResult {
    /// True when the processed file is larger than `limit` bytes
    pub fn exceeds(&self, limit: u64) -> bool {
        self.processed_file_size_bytes > limit
    }

    /// Delete the processed file once the caller is done with it
    pub async fn discard(self) -> Result<(), FitError> {
        remove_if_exists(&self.processed_file)
            .await
            .map_err(|e| FitError::io(format!("deleting output {}", self.processed_file.display()), e))
    }
}

/// Bitrate for the attempt after one that produced `current_size` bytes at
/// `current_bitrate`.
///
/// Proportional estimate `current * max_size / current_size` (integer
/// division), lowered to at least [`MIN_STEP_DOWN_BPS`] below the current
/// bitrate, then clamped to the floor.
pub fn next_bitrate(current_bitrate: u32, current_size: u64, max_size: u64, floor_bitrate: u32) -> u32 {
    let target = if current_size == 0 {
        u64::from(current_bitrate)
    } else {
        (u128::from(current_bitrate) * u128::from(max_size) / u128::from(current_size)) as u64
    };
    let stepped = target.min(u64::from(current_bitrate.saturating_sub(MIN_STEP_DOWN_BPS)));
    // stepped <= current_bitrate, so it fits in u32
    (stepped as u32).max(floor_bitrate)
}

/// Output paths currently written by runs of one fitter
type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

/// Holds a claim on an output path; releases it on drop
struct OutputClaim {
    path: PathBuf,
    in_flight: InFlight,
}

impl OutputClaim {
    fn acquire(in_flight: &InFlight, path: &Path) -> Result<Self, FitError> {
        let mut paths = in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !paths.insert(path.to_path_buf()) {
            return Err(FitError::OutputBusy { path: path.to_path_buf() });
        }
        Ok(Self {
            path: path.to_path_buf(),
            in_flight: in_flight.clone(),
        })
    }
}

impl Drop for OutputClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.path);
    }
}

/// Deletes the output file on drop unless kept. Covers error returns and
/// cancellation (the run future being dropped mid-encode).
struct OutputGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial output {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete output {}: {}", self.path.display(), e),
        }
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Runs the bitrate search for one configuration.
///
/// Every run uses the same output path (`output_dir` + the configured key),
/// so runs of one configuration must not overlap; a second concurrent run
/// on the same fitter fails with [`FitError::OutputBusy`]. Distinct fitters
/// sharing an output directory and key must be serialized by the caller.
pub struct BitrateFitter<E, S = NoHistory> {
    encoder: E,
    sink: S,
    config: FitConfig,
    cache_dir: PathBuf,
    output_dir: PathBuf,
    in_flight: InFlight,
}

impl<E: Encoder> BitrateFitter<E, NoHistory> {
    pub fn new(
        encoder: E,
        config: FitConfig,
        cache_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, FitError> {
        config.validate()?;
        Ok(Self {
            encoder,
            sink: NoHistory,
            config,
            cache_dir: cache_dir.into(),
            output_dir: output_dir.into(),
            in_flight: Arc::default(),
        })
    }
}

impl<E: Encoder, S: EventSink> BitrateFitter<E, S> {
    /// Report run events to `sink`
    pub fn with_history<S2: EventSink>(self, sink: S2) -> BitrateFitter<E, S2> {
        BitrateFitter {
            encoder: self.encoder,
            sink,
            config: self.config,
            cache_dir: self.cache_dir,
            output_dir: self.output_dir,
            in_flight: self.in_flight,
        }
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fixed output path every run of this fitter writes to
    pub fn output_path(&self) -> PathBuf {
        self.config.output_path(&self.output_dir)
    }

    /// Fit `input` under the configured size ceiling.
    ///
    /// The temp copy of the input is gone when this returns, whatever the
    /// outcome. On error the output file is gone too.
    pub async fn fit<H: InputHandle + ?Sized>(&self, input: &H) -> Result<ProcessingResult, FitError> {
        let output_path = self.output_path();
        let _claim = OutputClaim::acquire(&self.in_flight, &output_path)?;
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();

        info!("Run {}: starting audio file processing for {}", run_id, input.identifier());

        let result = self.run(&run_id, input, &output_path).await;

        let output = match &result {
            Ok(res) => Some(res.processed_file.clone()),
            Err(e) => {
                error!("Run {}: audio file processing failed: {}", run_id, e);
                self.sink
                    .record(FitEvent::Failed {
                        run_id: run_id.clone(),
                        message: e.to_string(),
                    })
                    .await;
                None
            }
        };
        self.sink.record(FitEvent::TeardownComplete { run_id, output }).await;

        result
    }

    async fn run<H: InputHandle + ?Sized>(
        &self,
        run_id: &str,
        input: &H,
        output_path: &Path,
    ) -> Result<ProcessingResult, FitError> {
        let cfg = &self.config;

        self.sink
            .record(FitEvent::RunStarted {
                run_id: run_id.to_string(),
                input: input.identifier(),
                initial_bitrate_bps: cfg.initial_bitrate_bps,
                max_size_bytes: cfg.max_size_bytes,
            })
            .await;

        // Setup
        let temp_input = materialize(input, &self.cache_dir).await?;
        let original_size = temp_input.size_bytes();
        let original_name = best_effort_display_name(input);
        info!(
            "Run {}: copied input to {} ({} bytes)",
            run_id,
            temp_input.path().display(),
            original_size
        );
        self.sink
            .record(FitEvent::InputMaterialized {
                run_id: run_id.to_string(),
                temp_input: temp_input.path().to_path_buf(),
                original_size_bytes: original_size,
            })
            .await;

        let mut output = OutputGuard {
            path: output_path.to_path_buf(),
            keep: false,
        };
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FitError::io(format!("creating output dir {}", parent.display()), e))?;
        }
        remove_if_exists(output_path)
            .await
            .map_err(|e| FitError::io(format!("deleting stale output {}", output_path.display()), e))?;

        // Attempt loop
        let mut bitrate = cfg.initial_bitrate_bps;
        let mut attempts: Vec<EncodeAttempt> = Vec::new();
        let mut termination = Termination::AttemptsExhausted;
        let mut final_size = 0;

        info!("Run {}: starting audio re-encoding with bitrate: {} bps", run_id, bitrate);

        for attempt_number in 1..=cfg.max_attempts {
            let request = EncodeRequest {
                input: temp_input.path().to_path_buf(),
                output: output_path.to_path_buf(),
                bitrate_bps: bitrate,
                target: cfg.target,
            };

            self.encoder
                .encode(&request)
                .await
                .map_err(|source| FitError::TranscodeFailure {
                    attempt: attempt_number,
                    bitrate_bps: bitrate,
                    source,
                })?;

            let current_size = tokio::fs::metadata(output_path)
                .await
                .map_err(|e| FitError::io(format!("measuring output {}", output_path.display()), e))?
                .len();
            final_size = current_size;

            let attempt = EncodeAttempt {
                attempt_number,
                requested_bitrate_bps: bitrate,
                resulting_size_bytes: Some(current_size),
            };
            debug!("Run {}: attempt {:?}", run_id, attempt);
            attempts.push(attempt.clone());
            self.sink
                .record(FitEvent::AttemptFinished {
                    run_id: run_id.to_string(),
                    attempt,
                })
                .await;

            if current_size <= cfg.max_size_bytes {
                termination = Termination::SizeSatisfied;
                break;
            }
            if bitrate <= cfg.floor_bitrate_bps {
                termination = Termination::FloorAccepted;
                break;
            }
            if attempt_number == cfg.max_attempts {
                // Keep the last candidate rather than returning nothing
                break;
            }

            // Never keep more than one candidate on disk
            remove_if_exists(output_path)
                .await
                .map_err(|e| FitError::io(format!("deleting oversized output {}", output_path.display()), e))?;

            bitrate = next_bitrate(bitrate, current_size, cfg.max_size_bytes, cfg.floor_bitrate_bps);
            info!(
                "Run {}: re-encoding attempt {}: file too large ({} bytes), reducing bitrate to {} bps",
                run_id, attempt_number, current_size, bitrate
            );
        }

        match termination {
            Termination::SizeSatisfied => info!(
                "Run {}: audio re-encoding completed in {} attempt(s). Output size: {} bytes, bitrate: {} bps",
                run_id,
                attempts.len(),
                final_size,
                bitrate
            ),
            Termination::FloorAccepted => warn!(
                "Run {}: output still {} bytes (ceiling {}) at floor bitrate {} bps, keeping best effort",
                run_id, final_size, cfg.max_size_bytes, bitrate
            ),
            Termination::AttemptsExhausted => warn!(
                "Run {}: gave up after {} attempts at {} bps with {} bytes, keeping last output",
                run_id,
                attempts.len(),
                bitrate,
                final_size
            ),
        }
        self.sink
            .record(FitEvent::Terminated {
                run_id: run_id.to_string(),
                reason: termination,
                attempts: attempts.len() as u32,
                final_bitrate_bps: bitrate,
                final_size_bytes: final_size,
            })
            .await;

        // Teardown
        temp_input.remove().await?;
        output.keep = true;
        debug!("Run {}: cleaned up temporary input file", run_id);

        Ok(ProcessingResult {
            processed_file: output_path.to_path_buf(),
            original_file_size_bytes: original_size,
            processed_file_size_bytes: final_size,
            original_file_name: original_name,
            final_bitrate_bps: bitrate,
            termination,
            attempts,
        })
    }
}
