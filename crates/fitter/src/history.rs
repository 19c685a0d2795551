//! Append-only, line-oriented history log.
//!
//! Line format: `[yyyy-MM-dd HH:mm:ss.SSS] [CATEGORY] message`, local time.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use chrono::{Local, NaiveDateTime};
use log::warn;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use crate::controller::Termination;
use crate::events::{EventSink, FitEvent};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    /// Audio re-encoding
    Reencode,
    /// Upload / API communication
    ApiCall,
    /// File operations
    FileOp,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Reencode => "REENCODE",
            LogCategory::ApiCall => "API_CALL",
            LogCategory::FileOp => "FILE_OP",
            LogCategory::Error => "ERROR",
        }
    }

    /// Unknown names are filed under `Error`
    fn from_name(name: &str) -> Self {
        match name {
            "REENCODE" => LogCategory::Reencode,
            "API_CALL" => LogCategory::ApiCall,
            "FILE_OP" => LogCategory::FileOp,
            _ => LogCategory::Error,
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub category: LogCategory,
    pub message: String,
}

/// Parse one history line; `None` for blank or malformed lines
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let rest = line.strip_prefix('[')?;
    let (timestamp, rest) = rest.split_once(']')?;
    let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;

    let rest = rest.trim_start().strip_prefix('[')?;
    let (category, message) = rest.split_once(']')?;

    Some(LogEntry {
        timestamp,
        category: LogCategory::from_name(category),
        message: message.strip_prefix(' ').unwrap_or(message).to_string(),
    })
}

fn format_line(timestamp: NaiveDateTime, category: LogCategory, message: &str) -> String {
    // Keep one event per line
    let message = message.replace(['\r', '\n'], " ");
    format!("[{}] [{}] {}\n", timestamp.format(TIMESTAMP_FORMAT), category, message)
}

/// Persistent history shared by every run that holds a reference to it
#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryLog {
    /// Open (creating if needed) the log file at `path`
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a line. Write failures are reported through `log` only.
    pub async fn log(&self, category: LogCategory, message: &str) {
        let line = format_line(Local::now().naive_local(), category, message);
        let _guard = self.lock.lock().await;
        if let Err(e) = self.append(&line).await {
            warn!("Failed to write history log {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// All parseable entries, oldest first
    pub async fn entries(&self) -> Vec<LogEntry> {
        self.text().await.lines().filter_map(parse_line).collect()
    }

    /// Raw log contents, empty if unreadable
    pub async fn text(&self) -> String {
        let _guard = self.lock.lock().await;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read history log {}: {}", self.path.display(), e);
                String::new()
            }
        }
    }

    pub async fn clear(&self) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        tokio::fs::write(&self.path, b"").await
    }
}

fn describe(event: &FitEvent) -> (LogCategory, String) {
    match event {
        FitEvent::RunStarted {
            run_id,
            input,
            initial_bitrate_bps,
            max_size_bytes,
        } => (
            LogCategory::Reencode,
            format!(
                "run {}: processing {}, starting at {} bps for a {} byte ceiling",
                run_id, input, initial_bitrate_bps, max_size_bytes
            ),
        ),
        FitEvent::InputMaterialized {
            run_id,
            temp_input,
            original_size_bytes,
        } => (
            LogCategory::FileOp,
            format!(
                "run {}: copied input to {} ({} bytes)",
                run_id,
                temp_input.display(),
                original_size_bytes
            ),
        ),
        FitEvent::AttemptFinished { run_id, attempt } => (
            LogCategory::Reencode,
            format!(
                "run {}: attempt {} at {} bps produced {} bytes",
                run_id,
                attempt.attempt_number,
                attempt.requested_bitrate_bps,
                attempt
                    .resulting_size_bytes
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no".to_string())
            ),
        ),
        FitEvent::Terminated {
            run_id,
            reason,
            attempts,
            final_bitrate_bps,
            final_size_bytes,
        } => {
            let why = match reason {
                Termination::SizeSatisfied => "size within ceiling",
                Termination::FloorAccepted => "floor bitrate reached, accepted oversized output",
                Termination::AttemptsExhausted => "attempt cap reached, kept last output",
            };
            (
                LogCategory::Reencode,
                format!(
                    "run {}: re-encoding completed in {} attempt(s) ({}). Output size: {} bytes, bitrate: {} bps",
                    run_id, attempts, why, final_size_bytes, final_bitrate_bps
                ),
            )
        }
        FitEvent::Failed { run_id, message } => (
            LogCategory::Error,
            format!("run {}: audio file processing failed: {}", run_id, message),
        ),
        FitEvent::TeardownComplete { run_id, output } => (
            LogCategory::FileOp,
            match output {
                Some(path) => format!(
                    "run {}: cleaned up temporary input, output kept at {}",
                    run_id,
                    path.display()
                ),
                None => format!("run {}: cleaned up temporary input and output", run_id),
            },
        ),
    }
}

impl EventSink for HistoryLog {
    async fn record(&self, event: FitEvent) {
        let (category, message) = describe(&event);
        self.log(category, &message).await;
    }
}
