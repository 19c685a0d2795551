//! Copies an input handle into a private temp file the engine can read.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use log::{debug, info, warn};
use sysinfo::{Pid, System};
use tokio::io::{AsyncRead, AsyncWriteExt};
use walkdir::WalkDir;
use crate::error::FitError;

/// File name prefix of every materialized input
pub const TEMP_INPUT_PREFIX: &str = "temp_audio_";

/// Byte stream returned by [`InputHandle::open`]
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opaque reference to input media. It need not be a filesystem path.
pub trait InputHandle: Send + Sync {
    /// Identifier of the handle (a path or URI-like string)
    fn identifier(&self) -> String;

    /// Open the handle's byte stream
    fn open(&self) -> impl Future<Output = io::Result<InputStream>> + Send;

    /// Display name from the handle's own metadata, if it carries any
    fn metadata_display_name(&self) -> Option<String> {
        None
    }
}

/// Input backed by a local file
#[derive(Debug, Clone)]
pub struct PathInput {
    path: PathBuf,
}

impl PathInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InputHandle for PathInput {
    fn identifier(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    async fn open(&self) -> io::Result<InputStream> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

/// In-memory input, e.g. media received over a socket
#[derive(Debug, Clone)]
pub struct BytesInput {
    id: String,
    name: Option<String>,
    bytes: Vec<u8>,
}

impl BytesInput {
    pub fn new(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            name: None,
            bytes,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl InputHandle for BytesInput {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    async fn open(&self) -> io::Result<InputStream> {
        Ok(Box::new(io::Cursor::new(self.bytes.clone())))
    }

    fn metadata_display_name(&self) -> Option<String> {
        self.name.clone()
    }
}

/// Best-effort display name: metadata first, then the last path-like segment
/// of the identifier. Never fails.
pub fn best_effort_display_name<H: InputHandle + ?Sized>(input: &H) -> Option<String> {
    if let Some(name) = input.metadata_display_name().filter(|n| !n.trim().is_empty()) {
        return Some(name);
    }
    last_path_segment(&input.identifier())
}

fn last_path_segment(identifier: &str) -> Option<String> {
    let without_query = identifier.split(['?', '#']).next().unwrap_or("");
    without_query
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .filter(|s| !s.ends_with(':'))
        .map(str::to_string)
}

/// A materialized input owned by one run. Deleted on drop if not removed
/// explicitly.
#[derive(Debug)]
pub struct TempInput {
    path: PathBuf,
    size_bytes: u64,
    removed: bool,
}

impl TempInput {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Delete the temp file now
    pub async fn remove(mut self) -> Result<(), FitError> {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FitError::io(
                format!("deleting temp input {}", self.path.display()),
                e,
            )),
        }
    }
}

impl Drop for TempInput {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Dropped temp input {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete temp input {}: {}", self.path.display(), e),
        }
    }
}

/// `temp_audio_{millis}_{pid}_{token}`
fn temp_input_name(millis: i64, pid: u32, token: &str) -> String {
    format!("{}{}_{}_{}", TEMP_INPUT_PREFIX, millis, pid, token)
}

/// Pid of the process that created a temp input, if its name carries one
fn owner_pid(file_name: &str) -> Option<u32> {
    let mut parts = file_name.strip_prefix(TEMP_INPUT_PREFIX)?.split('_');
    let _millis = parts.next()?;
    let pid = parts.next()?.parse().ok()?;
    let _token = parts.next()?;
    match parts.next() {
        None => Some(pid),
        Some(_) => None,
    }
}

/// Copy `input` verbatim into a freshly named file under `cache_dir`.
///
/// The name carries a millisecond timestamp, the owning pid and a random
/// token so concurrent or retried runs never collide, and so a sweep can
/// tell inputs of live processes from leftovers. A failed copy leaves no
/// file behind.
pub async fn materialize<H: InputHandle + ?Sized>(
    input: &H,
    cache_dir: &Path,
) -> Result<TempInput, FitError> {
    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| FitError::io(format!("creating cache dir {}", cache_dir.display()), e))?;

    let token = uuid::Uuid::new_v4().simple().to_string();
    let file_name = temp_input_name(
        chrono::Utc::now().timestamp_millis(),
        std::process::id(),
        &token[..8],
    );
    let path = cache_dir.join(file_name);

    let mut reader = input
        .open()
        .await
        .map_err(|e| FitError::io(format!("opening input stream for {}", input.identifier()), e))?;

    // From here on the guard owns the file and deletes it on any error.
    let mut temp = TempInput {
        path,
        size_bytes: 0,
        removed: false,
    };

    let mut file = tokio::fs::File::create(&temp.path)
        .await
        .map_err(|e| FitError::io(format!("creating temp input {}", temp.path.display()), e))?;

    let copied = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|e| FitError::io(format!("copying {} into cache", input.identifier()), e))?;
    file.flush()
        .await
        .map_err(|e| FitError::io(format!("flushing temp input {}", temp.path.display()), e))?;
    drop(file);

    temp.size_bytes = copied;
    debug!("Materialized {} -> {} ({} bytes)", input.identifier(), temp.path.display(), copied);
    Ok(temp)
}

/// Answers whether a temp input's owner process is still running
struct LiveOwners {
    own_pid: u32,
    system: Option<System>,
}

impl LiveOwners {
    fn new() -> Self {
        Self {
            own_pid: std::process::id(),
            system: None,
        }
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        if pid == self.own_pid {
            return true;
        }
        // Process table is read once, on the first foreign pid
        let system = self.system.get_or_insert_with(System::new_all);
        system.process(Pid::from_u32(pid)).is_some()
    }
}

/// Remove temp inputs left behind by crashed runs.
///
/// Only files carrying [`TEMP_INPUT_PREFIX`], last modified more than
/// `older_than` ago and not owned by a running process are touched. Files
/// that cannot be removed are logged and skipped. Returns the number of
/// files deleted.
pub fn sweep_stale_inputs(cache_dir: &Path, older_than: Duration) -> io::Result<usize> {
    if !cache_dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut owners = LiveOwners::new();
    let mut removed = 0;

    for entry in WalkDir::new(cache_dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading cache entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = match entry.file_name().to_str() {
            Some(name) if name.starts_with(TEMP_INPUT_PREFIX) => name,
            _ => continue,
        };

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|mtime| now.duration_since(mtime).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        if let Some(pid) = owner_pid(file_name) {
            if owners.is_alive(pid) {
                debug!("Keeping temp input of running process {}: {}", pid, entry.path().display());
                continue;
            }
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("Deleted stale temp input: {}", entry.path().display());
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete stale temp input {}: {}", entry.path().display(), e),
        }
    }

    Ok(removed)
}
