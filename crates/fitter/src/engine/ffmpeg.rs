use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use crate::config::EngineConfig;
use crate::engine::bridge::{Bridged, CallbackEngine, EncodeHandle, EncodeListener};
use crate::engine::EncodeRequest;
use crate::error::EngineError;
use crate::format::TargetFormat;

/// Lines of ffmpeg stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FfmpegVersion {
    /// Parse version from the first line of `ffmpeg -version`
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> FfmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Result<Self, EngineError> {
        let version_part = version_str
            .split_whitespace()
            .skip_while(|s| *s != "version")
            .nth(1)
            .or_else(|| {
                version_str
                    .split_whitespace()
                    .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            })
            .ok_or_else(|| EngineError::new(format!("No version number found in: {}", version_str)))?;

        // Builds from git report "N-12345-g..."; distro builds append "-3ubuntu5"
        let numeric: String = version_part
            .trim_start_matches('n')
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let major = parts
            .next()
            .ok_or_else(|| EngineError::new(format!("Invalid version format: {}", version_str)))?
            .parse::<u32>()
            .map_err(|e| EngineError::with_cause(format!("Invalid major version in: {}", version_str), e))?;
        let minor = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);

        Ok(FfmpegVersion { major, minor, patch })
    }
}

/// Callback-style engine driving the ffmpeg CLI
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    config: EngineConfig,
}

impl FfmpegEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Wrap in the awaitable adapter used by the bitrate search
    pub fn into_encoder(self) -> Bridged<Self> {
        Bridged::new(self)
    }

    pub fn ffmpeg_bin(&self) -> &Path {
        &self.config.ffmpeg_bin
    }

    /// Verify the binary runs and ships the encoder `target` needs
    pub async fn check(&self, target: TargetFormat) -> Result<FfmpegVersion, EngineError> {
        let version = self.detect_version().await?;

        let output = Command::new(&self.config.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .await
            .map_err(|e| EngineError::with_cause(
                format!("Failed to query FFmpeg encoders at: {}", self.config.ffmpeg_bin.display()),
                e,
            ))?;

        if !output.status.success() {
            return Err(EngineError::new("FFmpeg encoder query failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !lists_encoder(&stdout, target.encoder_name()) {
            return Err(EngineError::new(format!(
                "FFmpeg at {} has no '{}' encoder, required for {}",
                self.config.ffmpeg_bin.display(),
                target.encoder_name(),
                target
            )));
        }

        info!(
            "Using FFmpeg {}.{}.{} with encoder {}",
            version.major, version.minor, version.patch, target.encoder_name()
        );
        Ok(version)
    }

    async fn detect_version(&self) -> Result<FfmpegVersion, EngineError> {
        let output = Command::new(&self.config.ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .map_err(|e| EngineError::with_cause(
                format!("Failed to execute FFmpeg at: {}", self.config.ffmpeg_bin.display()),
                e,
            ))?;

        if !output.status.success() {
            return Err(EngineError::new("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| EngineError::new("Empty output from FFmpeg -version"))?;

        FfmpegVersion::parse(first_line)
    }
}

/// `ffmpeg -encoders` rows look like " A....D aac    AAC (Advanced Audio Coding)"
fn lists_encoder(encoders_output: &str, name: &str) -> bool {
    encoders_output
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(name))
}

/// Build the ffmpeg argument list for one constant-bitrate audio encode
pub fn build_encode_args(request: &EncodeRequest) -> Vec<String> {
    let mut args = Vec::new();

    args.push("-hide_banner".to_string());
    args.push("-nostdin".to_string());
    // Overwrite: the output path is reused across attempts
    args.push("-y".to_string());

    args.push("-i".to_string());
    args.push(request.input.to_string_lossy().to_string());

    // Audio only, first audio stream
    args.push("-vn".to_string());
    args.push("-map".to_string());
    args.push("0:a:0".to_string());

    args.push("-c:a".to_string());
    args.push(request.target.encoder_name().to_string());
    args.push("-b:a".to_string());
    args.push(request.bitrate_bps.to_string());

    if request.target == TargetFormat::AacM4a {
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
    }

    args.push("-f".to_string());
    args.push(request.target.muxer_name().to_string());
    args.push(request.output.to_string_lossy().to_string());

    args
}

/// How often a running encode is checked for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type SharedChild = Arc<Mutex<Child>>;

/// Spawned ffmpeg run. Cancelling signals the child before returning.
pub struct FfmpegJob {
    child: Option<SharedChild>,
    task: Option<JoinHandle<()>>,
}

impl EncodeHandle for FfmpegJob {
    fn cancel(&mut self) {
        if let Some(child) = &self.child {
            let mut child = child.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = child.start_kill() {
                debug!("FFmpeg already exited on cancel: {}", e);
            }
        }
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl FfmpegJob {
    fn spawn(
        ffmpeg_bin: &Path,
        args: Vec<String>,
        timeout_secs: Option<u64>,
        listener: EncodeListener,
    ) -> Self {
        let cmd_str = format!("{} {}", ffmpeg_bin.display(), args.join(" "));
        debug!("Executing FFmpeg: {}", cmd_str);

        let spawned = Command::new(ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                listener.on_error(EngineError::with_cause(
                    format!(
                        "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
                        ffmpeg_bin.display()
                    ),
                    e,
                ));
                return Self { child: None, task: None };
            }
        };

        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let watched = child.clone();

        let task = tokio::spawn(async move {
            match wait_ffmpeg(&watched, stderr, cmd_str, timeout_secs).await {
                Ok(()) => listener.on_completed(),
                Err(e) => listener.on_error(e),
            };
        });

        Self {
            child: Some(child),
            task: Some(task),
        }
    }
}

impl CallbackEngine for FfmpegEngine {
    type Handle = FfmpegJob;

    fn start(&self, request: EncodeRequest, listener: EncodeListener) -> FfmpegJob {
        let args = build_encode_args(&request);
        FfmpegJob::spawn(&self.config.ffmpeg_bin, args, self.config.timeout_secs, listener)
    }
}

/// Poll the child until it exits. The lock is only held for `try_wait`, so
/// a cancel can always reach the child.
async fn wait_for_exit(child: &Mutex<Child>) -> std::io::Result<ExitStatus> {
    let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let status = child.lock().unwrap_or_else(|p| p.into_inner()).try_wait()?;
        if let Some(status) = status {
            return Ok(status);
        }
    }
}

/// Wait for ffmpeg to finish, collecting stderr for diagnostics
async fn wait_ffmpeg(
    child: &Mutex<Child>,
    stderr: Option<ChildStderr>,
    cmd_str: String,
    timeout_secs: Option<u64>,
) -> Result<(), EngineError> {
    let stderr = stderr.ok_or_else(|| EngineError::new("Failed to capture FFmpeg stderr"))?;

    let stderr_handle = tokio::spawn(async move {
        let mut tail: Vec<String> = Vec::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line);
        }
        tail.join("\n")
    });

    let status = match timeout_secs {
        Some(secs) => match timeout(Duration::from_secs(secs), wait_for_exit(child)).await {
            Ok(result) => result.map_err(|e| EngineError::with_cause("Failed to wait for FFmpeg process", e))?,
            Err(_) => {
                let killed = child.lock().unwrap_or_else(|p| p.into_inner()).start_kill();
                if let Err(e) = killed {
                    warn!("Failed to kill stuck FFmpeg process: {}", e);
                }
                stderr_handle.abort();
                return Err(EngineError::new(format!(
                    "FFmpeg process timed out after {} seconds. Process was killed.",
                    secs
                )));
            }
        },
        None => wait_for_exit(child)
            .await
            .map_err(|e| EngineError::with_cause("Failed to wait for FFmpeg process", e))?,
    };

    let stderr_tail = stderr_handle.await.unwrap_or_default();

    if !status.success() {
        return Err(EngineError::new(format!(
            "FFmpeg encoding failed (exit code: {})\nCommand: {}\nSTDERR:\n{}",
            status.code().unwrap_or(-1),
            cmd_str,
            stderr_tail
        )));
    }

    debug!("FFmpeg execution completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Encoder;
    use std::path::PathBuf;
    use proptest::prelude::*;

    fn request(target: TargetFormat, bitrate_bps: u32) -> EncodeRequest {
        EncodeRequest {
            input: PathBuf::from("/cache/temp_audio_1700000000000_ab12cd34"),
            output: PathBuf::from("/out/transcription_audio.m4a"),
            bitrate_bps,
            target,
        }
    }

    #[test]
    fn test_version_parsing() {
        let v1 = FfmpegVersion::parse("ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023").unwrap();
        assert_eq!(v1, FfmpegVersion { major: 6, minor: 1, patch: 1 });

        let v2 = FfmpegVersion::parse("ffmpeg version 7.0").unwrap();
        assert_eq!(v2, FfmpegVersion { major: 7, minor: 0, patch: 0 });

        let v3 = FfmpegVersion::parse("ffmpeg version n5.1.4 Copyright").unwrap();
        assert_eq!(v3, FfmpegVersion { major: 5, minor: 1, patch: 4 });

        assert!(FfmpegVersion::parse("ffmpeg version N-abc").is_err());
        assert!(FfmpegVersion::parse("").is_err());
    }

    #[test]
    fn test_encoder_listing_detection() {
        let listing = "Encoders:\n V..... = Video\n ------\n A....D aac                  AAC (Advanced Audio Coding)\n A..... libopus              libopus Opus\n";
        assert!(lists_encoder(listing, "aac"));
        assert!(lists_encoder(listing, "libopus"));
        assert!(!lists_encoder(listing, "libmp3lame"));
        // Description text must not count as an encoder name
        assert!(!lists_encoder(listing, "Opus"));
    }

    #[test]
    fn test_encode_args_for_m4a() {
        let args = build_encode_args(&request(TargetFormat::AacM4a, 32_000));

        let joined = args.join(" ");
        assert!(joined.starts_with("-hide_banner -nostdin -y -i /cache/temp_audio_"));
        assert!(joined.contains("-vn -map 0:a:0 -c:a aac -b:a 32000"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.ends_with("-f mp4 /out/transcription_audio.m4a"));
    }

    #[test]
    fn test_encode_args_for_opus_skip_movflags() {
        let args = build_encode_args(&request(TargetFormat::OpusOgg, 24_000));
        assert!(!args.contains(&"-movflags".to_string()));
        let codec_pos = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[codec_pos + 1], "libopus");
        let fmt_pos = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[fmt_pos + 1], "ogg");
    }

    proptest! {
        /// The requested bitrate always reaches ffmpeg verbatim, right after `-b:a`
        #[test]
        fn test_bitrate_passed_verbatim(bitrate in 1u32..1_000_000) {
            for target in TargetFormat::ALL {
                let args = build_encode_args(&request(target, bitrate));
                let pos = args.iter().position(|a| a == "-b:a").unwrap();
                prop_assert_eq!(&args[pos + 1], &bitrate.to_string());
                prop_assert_eq!(args.last().unwrap(), "/out/transcription_audio.m4a");
            }
        }
    }

    #[tokio::test]
    async fn test_missing_binary_surfaces_as_engine_error() {
        let engine = FfmpegEngine::new(EngineConfig {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg-binary-12345"),
            timeout_secs: None,
        });

        let err = engine
            .clone()
            .into_encoder()
            .encode(&request(TargetFormat::AacM4a, 32_000))
            .await
            .unwrap_err();
        assert!(err.message().contains("Failed to spawn FFmpeg"));

        let check = engine.check(TargetFormat::AacM4a).await.unwrap_err();
        assert!(check.message().contains("Failed to execute FFmpeg"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_signals_child_before_returning() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut job = FfmpegJob::spawn(
            Path::new("sleep"),
            vec!["30".to_string()],
            None,
            EncodeListener::new(tx),
        );
        let child = job.child.clone().expect("sleep should spawn");

        job.cancel();

        // Block the only runtime thread so the watcher task cannot run:
        // the child can only have died from the cancel itself.
        let mut status = None;
        for _ in 0..200 {
            status = child.lock().unwrap().try_wait().unwrap();
            if status.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(status.is_some_and(|s| !s.success()), "child still running after cancel");
        drop(rx);
    }
}
