use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::FitError;
use crate::format::TargetFormat;

/// Per-run knobs for the bitrate search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Codec/container the input is re-encoded to
    pub target: TargetFormat,
    /// Bitrate of the first attempt, in bits per second
    pub initial_bitrate_bps: u32,
    /// Bitrate is never reduced below this value
    pub floor_bitrate_bps: u32,
    /// Size ceiling for the processed file (the upload limit)
    pub max_size_bytes: u64,
    /// Upper bound on encode attempts per run
    pub max_attempts: u32,
    /// Stem of the reusable output file; the extension comes from `target`
    pub output_key: String,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            target: TargetFormat::AacM4a,
            initial_bitrate_bps: 32_000,
            floor_bitrate_bps: 16_000,
            max_size_bytes: 25 * 1024 * 1024, // 25 MiB
            max_attempts: 10,
            output_key: "transcription_audio".to_string(),
        }
    }
}

impl FitConfig {
    /// Reject configurations whose search could not terminate or could not
    /// name its output file
    pub fn validate(&self) -> std::result::Result<(), FitError> {
        if self.floor_bitrate_bps == 0 {
            return Err(FitError::InvalidConfig("floor bitrate must be at least 1 bps".into()));
        }
        if self.initial_bitrate_bps < self.floor_bitrate_bps {
            return Err(FitError::InvalidConfig(format!(
                "initial bitrate {} bps is below the floor of {} bps",
                self.initial_bitrate_bps, self.floor_bitrate_bps
            )));
        }
        if self.max_size_bytes == 0 {
            return Err(FitError::InvalidConfig("max size must be at least 1 byte".into()));
        }
        if self.max_attempts == 0 {
            return Err(FitError::InvalidConfig("max attempts must be at least 1".into()));
        }
        let key = self.output_key.trim();
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(FitError::InvalidConfig(format!(
                "output key '{}' must be a plain file stem",
                self.output_key
            )));
        }
        Ok(())
    }

    /// Fixed output path of a run with this configuration
    pub fn output_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.{}", self.output_key.trim(), self.target.extension()))
    }
}

/// Settings handed to the transcoding engine at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the ffmpeg binary (PATH lookup when not absolute)
    pub ffmpeg_bin: PathBuf,
    /// Kill an attempt that runs longer than this many seconds
    pub timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            timeout_secs: None,
        }
    }
}

/// Configuration for the audiofit tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub fit: FitConfig,
    pub engine: EngineConfig,
    /// Private area for materialized temp inputs
    pub cache_dir: PathBuf,
    /// Directory holding the fixed output file
    pub output_dir: PathBuf,
    /// Append-only history log; disabled when unset
    pub history_log: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Environment variables consulted by [`AppConfig::apply_env_overrides`]
pub const ENV_INITIAL_BITRATE: &str = "AUDIOFIT_INITIAL_BITRATE";
pub const ENV_FLOOR_BITRATE: &str = "AUDIOFIT_FLOOR_BITRATE";
pub const ENV_MAX_SIZE_BYTES: &str = "AUDIOFIT_MAX_SIZE_BYTES";
pub const ENV_MAX_ATTEMPTS: &str = "AUDIOFIT_MAX_ATTEMPTS";
pub const ENV_FFMPEG_BIN: &str = "AUDIOFIT_FFMPEG_BIN";
pub const ENV_ENCODE_TIMEOUT_SECS: &str = "AUDIOFIT_ENCODE_TIMEOUT_SECS";

impl AppConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        let base = std::env::temp_dir().join("audiofit");
        Self {
            fit: FitConfig::default(),
            engine: EngineConfig::default(),
            cache_dir: base.join("cache"),
            output_dir: base.join("output"),
            history_log: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Apply `AUDIOFIT_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` as the variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<u32>(&lookup, ENV_INITIAL_BITRATE)? {
            self.fit.initial_bitrate_bps = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, ENV_FLOOR_BITRATE)? {
            self.fit.floor_bitrate_bps = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, ENV_MAX_SIZE_BYTES)? {
            self.fit.max_size_bytes = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, ENV_MAX_ATTEMPTS)? {
            self.fit.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, ENV_ENCODE_TIMEOUT_SECS)? {
            self.engine.timeout_secs = Some(v);
        }
        if let Some(bin) = lookup(ENV_FFMPEG_BIN).filter(|s| !s.trim().is_empty()) {
            self.engine.ffmpeg_bin = PathBuf::from(bin.trim());
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: '{}'", key, raw))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_upload_limits() {
        let cfg = FitConfig::default();
        assert_eq!(cfg.initial_bitrate_bps, 32_000);
        assert_eq!(cfg.floor_bitrate_bps, 16_000);
        assert_eq!(cfg.max_size_bytes, 26_214_400);
        assert_eq!(cfg.max_attempts, 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_output_path_uses_key_and_extension() {
        let cfg = FitConfig {
            target: TargetFormat::OpusOgg,
            output_key: "meeting".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.output_path(Path::new("/data")), PathBuf::from("/data/meeting.ogg"));
        assert_eq!(
            FitConfig::default().output_path(Path::new("/data")),
            PathBuf::from("/data/transcription_audio.m4a")
        );
    }

    #[test]
    fn test_validate_rejects_non_terminating_configs() {
        let zero_floor = FitConfig { floor_bitrate_bps: 0, ..Default::default() };
        assert!(matches!(zero_floor.validate(), Err(FitError::InvalidConfig(_))));

        let no_attempts = FitConfig { max_attempts: 0, ..Default::default() };
        assert!(no_attempts.validate().is_err());

        let below_floor = FitConfig {
            initial_bitrate_bps: 8_000,
            floor_bitrate_bps: 16_000,
            ..Default::default()
        };
        assert!(below_floor.validate().is_err());

        let zero_size = FitConfig { max_size_bytes: 0, ..Default::default() };
        assert!(zero_size.validate().is_err());

        let nested_key = FitConfig { output_key: "../escape".to_string(), ..Default::default() };
        assert!(nested_key.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let cfg = AppConfig::load_config(Some(Path::new("/nonexistent/audiofit.toml"))).unwrap();
        assert_eq!(cfg, AppConfig::default_config());

        let cfg = AppConfig::load_config(None).unwrap();
        assert_eq!(cfg.fit, FitConfig::default());
    }

    #[test]
    fn test_load_toml_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audiofit.toml");
        std::fs::write(
            &path,
            r#"
output_dir = "/srv/out"

[fit]
target = "opus-ogg"
max_size_bytes = 1048576

[engine]
timeout_secs = 600
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(cfg.fit.target, TargetFormat::OpusOgg);
        assert_eq!(cfg.fit.max_size_bytes, 1_048_576);
        assert_eq!(cfg.fit.initial_bitrate_bps, 32_000);
        assert_eq!(cfg.engine.timeout_secs, Some(600));
        assert_eq!(cfg.engine.ffmpeg_bin, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_load_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audiofit.json");
        std::fs::write(&path, r#"{"fit": {"max_attempts": 3}, "history_log": "/tmp/h.txt"}"#).unwrap();

        let cfg = AppConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.fit.max_attempts, 3);
        assert_eq!(cfg.history_log, Some(PathBuf::from("/tmp/h.txt")));
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audiofit.toml");
        std::fs::write(&path, "fit = [").unwrap();
        assert!(AppConfig::load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_env_overrides_apply_on_top_of_file() {
        let mut cfg = AppConfig::default_config();
        cfg.apply_overrides_from(env(&[
            (ENV_INITIAL_BITRATE, "64000"),
            (ENV_FLOOR_BITRATE, " 24000 "),
            (ENV_MAX_SIZE_BYTES, "1000000"),
            (ENV_MAX_ATTEMPTS, "4"),
            (ENV_FFMPEG_BIN, "/opt/ffmpeg/bin/ffmpeg"),
            (ENV_ENCODE_TIMEOUT_SECS, "90"),
        ]))
        .unwrap();

        assert_eq!(cfg.fit.initial_bitrate_bps, 64_000);
        assert_eq!(cfg.fit.floor_bitrate_bps, 24_000);
        assert_eq!(cfg.fit.max_size_bytes, 1_000_000);
        assert_eq!(cfg.fit.max_attempts, 4);
        assert_eq!(cfg.engine.ffmpeg_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(cfg.engine.timeout_secs, Some(90));
    }

    #[test]
    fn test_env_override_errors_name_the_variable() {
        let mut cfg = AppConfig::default_config();
        let err = cfg
            .apply_overrides_from(env(&[(ENV_MAX_ATTEMPTS, "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_ATTEMPTS));
        assert_eq!(cfg.fit.max_attempts, 10);
    }
}
