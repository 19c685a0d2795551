use anyhow::{bail, Context, Result};
use clap::Parser;
use fitter::{
    sweep_stale_inputs, AppConfig, BitrateFitter, Encoder, EventSink, FfmpegEngine, HistoryLog,
    InputHandle, PathInput, ProcessingResult, TargetFormat, Termination,
};
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;

/// Temp inputs older than this are leftovers of interrupted runs
const STALE_INPUT_AGE: Duration = Duration::from_secs(60 * 60);

/// Re-encode an audio file until it fits under a size ceiling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Audio file to fit
    input: PathBuf,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output container/codec (aac-m4a, opus-ogg, mp3)
    #[arg(short, long)]
    format: Option<TargetFormat>,

    /// First bitrate to try, in bps
    #[arg(long)]
    initial_bitrate: Option<u32>,

    /// Lowest bitrate the search may use, in bps
    #[arg(long)]
    floor_bitrate: Option<u32>,

    /// Size ceiling in bytes
    #[arg(long)]
    max_size: Option<u64>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Output file stem
    #[arg(long)]
    key: Option<String>,

    /// Append run history to this file
    #[arg(long)]
    history_log: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply_to(&self, cfg: &mut AppConfig) {
        if let Some(format) = self.format {
            cfg.fit.target = format;
        }
        if let Some(v) = self.initial_bitrate {
            cfg.fit.initial_bitrate_bps = v;
        }
        if let Some(v) = self.floor_bitrate {
            cfg.fit.floor_bitrate_bps = v;
        }
        if let Some(v) = self.max_size {
            cfg.fit.max_size_bytes = v;
        }
        if let Some(v) = self.max_attempts {
            cfg.fit.max_attempts = v;
        }
        if let Some(dir) = &self.output_dir {
            cfg.output_dir = dir.clone();
        }
        if let Some(dir) = &self.cache_dir {
            cfg.cache_dir = dir.clone();
        }
        if let Some(key) = &self.key {
            cfg.fit.output_key = key.clone();
        }
        if let Some(path) = &self.history_log {
            cfg.history_log = Some(path.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; --verbose only raises the default
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = AppConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    cfg.apply_env_overrides()
        .context("Failed to apply environment overrides")?;
    args.apply_to(&mut cfg);
    cfg.fit.validate().context("Invalid configuration")?;

    info!("audiofit starting");
    info!("  Target: {}", cfg.fit.target);
    info!(
        "  Bitrate: {} bps, floor {} bps, {} attempt(s) max",
        cfg.fit.initial_bitrate_bps, cfg.fit.floor_bitrate_bps, cfg.fit.max_attempts
    );
    info!("  Size ceiling: {} bytes", cfg.fit.max_size_bytes);
    info!("  Cache dir: {}", cfg.cache_dir.display());
    info!("  Output dir: {}", cfg.output_dir.display());

    let swept = sweep_stale_inputs(&cfg.cache_dir, STALE_INPUT_AGE)
        .with_context(|| format!("Failed to sweep cache dir: {}", cfg.cache_dir.display()))?;
    if swept > 0 {
        info!("Removed {} stale temp input(s)", swept);
    }

    let engine = FfmpegEngine::new(cfg.engine.clone());
    engine
        .check(cfg.fit.target)
        .await
        .context("FFmpeg is not usable")?;

    let input = PathInput::new(&args.input);
    let fitter = BitrateFitter::new(
        engine.into_encoder(),
        cfg.fit.clone(),
        cfg.cache_dir.clone(),
        cfg.output_dir.clone(),
    )?;

    let result = match &cfg.history_log {
        Some(path) => {
            let history = HistoryLog::open(path)
                .await
                .with_context(|| format!("Failed to open history log: {}", path.display()))?;
            info!("Recording history to {}", history.path().display());
            fit_until_interrupted(&fitter.with_history(history), &input).await?
        }
        None => fit_until_interrupted(&fitter, &input).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    if result.exceeds(cfg.fit.max_size_bytes) {
        warn!(
            "{} is still larger than the {} ceiling",
            result.processed_file.display(),
            format_size(cfg.fit.max_size_bytes, DECIMAL)
        );
        std::process::exit(2);
    }

    Ok(())
}

/// Run the fit, dropping it (and its temp files) on Ctrl-C
async fn fit_until_interrupted<E, S, H>(
    fitter: &BitrateFitter<E, S>,
    input: &H,
) -> Result<ProcessingResult>
where
    E: Encoder,
    S: EventSink,
    H: InputHandle,
{
    tokio::select! {
        result = fitter.fit(input) => {
            result.with_context(|| format!("Failed to fit {}", input.identifier()))
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cleaning up");
            bail!("Interrupted before {} was processed", input.identifier())
        }
    }
}

fn print_summary(result: &ProcessingResult) {
    let outcome = match result.termination {
        Termination::SizeSatisfied => "fits",
        Termination::FloorAccepted => "floor bitrate reached",
        Termination::AttemptsExhausted => "attempt limit reached",
    };

    println!("Output:   {}", result.processed_file.display());
    if let Some(name) = &result.original_file_name {
        println!("Source:   {}", name);
    }
    println!(
        "Size:     {} -> {} ({})",
        format_size(result.original_file_size_bytes, DECIMAL),
        format_size(result.processed_file_size_bytes, DECIMAL),
        outcome
    );
    println!(
        "Bitrate:  {} kbps after {} attempt(s)",
        result.final_bitrate_bps / 1000,
        result.attempts.len()
    );
}
