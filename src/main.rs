//! framemover - batch move/copy engine for files and image sequences.
//!
//! Usage:
//!   fmv run <PLAN>         Execute a mapping plan with live progress
//!   fmv undo               Undo the last batch recorded in the ledger
//!   fmv validate <PLAN>    Check plan sequences against destinations on disk
//!   fmv --help             Show help

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail};
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use framemover_core::{
    BatchOperation, BatchOptions, BatchProgress, BatchStatus, EngineConfig, MappingItem,
    OperationStatus, SequenceValidation, UndoOutcome,
};
use framemover_ops::{TransferEngine, validate_plan};

/// Ledger file used when neither the config nor `--ledger` names one.
const DEFAULT_LEDGER: &str = ".framemover-ledger.json";

#[derive(Parser)]
#[command(
    name = "framemover",
    version,
    about = "Batch move/copy engine for files and image sequences",
    long_about = "framemover executes a precomputed mapping plan (a JSON list of \
                  source/destination pairs) as concurrent move and copy operations, \
                  validates image sequences afterwards and can undo the last batch."
)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Undo ledger file (overrides the config)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, default_value = "text")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a mapping plan
    Run {
        /// JSON file with the mapping items
        plan: PathBuf,

        /// Files processed at once
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Chunk streams per large file (1-64)
        #[arg(short, long)]
        streams: Option<usize>,

        /// Directory every destination must live under
        #[arg(short, long)]
        destination_root: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Undo the most recent batch
    Undo {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Check a plan's image sequences against the destinations on disk
    Validate {
        /// JSON file with the mapping items
        plan: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Machine-readable result of `run`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport<'a> {
    progress: &'a BatchProgress,
    failures: Vec<&'a BatchOperation>,
    sequences: &'a [SequenceValidation],
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.log_format)?;
    let config = load_config(cli.config.as_deref(), cli.ledger)?;

    match cli.command {
        Command::Run {
            plan,
            jobs,
            streams,
            destination_root,
            format,
        } => {
            let options = BatchOptions {
                file_concurrency: jobs,
                chunk_streams: streams,
                destination_root,
            };
            run_plan(config, &plan, options, format).await?;
        }
        Command::Undo { format } => {
            run_undo(config, format).await?;
        }
        Command::Validate { plan, format } => {
            run_validate(&plan, format)?;
        }
    }

    Ok(())
}

fn setup_logging(level: &str, format: OutputFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).context("Invalid log level")?,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => subscriber.json().init(),
        OutputFormat::Text => subscriber.init(),
    }

    Ok(())
}

/// Load the engine config, falling back to defaults.
fn load_config(path: Option<&Path>, ledger: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };

    if let Some(ledger) = ledger {
        config.ledger_path = Some(ledger);
    }
    if config.ledger_path.is_none() {
        config.ledger_path = Some(PathBuf::from(DEFAULT_LEDGER));
    }
    config.validate()?;

    debug!(?config, "configuration loaded");
    Ok(config)
}

fn load_plan(path: &Path) -> Result<Vec<MappingItem>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid plan {}", path.display()))
}

/// Execute a plan, showing progress until the batch finishes.
async fn run_plan(
    config: EngineConfig,
    plan: &Path,
    options: BatchOptions,
    format: OutputFormat,
) -> Result<()> {
    let items = load_plan(plan)?;
    eprintln!("Submitting {} items from {}...", items.len(), plan.display());

    let engine = TransferEngine::with_config(config).context("Failed to start engine")?;
    let batch = engine
        .submit(items, options)
        .await
        .context("Batch submission failed")?;

    let mut updates = engine.subscribe(batch)?.into_stream();
    let mut interrupted = false;
    loop {
        tokio::select! {
            frame = updates.next() => {
                let Some(frame) = frame else { break };
                if let (Some(progress), OutputFormat::Text) = (frame.snapshot(), format) {
                    render_progress(progress);
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl-C")?;
                interrupted = true;
                eprintln!("\nCancelling, waiting for in-flight transfers...");
                if let Err(e) = engine.cancel(batch) {
                    warn!(error = %e, "cancel request rejected");
                }
            }
        }
    }

    let progress = engine.wait(batch).await?;
    let operations = engine.list_operations(batch)?;
    let sequences = engine.validate_sequences(batch).await?;
    let failures: Vec<&BatchOperation> = operations
        .iter()
        .filter(|op| op.status == OperationStatus::Failed)
        .collect();

    match format {
        OutputFormat::Text => {
            eprintln!();
            println!();
            println!("{}", "─".repeat(60));
            println!(" {}", progress.summary());
            println!(
                " {} in {:.2}s ({}/s)",
                format_size(progress.processed_bytes),
                progress.elapsed_ms as f64 / 1000.0,
                format_size(progress.bytes_per_second as u64)
            );
            println!("{}", "─".repeat(60));

            if !failures.is_empty() {
                println!();
                println!(" Failed items:");
                for op in &failures {
                    println!(
                        "   {} -> {}: {}",
                        op.source.display(),
                        op.destination.display(),
                        op.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            print_validations(&sequences);
        }
        OutputFormat::Json => {
            let report = RunReport {
                progress: &progress,
                failures,
                sequences: &sequences,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    if progress.status != BatchStatus::Completed {
        bail!("{}", progress.summary());
    }
    Ok(())
}

/// Undo the last batch recorded in the ledger.
async fn run_undo(config: EngineConfig, format: OutputFormat) -> Result<()> {
    let engine = TransferEngine::with_config(config).context("Failed to start engine")?;
    let outcomes = engine.undo_last_batch().await.context("Nothing to undo")?;
    let failed = outcomes.iter().filter(|o| !o.is_success()).count();

    match format {
        OutputFormat::Text => {
            for outcome in &outcomes {
                print_outcome(outcome);
            }
            println!();
            println!(
                " Reverted {} of {} operations",
                outcomes.len() - failed,
                outcomes.len()
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }
    }

    if failed > 0 {
        bail!("{failed} operation(s) could not be reverted");
    }
    Ok(())
}

/// Validate plan sequences against what is already on disk.
fn run_validate(plan: &Path, format: OutputFormat) -> Result<()> {
    let items = load_plan(plan)?;
    let results = validate_plan(&items);

    match format {
        OutputFormat::Text => {
            if results.is_empty() {
                println!(" No image sequences in {}.", plan.display());
            }
            print_validations(&results);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    if results.iter().any(|result| !result.is_complete()) {
        bail!("Incomplete sequences found");
    }
    Ok(())
}

fn render_progress(progress: &BatchProgress) {
    let eta = progress
        .eta_seconds
        .map(format_eta)
        .unwrap_or_else(|| "--:--".to_string());
    let state = if progress.paused { " (paused)" } else { "" };

    eprint!(
        "\r {:>5.1}%  {}/{} items  {} / {}  {}/s  eta {}{}   ",
        progress.percentage,
        progress.finished_operations(),
        progress.total_operations,
        format_size(progress.processed_bytes),
        format_size(progress.total_bytes),
        format_size(progress.bytes_per_second as u64),
        eta,
        state
    );
    let _ = std::io::stderr().flush();
}

fn print_validations(results: &[SequenceValidation]) {
    if results.is_empty() {
        return;
    }
    println!();
    println!(" Sequences:");
    for result in results {
        println!(
            "   {:<30} {:>4}/{:<4} frames  {:>6.1}%  {}",
            truncate(&result.sequence, 30),
            result.actual_frames,
            result.expected_frames,
            result.integrity,
            result.status
        );
        if !result.missing_frames.is_empty() {
            println!("     missing: {}", format_frames(&result.missing_frames));
        }
    }
}

fn print_outcome(outcome: &UndoOutcome) {
    match &outcome.error {
        None => println!(" ✓ {}", outcome.record.undo_description()),
        Some(error) => println!(" ✗ {}: {}", outcome.record.undo_description(), error),
    }
}

/// Collapse sorted frame numbers into ranges, e.g. `4, 6-7, 9-10`.
fn format_frames(frames: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = frames.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(", ")
}

fn format_eta(seconds: u64) -> String {
    if seconds >= 3600 {
        format!("{}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
    } else {
        format!("{:02}:{:02}", seconds / 60, seconds % 60)
    }
}

/// Format bytes as human-readable size.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_frames() {
        assert_eq!(format_frames(&[4, 6, 7, 9, 10]), "4, 6-7, 9-10");
        assert_eq!(format_frames(&[]), "");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(75), "01:15");
        assert_eq!(format_eta(3725), "1:02:05");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a_very_long_sequence_name", 10), "a_very_...");
    }

    #[test]
    fn test_load_config_defaults_ledger() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.ledger_path, Some(PathBuf::from(DEFAULT_LEDGER)));

        let config = load_config(None, Some(PathBuf::from("/tmp/l.json"))).unwrap();
        assert_eq!(config.ledger_path, Some(PathBuf::from("/tmp/l.json")));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from(["fmv", "run", "plan.json", "-j", "8", "--format", "json"]);
        match cli.command {
            Command::Run { jobs, format, .. } => {
                assert_eq!(jobs, Some(8));
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected run"),
        }
    }
}
