//! Binary entry point for the stream inspector.
#![forbid(unsafe_code)]

mod config;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use scmo::stream::{summarize, CounterMetrics, StreamSummary};
use scmo::{ScmoError, Streamer};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

use config::{ConfigError, InspectConfig};

#[derive(Parser, Debug)]
#[command(
    name = "scmo-inspect",
    version,
    about = "Inspect serialized single-chunk object streams",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "SCMO_INSPECT_CONFIG",
        help = "Path to the inspector TOML config"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print the class table, resolution tables and chunk sizes")]
    Summary {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(long, help = "Emit JSON instead of text")]
        json: bool,
    },
    #[command(about = "Rebuild every instance of a stream and report the result")]
    Verify {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stream(#[from] ScmoError),
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream rejected: {0}")]
    Rejected(ScmoError),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Rejected(_) => 2,
            _ => 1,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = InspectConfig::load(cli.config)?;
    install_tracing_subscriber(config.log_filter.as_deref());
    debug!(config = ?config.path, options = ?config.streamer, "inspect.config");

    match cli.command {
        Command::Summary { path, json } => {
            let bytes = read_stream(&path)?;
            let summary = summarize(&bytes, &config.streamer)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&path, &summary);
            }
        }
        Command::Verify { path } => {
            let bytes = read_stream(&path)?;
            let metrics = Arc::new(CounterMetrics::default());
            let streamer = Streamer::new(config.streamer.clone().metrics(metrics.clone()));
            match streamer.deserialize(&bytes) {
                Ok(instances) => {
                    let snap = metrics.snapshot();
                    print_section("Verify");
                    print_field("Stream", path.display());
                    print_field("Bytes", snap.bytes_read);
                    print_field("Classes", snap.classes_read);
                    print_field("Top-level Instances", instances.len());
                    println!();
                    println!("✓ stream is well formed");
                }
                Err(err) => return Err(CliError::Rejected(err)),
            }
        }
    }
    Ok(())
}

fn install_tracing_subscriber(configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured.unwrap_or("warn")))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_stream(path: &Path) -> Result<Vec<u8>, CliError> {
    fs::read(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(55usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn print_summary(path: &Path, summary: &StreamSummary) {
    print_section("Stream");
    print_field("Path", path.display());
    print_field("Bytes", summary.total_bytes);
    print_field("Classes", summary.classes.len());
    print_field("Instances", summary.instances.len());
    print_field("References", summary.instance_references.len());

    print_section("Classes");
    for (i, class) in summary.classes.iter().enumerate() {
        print_field(
            &format!("[{i}] {}", class.name),
            format!(
                "{} properties, {} bytes, {}",
                class.properties, class.packed_len, class.preview
            ),
        );
    }

    print_section("Instances");
    for (i, inst) in summary.instances.iter().enumerate() {
        let root = inst
            .root_ordinal
            .map(|ordinal| format!("root #{ordinal}"))
            .unwrap_or_else(|| "referenced".to_string());
        print_field(
            &format!("[{i}] class {}", inst.class_index),
            format!(
                "{root}, {} bytes, {} refs",
                inst.packed_len, inst.external_references
            ),
        );
    }

    if !summary.instance_references.is_empty() {
        print_section("References");
        for entry in &summary.instance_references {
            print_field(&format!("tag {}", entry.source_slot), format!("-> instance {}", entry.index));
        }
    }
    println!();
}
