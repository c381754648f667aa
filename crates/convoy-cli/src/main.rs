//! Convoy - multi-call agent coordination CLI
//!
//! ## Commands
//!
//! - `policy`: Print the execution policy for a complexity label
//! - `plan`: Normalize a batch and print its waves without running it
//! - `run`: Execute a batch against fixture agents and print the report
//! - `merge`: Merge partial result files into one result

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use convoy_cli::{merge_files, plan_json, policy_json, run_batch};
use convoy_core::METRICS;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Coordinate batches of agent calls and merge their results", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the policy selected for a complexity label
    Policy {
        /// simple, medium, complex or crisis
        complexity: String,
    },

    /// Show the waves a batch would run in
    Plan {
        /// Registry manifest (JSON)
        #[arg(short, long)]
        registry: PathBuf,

        /// Batch request (JSON)
        #[arg(short, long)]
        batch: PathBuf,

        /// Complexity label (defaults to CONVOY_* environment overrides)
        #[arg(short, long)]
        complexity: Option<String>,
    },

    /// Execute a batch and print the merged report
    Run {
        /// Registry manifest (JSON)
        #[arg(short, long)]
        registry: PathBuf,

        /// Batch request (JSON)
        #[arg(short, long)]
        batch: PathBuf,

        /// Complexity label (defaults to CONVOY_* environment overrides)
        #[arg(short, long)]
        complexity: Option<String>,
    },

    /// Merge partial result files
    Merge {
        /// Files holding one partial result or an array of them
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    convoy_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Policy { complexity } => print_json(&policy_json(&complexity)?),
        Commands::Plan {
            registry,
            batch,
            complexity,
        } => print_json(&plan_json(&registry, &batch, complexity.as_deref())?),
        Commands::Run {
            registry,
            batch,
            complexity,
        } => cmd_run(&registry, &batch, complexity.as_deref(), cli.verbose).await,
        Commands::Merge { files } => print_json(&merge_files(&files)?),
    }
}

async fn cmd_run(
    registry: &Path,
    batch: &Path,
    complexity: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let report = run_batch(registry, batch, complexity, verbose).await?;
    METRICS.flush();
    info!(
        batch_id = %report.batch_id,
        ok = report.merged.ok,
        deadline_breached = report.deadline_breached,
        "Batch complete"
    );
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
