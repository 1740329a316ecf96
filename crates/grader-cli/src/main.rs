//! Grader CLI
//!
//! The `grader` command runs a manifest-described grader against a
//! submission and writes the results file.
//!
//! ## Commands
//!
//! - `run`: Grade a submission and write results
//! - `validate`: Check a manifest and print its checks and digest
//! - `notice`: Write a zero-score results file carrying only a message

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grader_core::env::{is_local, Environment};
use grader_core::score::format_score;
use grader_core::telemetry::init_tracing;
use grader_core::{
    Autograder, FileReportSink, GraderManifest, RunOutcome, SubmissionMetadata, TestRecord,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "grader")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run guarded checks against a submission", long_about = None)]
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

#[derive(Subcommand, Debug)]
enum Commands {
    /// Grade a submission and write the results file
    Run {
        /// Path to the grader manifest (TOML)
        manifest: PathBuf,

        /// Use local paths and skip platform-only steps (also set by IS_LOCAL=true)
        #[arg(long)]
        local: bool,

        /// Results file to write
        #[arg(long)]
        results: Option<PathBuf>,

        /// Submission metadata file
        #[arg(long)]
        metadata: Option<PathBuf>,

        /// Directory holding the submission
        #[arg(long)]
        submission: Option<PathBuf>,
    },

    /// Parse a manifest and print its checks and digest
    Validate {
        /// Path to the grader manifest (TOML)
        manifest: PathBuf,
    },

    /// Write a results file that only shows a message
    Notice {
        /// Message shown to the student
        message: String,

        /// Use local paths (also set by IS_LOCAL=true)
        #[arg(long)]
        local: bool,

        /// Results file to write
        #[arg(long)]
        results: Option<PathBuf>,
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
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            manifest,
            local,
            results,
            metadata,
            submission,
        } => {
            let env = environment(local, results, metadata, submission);
            cmd_run(&manifest, env).await
        }
        Commands::Validate { manifest } => cmd_validate(&manifest).await,
        Commands::Notice {
            message,
            local,
            results,
        } => {
            let env = environment(local, results, None, None);
            cmd_notice(&message, &env).await
        }
    }
}

fn environment(
    local: bool,
    results: Option<PathBuf>,
    metadata: Option<PathBuf>,
    submission: Option<PathBuf>,
) -> Environment {
    let mut env = Environment::for_mode(local || is_local());
    if let Some(path) = results {
        env = env.with_results_path(path);
    }
    if let Some(path) = metadata {
        env = env.with_metadata_path(path);
    }
    if let Some(path) = submission {
        env = env.with_submission_dir(path);
    }
    env
}

/// Grade a submission
async fn cmd_run(manifest_path: &Path, env: Environment) -> Result<()> {
    let manifest = GraderManifest::load(manifest_path)
        .await
        .with_context(|| format!("Failed to load manifest {:?}", manifest_path))?;
    let metadata = SubmissionMetadata::load_for(&env.metadata_path, env.is_local)
        .await
        .context("Failed to load submission metadata")?;

    info!(
        manifest = %manifest_path.display(),
        results = %env.results_path.display(),
        is_local = env.is_local,
        "starting grader"
    );

    let sink = Arc::new(FileReportSink::new(&env.results_path));
    let mut grader = Autograder::new(manifest.registry(), sink)
        .with_options(manifest.grader.clone())
        .with_rate_limit(manifest.rate_limit.clone())
        .with_metadata(metadata)
        .local(env.is_local)
        .with_submission_dir(&env.submission_dir);

    let outcome = grader
        .run()
        .await
        .with_context(|| format!("Failed to write results to {:?}", env.results_path))?;

    print_summary(&outcome);
    println!("Results: {}", env.results_path.display());
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    let report = outcome.report();
    println!("Outcome: {}", outcome.label());
    for test in &report.tests {
        println!("{}", summary_line(test));
    }
    match report.score {
        Some(score) => println!("Score: {}", format_score(score)),
        None => println!("Score: -"),
    }
    println!("Execution time: {:.2}s", report.execution_time);
}

fn summary_line(test: &TestRecord) -> String {
    let name = test.name.as_deref().unwrap_or("-");
    let score = test.score.map(format_score).unwrap_or_else(|| "-".to_string());
    let max = test
        .max_score
        .map(format_score)
        .unwrap_or_else(|| "-".to_string());
    format!("  {:<40} {:>6} / {}", name, score, max)
}

/// Validate a manifest
async fn cmd_validate(manifest_path: &Path) -> Result<()> {
    let manifest = GraderManifest::load(manifest_path)
        .await
        .with_context(|| format!("Invalid manifest {:?}", manifest_path))?;
    let registry = manifest.registry();
    registry.validate().context("Invalid check registry")?;

    println!("Setup steps:    {}", registry.setups().len());
    println!("Teardown steps: {}", registry.teardowns().len());
    println!("Checks:");
    for name in registry.check_names() {
        println!("  {}", name);
    }
    println!("Digest: {}", registry.digest());
    Ok(())
}

/// Write a notice-only results file
async fn cmd_notice(message: &str, env: &Environment) -> Result<()> {
    let sink = FileReportSink::new(&env.results_path);
    Autograder::notice(&sink, message)
        .await
        .with_context(|| format!("Failed to write results to {:?}", env.results_path))?;
    println!("Notice written to {}", env.results_path.display());
    Ok(())
}
