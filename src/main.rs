//! # Label Harness CLI (`lh`)
//!
//! The `lh` binary drives classification runs: loading a corpus, starting a
//! run, resuming it after an interruption, and inspecting its status.
//!
//! ## Usage
//!
//! ```bash
//! lh --config ./config/lh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lh init` | Create the SQLite database and run schema migrations |
//! | `lh load <file> --source <tag>` | Import a JSONL corpus under a source tag |
//! | `lh start` | Create a run from `[experiment]` and process it |
//! | `lh resume <run_id>` | Continue an interrupted or failed run |
//! | `lh status <run_id>` | Show a run's snapshot, progress, and metrics |
//! | `lh runs` | List recent runs |
//!
//! ## Exit status
//!
//! `0` on success, including a resume that finds nothing left to do and a
//! resume of an already completed run (which is left untouched).
//! `1` on configuration errors, integrity-check failures, lock conflicts,
//! and unrecoverable processing errors (the run is marked failed first).

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use label_harness::config;
use label_harness::corpus;
use label_harness::db;
use label_harness::error::EngineError;
use label_harness::migrate;
use label_harness::progress::ProgressMode;
use label_harness::runner::{Engine, RunSummary};
use label_harness::status;
use label_harness::worklist::WorkMode;

/// Label Harness CLI: resumable LLM classification runs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lh",
    about = "Label Harness: resumable LLM text classification runs",
    version,
    long_about = "Label Harness runs a loaded corpus through an LLM classifier, records one \
    result per record in SQLite, and computes accuracy, precision, recall and F1 from the \
    stored results. Interrupted runs can be resumed without reclassifying finished records."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the corpus, runs, and results
    /// tables. Idempotent.
    Init,

    /// Import a JSONL corpus file.
    ///
    /// Each line is an object with `entity_id`, `subtype`, `text`, and
    /// optional `label` / `entity_label` booleans. A source can be loaded
    /// only once.
    Load {
        /// Path to the JSONL file.
        file: PathBuf,

        /// Source tag the records are stored under.
        #[arg(long)]
        source: String,
    },

    /// Create a new run from the `[experiment]` config and process it.
    ///
    /// Prints the new run id before processing starts.
    Start {
        /// Progress output on stderr: `human`, `json`, or `off`.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Continue a run that was interrupted or failed.
    ///
    /// Only records without a result row are processed. The run is locked
    /// for the duration; a second concurrent resume fails immediately.
    Resume {
        /// Run id printed by `lh start`.
        run_id: String,

        /// Re-attempt only records whose result row is errored.
        #[arg(long)]
        retry_errors_only: bool,

        /// Progress output on stderr: `human`, `json`, or `off`.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Show a run's configuration, progress, errors, and metrics.
    Status {
        run_id: String,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List recent runs, newest first.
    Runs {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

fn progress_mode(arg: Option<&str>) -> anyhow::Result<ProgressMode> {
    match arg {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => ProgressMode::parse(s)
            .ok_or_else(|| anyhow::anyhow!("invalid --progress '{}': use human, json, or off", s)),
    }
}

fn print_summary(summary: &RunSummary) {
    println!("run {}", summary.run_id);
    println!("  mode: {}", summary.mode.as_str());
    println!("  attempted: {}", summary.attempted);
    println!("  errors: {}", summary.errors);
    match &summary.metrics {
        Some(m) => {
            println!("  status: completed");
            println!("  rows: {}", m.n_total);
            println!(
                "  confusion: TP {} TN {} FP {} FN {}",
                m.n_true_positive, m.n_true_negative, m.n_false_positive, m.n_false_negative
            );
            let fmt = |r: Option<f64>| r.map_or("n/a".to_string(), |v| format!("{:.4}", v));
            println!("  accuracy: {}", fmt(m.accuracy));
            println!("  precision: {}", fmt(m.precision));
            println!("  recall: {}", fmt(m.recall));
            println!("  f1: {}", fmt(m.f1));
            for path in &summary.artifacts {
                println!("  artifact: {}", path);
            }
        }
        None => {
            println!("  status: running");
            println!("  remaining: {}", summary.remaining);
        }
    }
    println!("ok");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Load { file, source } => {
            let pool = db::connect(&cfg).await?;
            let count = corpus::run_load(&pool, &file, &source).await?;
            println!("load {}", source);
            println!("  records: {}", count);
            println!("ok");
            pool.close().await;
        }
        Commands::Start { progress } => {
            let mode = progress_mode(progress.as_deref())?;
            let engine = Engine::new(cfg).await?.with_progress(mode.reporter());

            let run = engine.create_run().await?;
            let run_id = run.run_id.clone();
            println!("run_id: {}", run_id);

            let summary = tokio::select! {
                res = engine.process_new_run(run) => res?,
                _ = tokio::signal::ctrl_c() => {
                    bail!("interrupted; resume with `lh resume {}`", run_id)
                }
            };
            print_summary(&summary);
            engine.close().await;
        }
        Commands::Resume {
            run_id,
            retry_errors_only,
            progress,
        } => {
            let mode = progress_mode(progress.as_deref())?;
            let engine = Engine::new(cfg).await?.with_progress(mode.reporter());
            let work_mode = if retry_errors_only {
                WorkMode::RetryErrorsOnly
            } else {
                WorkMode::Normal
            };

            let result = tokio::select! {
                res = engine.resume_run(&run_id, work_mode) => res,
                _ = tokio::signal::ctrl_c() => {
                    bail!("interrupted; resume with `lh resume {}`", run_id)
                }
            };
            match result {
                Ok(summary) => print_summary(&summary),
                // Completed runs are never touched again; resuming one is a no-op.
                Err(e)
                    if matches!(
                        e.downcast_ref::<EngineError>(),
                        Some(EngineError::RunCompleted(_))
                    ) =>
                {
                    println!("run {} is already completed; nothing to do", run_id);
                    println!("ok");
                }
                Err(e) => return Err(e),
            }
            engine.close().await;
        }
        Commands::Status { run_id, json } => {
            let pool = db::connect(&cfg).await?;
            status::run_status(&pool, &run_id, json).await?;
            pool.close().await;
        }
        Commands::Runs { limit } => {
            let pool = db::connect(&cfg).await?;
            status::run_list(&pool, limit).await?;
            pool.close().await;
        }
    }

    Ok(())
}
