//! Run controller: registration, execution, resume, finalization.
//!
//! # Lifecycle
//!
//! ```text
//! start_run ──▶ create_run ──▶ execute ──▶ finalize_run ──▶ completed
//!                                 │
//! resume_run ─▶ lock ─▶ integrity ┘   any error ──▶ mark_failed ──▶ failed
//! ```
//!
//! Items are processed strictly one at a time, and each result row is
//! written before the next classifier call. Interrupting the process at any
//! point leaves a valid partial result log: resuming recomputes the work set
//! from the store and carries on.
//!
//! Only `resume_run` takes the per-run lock. A run created by `start_run`
//! cannot collide with anything until its id has been printed.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::classifier::{self, Classifier};
use crate::config::Config;
use crate::corpus;
use crate::db;
use crate::error::EngineError;
use crate::export;
use crate::lock::RunLock;
use crate::metrics::{self, MetricsBlock};
use crate::models::{Run, RunSnapshot, RunStatus};
use crate::parser::{JsonVerdictParser, ResponseParser};
use crate::processor;
use crate::progress::{NoProgress, RunProgressEvent, RunProgressReporter};
use crate::registry;
use crate::worklist::{self, WorkMode};

/// What one `start` or `resume` invocation did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: WorkMode,
    /// Items classified by this invocation.
    pub attempted: u64,
    /// Of those, how many ended up as errored rows.
    pub errors: u64,
    /// Slice items still without a result row.
    pub remaining: u64,
    /// Set when the run was finalized by this invocation.
    pub metrics: Option<MetricsBlock>,
    pub artifacts: Vec<String>,
}

impl RunSummary {
    pub fn finalized(&self) -> bool {
        self.metrics.is_some()
    }
}

/// The run controller. Holds the configuration and collaborators for the
/// lifetime of one command.
pub struct Engine {
    pool: SqlitePool,
    config: Config,
    classifier: Box<dyn Classifier>,
    parser: Box<dyn ResponseParser>,
    progress: Box<dyn RunProgressReporter>,
}

impl Engine {
    /// Connect to the configured database and build the HTTP classifier.
    pub async fn new(config: Config) -> Result<Self> {
        let classifier = classifier::create_classifier(&config.classifier)?;
        let pool = db::connect(&config).await?;
        Ok(Self::with_components(
            pool,
            config,
            classifier,
            Box::new(JsonVerdictParser),
        ))
    }

    pub fn with_components(
        pool: SqlitePool,
        config: Config,
        classifier: Box<dyn Classifier>,
        parser: Box<dyn ResponseParser>,
    ) -> Self {
        Self {
            pool,
            config,
            classifier,
            parser,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn RunProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Validate the experiment configuration and register a new run.
    ///
    /// Configuration problems are reported before anything is written.
    pub async fn create_run(&self) -> Result<Run> {
        let experiment = self.config.experiment()?;
        let model = self.config.model()?;
        let prompt = experiment.resolve_prompt()?;

        if !corpus::is_loaded(&self.pool, &experiment.source).await? {
            return Err(EngineError::config(format!(
                "corpus source '{}' is not loaded (run `lh load` first)",
                experiment.source
            ))
            .into());
        }

        let total_items = corpus::count_slice(&self.pool, &experiment.source, experiment.limit)
            .await?;
        let checksum = corpus::checksum(&self.pool, &experiment.source, experiment.limit).await?;

        let snapshot = RunSnapshot {
            name: experiment.name.clone(),
            provider: self.config.classifier.provider.clone(),
            endpoint: self.config.classifier.endpoint.clone(),
            model: model.to_string(),
            temperature: self.config.classifier.temperature,
            prompt,
            seed: self.config.classifier.seed,
            source: experiment.source.clone(),
            limit: experiment.limit,
            max_retries: self.config.classifier.max_retries,
        };

        let run = registry::create_run(&self.pool, &snapshot, Some(&checksum), total_items).await?;
        tracing::info!(
            run_id = %run.run_id,
            source = %snapshot.source,
            model = %snapshot.model,
            classifier = self.classifier.name(),
            total_items,
            "run created"
        );
        Ok(run)
    }

    /// Register a new run and process its whole slice.
    pub async fn start_run(&self) -> Result<RunSummary> {
        let run = self.create_run().await?;
        self.process_new_run(run).await
    }

    /// Process a run just returned by [`Self::create_run`]. No lock is taken.
    pub async fn process_new_run(&self, run: Run) -> Result<RunSummary> {
        self.execute_guarded(run, WorkMode::Normal).await
    }

    /// Continue a running or failed run under its lock.
    pub async fn resume_run(&self, run_id: &str, mode: WorkMode) -> Result<RunSummary> {
        let run = registry::require_run(&self.pool, run_id).await?;
        if run.status == RunStatus::Completed {
            return Err(EngineError::RunCompleted(run_id.to_string()).into());
        }

        let lock = RunLock::acquire(&self.config.lock_dir(), run_id)?;
        let result = self.resume_locked(run_id, mode).await;
        lock.release();
        result
    }

    async fn resume_locked(&self, run_id: &str, mode: WorkMode) -> Result<RunSummary> {
        // Re-read under the lock; a previous holder may have finished it.
        let run = registry::require_run(&self.pool, run_id).await?;
        if run.status == RunStatus::Completed {
            return Err(EngineError::RunCompleted(run_id.to_string()).into());
        }

        self.verify_integrity(&run).await?;

        let run = if run.status == RunStatus::Failed {
            registry::reopen_run(&self.pool, run_id).await?;
            tracing::info!(run_id, previous_error = ?run.notes, "reopening failed run");
            registry::require_run(&self.pool, run_id).await?
        } else {
            run
        };

        tracing::info!(
            run_id,
            mode = mode.as_str(),
            classifier = self.classifier.name(),
            "resuming run"
        );
        self.execute_guarded(run, mode).await
    }

    /// Compare the slice checksum with the one recorded at creation.
    async fn verify_integrity(&self, run: &Run) -> Result<()> {
        let Some(expected) = run.corpus_checksum.as_deref() else {
            tracing::warn!(
                run_id = %run.run_id,
                "run has no recorded corpus checksum; skipping integrity check"
            );
            return Ok(());
        };

        let actual = corpus::checksum(&self.pool, &run.snapshot.source, run.snapshot.limit).await?;
        if actual != expected {
            return Err(EngineError::Integrity {
                run_id: run.run_id.clone(),
                expected: expected.to_string(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    /// Run [`Self::execute`], marking the run failed if anything escapes.
    async fn execute_guarded(&self, run: Run, mode: WorkMode) -> Result<RunSummary> {
        let run_id = run.run_id.clone();
        match self.execute(run, mode).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.mark_failed(&run_id, &format!("{:#}", e)).await;
                Err(e)
            }
        }
    }

    async fn execute(&self, run: Run, mode: WorkMode) -> Result<RunSummary> {
        let work = worklist::resolve(&self.pool, &run, mode).await?;
        let total = run.total_items.max(0) as u64;

        self.progress.report(RunProgressEvent::Resolved {
            run_id: run.run_id.clone(),
            remaining: work.len() as u64,
            total,
        });
        if work.is_empty() {
            tracing::info!(run_id = %run.run_id, mode = mode.as_str(), "work set empty");
        }

        let write_mode = mode.write_mode();
        let mut attempted = 0u64;
        let mut errors = 0u64;

        for record in &work {
            let result = processor::process_item(
                &self.pool,
                self.classifier.as_ref(),
                self.parser.as_ref(),
                &run,
                record,
                write_mode,
            )
            .await?;

            attempted += 1;
            if result.error_occurred {
                errors += 1;
            }

            let done = registry::record_progress(&self.pool, &run.run_id).await?;
            self.progress.report(RunProgressEvent::Processing {
                run_id: run.run_id.clone(),
                done: done.max(0) as u64,
                total,
                errors,
            });
        }

        // A retry pass on an interrupted run may leave never-attempted items
        // behind; such a run stays open for a normal resume.
        let remaining = worklist::resolve(&self.pool, &run, WorkMode::Normal)
            .await?
            .len() as u64;
        if remaining > 0 {
            tracing::warn!(
                run_id = %run.run_id,
                remaining,
                "items without results remain; run left running"
            );
            return Ok(RunSummary {
                run_id: run.run_id,
                mode,
                attempted,
                errors,
                remaining,
                metrics: None,
                artifacts: Vec::new(),
            });
        }

        let (metrics, artifacts) = self.finalize_run(&run.run_id).await?;
        Ok(RunSummary {
            run_id: run.run_id,
            mode,
            attempted,
            errors,
            remaining: 0,
            metrics: Some(metrics),
            artifacts,
        })
    }

    /// Compute metrics from the result log, write artifacts, and move the
    /// run to `completed`. The only path that completes a run.
    pub async fn finalize_run(&self, run_id: &str) -> Result<(MetricsBlock, Vec<String>)> {
        let run = registry::require_run(&self.pool, run_id).await?;
        match run.status {
            RunStatus::Running => {}
            RunStatus::Completed => return Err(EngineError::RunCompleted(run_id.to_string()).into()),
            RunStatus::Failed => {
                return Err(EngineError::InvalidTransition {
                    run_id: run_id.to_string(),
                    status: run.status.to_string(),
                }
                .into())
            }
        }

        let metrics = metrics::compute(&self.pool, run_id).await?;
        let paths = export::write_artifacts(&self.pool, &run, &metrics, &self.config.output.dir)
            .await?;
        let artifacts: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();

        registry::complete_run(&self.pool, run_id, &metrics, &artifacts).await?;
        tracing::info!(
            run_id,
            rows = metrics.n_total,
            errors = metrics.n_errors,
            accuracy = ?metrics.accuracy,
            f1 = ?metrics.f1,
            "run completed"
        );
        Ok((metrics, artifacts))
    }

    /// Move the run to `failed` with `error_message` in its notes.
    ///
    /// Never fails: problems recording the failure are logged, since the
    /// caller is already on its way out with the original error.
    pub async fn mark_failed(&self, run_id: &str, error_message: &str) {
        match registry::fail_run(&self.pool, run_id, error_message).await {
            Ok(()) => tracing::error!(run_id, error = error_message, "run marked failed"),
            Err(e) => tracing::error!(
                run_id,
                error = %e,
                original_error = error_message,
                "could not mark run failed"
            ),
        }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
