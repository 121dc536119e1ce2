//! Run registry lifecycle operations.
//!
//! One row per experiment run: the resolved configuration snapshot, status,
//! progress counters and, once completed, the metrics block and artifact
//! paths.
//!
//! # Status transitions
//!
//! ```text
//!   create ──▶ running ──▶ completed   (complete_run only)
//!                 │
//!                 └──────▶ failed ──▶ running   (reopen_run, on resume)
//! ```
//!
//! Every transition is a single conditional `UPDATE ... WHERE status = ?`,
//! so a completed row can never be modified by this module.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::EngineError;
use crate::metrics::MetricsBlock;
use crate::models::{Run, RunSnapshot, RunStatus};

/// Register a new run in `running` state and return it.
pub async fn create_run(
    pool: &SqlitePool,
    snapshot: &RunSnapshot,
    corpus_checksum: Option<&str>,
    total_items: i64,
) -> Result<Run> {
    let run_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    let config_json = serde_json::to_string(snapshot)?;

    sqlx::query(
        r#"
        INSERT INTO runs (run_id, name, status, model, temperature, prompt_text, seed,
                          source_tag, row_limit, corpus_checksum, config_json,
                          total_items, items_processed, started_at)
        VALUES (?, ?, 'running', ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(&run_id)
    .bind(&snapshot.name)
    .bind(&snapshot.model)
    .bind(snapshot.temperature)
    .bind(&snapshot.prompt)
    .bind(snapshot.seed)
    .bind(&snapshot.source)
    .bind(snapshot.limit)
    .bind(corpus_checksum)
    .bind(&config_json)
    .bind(total_items)
    .bind(now)
    .execute(pool)
    .await?;

    require_run(pool, &run_id).await
}

pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<Run>> {
    let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(run_from_row).transpose()
}

/// Like [`get_run`], but a missing run is [`EngineError::RunNotFound`].
pub async fn require_run(pool: &SqlitePool, run_id: &str) -> Result<Run> {
    get_run(pool, run_id)
        .await?
        .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()).into())
}

/// Most recently started runs first.
pub async fn list_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<Run>> {
    let rows = sqlx::query("SELECT * FROM runs ORDER BY started_at DESC, run_id LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(run_from_row).collect()
}

/// Refresh `items_processed` from the result log and return it.
pub async fn record_progress(pool: &SqlitePool, run_id: &str) -> Result<i64> {
    sqlx::query(
        r#"
        UPDATE runs
        SET items_processed = (SELECT COUNT(*) FROM results WHERE results.run_id = runs.run_id)
        WHERE run_id = ? AND status = 'running'
        "#,
    )
    .bind(run_id)
    .execute(pool)
    .await?;

    let processed: i64 = sqlx::query_scalar("SELECT items_processed FROM runs WHERE run_id = ?")
        .bind(run_id)
        .fetch_one(pool)
        .await?;
    Ok(processed)
}

/// running → completed, writing metrics, artifacts, progress and `ended_at`
/// in one statement.
pub async fn complete_run(
    pool: &SqlitePool,
    run_id: &str,
    metrics: &MetricsBlock,
    artifacts: &[String],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let metrics_json = serde_json::to_string(metrics)?;
    let artifacts_json = serde_json::to_string(artifacts)?;

    let updated = sqlx::query(
        r#"
        UPDATE runs
        SET status = 'completed',
            ended_at = ?,
            metrics_json = ?,
            accuracy = ?,
            f1 = ?,
            artifacts_json = ?,
            items_processed = (SELECT COUNT(*) FROM results WHERE results.run_id = runs.run_id),
            notes = NULL
        WHERE run_id = ? AND status = 'running'
        "#,
    )
    .bind(now)
    .bind(&metrics_json)
    .bind(metrics.accuracy)
    .bind(metrics.f1)
    .bind(&artifacts_json)
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(transition_error(pool, run_id).await);
    }
    Ok(())
}

/// running → failed, recording the error in `notes`.
pub async fn fail_run(pool: &SqlitePool, run_id: &str, error_message: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let updated = sqlx::query(
        r#"
        UPDATE runs
        SET status = 'failed',
            ended_at = ?,
            notes = ?,
            items_processed = (SELECT COUNT(*) FROM results WHERE results.run_id = runs.run_id)
        WHERE run_id = ? AND status = 'running'
        "#,
    )
    .bind(now)
    .bind(error_message)
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(transition_error(pool, run_id).await);
    }
    Ok(())
}

/// failed → running, so a resumed run can be completed.
pub async fn reopen_run(pool: &SqlitePool, run_id: &str) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE runs SET status = 'running', ended_at = NULL, notes = NULL
        WHERE run_id = ? AND status = 'failed'
        "#,
    )
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(transition_error(pool, run_id).await);
    }
    Ok(())
}

async fn transition_error(pool: &SqlitePool, run_id: &str) -> anyhow::Error {
    match get_run(pool, run_id).await {
        Ok(None) => EngineError::RunNotFound(run_id.to_string()).into(),
        Ok(Some(run)) if run.status == RunStatus::Completed => {
            EngineError::RunCompleted(run_id.to_string()).into()
        }
        Ok(Some(run)) => EngineError::InvalidTransition {
            run_id: run_id.to_string(),
            status: run.status.to_string(),
        }
        .into(),
        Err(e) => e,
    }
}

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let run_id: String = row.get("run_id");
    let status: String = row.get("status");
    let status = RunStatus::parse(&status)
        .ok_or_else(|| anyhow::anyhow!("run {}: unknown status '{}'", run_id, status))?;

    let config_json: String = row.get("config_json");
    let snapshot: RunSnapshot = serde_json::from_str(&config_json)?;

    let metrics_json: Option<String> = row.get("metrics_json");
    let metrics = metrics_json
        .as_deref()
        .map(serde_json::from_str::<MetricsBlock>)
        .transpose()?;

    let artifacts_json: Option<String> = row.get("artifacts_json");
    let artifacts = match artifacts_json {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };

    Ok(Run {
        run_id,
        status,
        snapshot,
        corpus_checksum: row.get("corpus_checksum"),
        total_items: row.get("total_items"),
        items_processed: row.get("items_processed"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        metrics,
        artifacts,
        notes: row.get("notes"),
    })
}
