//! Output artifacts written when a run is finalized.
//!
//! For each run, `<output dir>/<run_id>/` receives:
//! - `results.jsonl`: one JSON object per result row, ordered by key, with
//!   the confusion-matrix cell as four nullable `is_*` flags
//! - `metrics.json`: the run's snapshot and final metrics block

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::metrics::MetricsBlock;
use crate::models::{ResultRecord, Run, RunSnapshot};
use crate::results;

/// A `results.jsonl` line. The flags are all null when the row is unscored.
#[derive(Serialize)]
struct ResultLine<'a> {
    #[serde(flatten)]
    record: &'a ResultRecord,
    is_true_positive: Option<bool>,
    is_true_negative: Option<bool>,
    is_false_positive: Option<bool>,
    is_false_negative: Option<bool>,
}

impl<'a> From<&'a ResultRecord> for ResultLine<'a> {
    fn from(record: &'a ResultRecord) -> Self {
        Self {
            record,
            is_true_positive: record.is_true_positive(),
            is_true_negative: record.is_true_negative(),
            is_false_positive: record.is_false_positive(),
            is_false_negative: record.is_false_negative(),
        }
    }
}

#[derive(Serialize)]
struct MetricsArtifact<'a> {
    run_id: &'a str,
    snapshot: &'a RunSnapshot,
    corpus_checksum: Option<&'a str>,
    started_at: i64,
    metrics: &'a MetricsBlock,
}

/// Write the artifacts for `run` and return their paths.
pub async fn write_artifacts(
    pool: &SqlitePool,
    run: &Run,
    metrics: &MetricsBlock,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let run_dir = output_dir.join(&run.run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create output directory: {}", run_dir.display()))?;

    let rows = results::list_results(pool, &run.run_id).await?;
    let results_path = run_dir.join("results.jsonl");
    let mut file = std::io::BufWriter::new(
        std::fs::File::create(&results_path)
            .with_context(|| format!("Failed to create {}", results_path.display()))?,
    );
    for row in &rows {
        serde_json::to_writer(&mut file, &ResultLine::from(row))?;
        file.write_all(b"\n")?;
    }
    file.flush()?;

    let metrics_path = run_dir.join("metrics.json");
    let artifact = MetricsArtifact {
        run_id: &run.run_id,
        snapshot: &run.snapshot,
        corpus_checksum: run.corpus_checksum.as_deref(),
        started_at: run.started_at,
        metrics,
    };
    std::fs::write(&metrics_path, serde_json::to_string_pretty(&artifact)?)
        .with_context(|| format!("Failed to write {}", metrics_path.display()))?;

    tracing::info!(
        run_id = %run.run_id,
        rows = rows.len(),
        dir = %run_dir.display(),
        "artifacts written"
    );

    Ok(vec![results_path, metrics_path])
}
