//! Work-set resolution: which corpus records a run still needs.
//!
//! Always computed fresh from the store; the result log is the only record
//! of what is done.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::corpus::{record_from_row, sql_limit};
use crate::models::{CorpusRecord, Run};
use crate::results::WriteMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkMode {
    /// Slice records that have no result row for the run.
    #[default]
    Normal,
    /// Slice records whose result row for the run is errored.
    RetryErrorsOnly,
}

impl WorkMode {
    pub fn write_mode(self) -> WriteMode {
        match self {
            WorkMode::Normal => WriteMode::Insert,
            WorkMode::RetryErrorsOnly => WriteMode::SupersedeErrored,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkMode::Normal => "normal",
            WorkMode::RetryErrorsOnly => "retry_errors_only",
        }
    }
}

/// Remaining records for `run` in load order.
pub async fn resolve(pool: &SqlitePool, run: &Run, mode: WorkMode) -> Result<Vec<CorpusRecord>> {
    let sql = match mode {
        WorkMode::Normal => {
            r#"
            SELECT c.* FROM (
                SELECT * FROM corpus WHERE source_tag = ? ORDER BY id LIMIT ?
            ) c
            WHERE NOT EXISTS (
                SELECT 1 FROM results r
                WHERE r.run_id = ? AND r.entity_id = c.entity_id AND r.subtype = c.subtype
            )
            ORDER BY c.id
            "#
        }
        WorkMode::RetryErrorsOnly => {
            r#"
            SELECT c.* FROM (
                SELECT * FROM corpus WHERE source_tag = ? ORDER BY id LIMIT ?
            ) c
            WHERE EXISTS (
                SELECT 1 FROM results r
                WHERE r.run_id = ? AND r.entity_id = c.entity_id AND r.subtype = c.subtype
                  AND r.error_occurred = 1
            )
            ORDER BY c.id
            "#
        }
    };

    let rows = sqlx::query(sql)
        .bind(&run.snapshot.source)
        .bind(sql_limit(run.snapshot.limit))
        .bind(&run.run_id)
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(record_from_row).collect())
}
