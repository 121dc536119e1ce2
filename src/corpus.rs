//! Corpus store access.
//!
//! The corpus is populated once per `source_tag` by a [`CorpusLoader`] and is
//! read-only to the engine afterwards. Runs select a *slice* of it: all
//! records for one source, in load order, optionally capped by a row limit.
//! The slice checksum recorded at run creation guards resumes against the
//! slice changing underneath a run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::models::CorpusRecord;

/// One-shot bulk import of source text into the corpus store.
#[async_trait]
pub trait CorpusLoader: Send + Sync {
    /// Load every record of `source` and return how many were inserted.
    async fn load(&self, pool: &SqlitePool, source: &str) -> Result<u64>;
}

/// Loads newline-delimited JSON, one record per line:
///
/// ```json
/// {"entity_id": "A", "subtype": "cme", "text": "...", "label": true, "entity_label": true}
/// ```
///
/// `label` and `entity_label` are optional. Blank lines are skipped.
pub struct JsonlLoader {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CorpusLine {
    entity_id: String,
    subtype: String,
    text: String,
    #[serde(default)]
    label: Option<bool>,
    #[serde(default)]
    entity_label: Option<bool>,
}

impl JsonlLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_lines(&self) -> Result<Vec<CorpusLine>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read corpus file: {}", self.path.display()))?;

        let mut lines = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: CorpusLine = serde_json::from_str(line).with_context(|| {
                format!("{}:{}: invalid corpus record", self.path.display(), idx + 1)
            })?;
            lines.push(parsed);
        }
        Ok(lines)
    }
}

#[async_trait]
impl CorpusLoader for JsonlLoader {
    async fn load(&self, pool: &SqlitePool, source: &str) -> Result<u64> {
        let lines = self.read_lines()?;
        let now = chrono::Utc::now().timestamp();

        // All-or-nothing: a duplicate key anywhere aborts the whole import.
        let mut tx = pool.begin().await?;
        for line in &lines {
            sqlx::query(
                r#"
                INSERT INTO corpus (entity_id, subtype, text, ground_truth, entity_ground_truth, source_tag, loaded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&line.entity_id)
            .bind(&line.subtype)
            .bind(&line.text)
            .bind(line.label)
            .bind(line.entity_label)
            .bind(source)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "Failed to insert corpus record {}/{}",
                    line.entity_id, line.subtype
                )
            })?;
        }
        tx.commit().await?;

        Ok(lines.len() as u64)
    }
}

/// CLI entry point for `lh load`.
pub async fn run_load(pool: &SqlitePool, path: &Path, source: &str) -> Result<u64> {
    if is_loaded(pool, source).await? {
        anyhow::bail!(
            "source '{}' is already loaded; the corpus is immutable after load",
            source
        );
    }
    let count = JsonlLoader::new(path).load(pool, source).await?;
    tracing::info!(source, count, "corpus loaded");
    Ok(count)
}

/// True when at least one record exists for `source`.
pub async fn is_loaded(pool: &SqlitePool, source: &str) -> Result<bool> {
    let loaded: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM corpus WHERE source_tag = ?)")
            .bind(source)
            .fetch_one(pool)
            .await?;
    Ok(loaded)
}

/// SQLite treats a negative LIMIT as "no limit".
pub(crate) fn sql_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(-1)
}

/// Number of records in a run's slice.
pub async fn count_slice(pool: &SqlitePool, source: &str, limit: Option<i64>) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM (SELECT id FROM corpus WHERE source_tag = ? ORDER BY id LIMIT ?)",
    )
    .bind(source)
    .bind(sql_limit(limit))
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// SHA-256 over the slice content in load order.
///
/// Covers keys, text, and both labels, so any edit that would change what a
/// run classifies or how it is scored changes the checksum.
pub async fn checksum(pool: &SqlitePool, source: &str, limit: Option<i64>) -> Result<String> {
    let rows = sqlx::query(
        r#"
        SELECT entity_id, subtype, text, ground_truth, entity_ground_truth
        FROM corpus WHERE source_tag = ? ORDER BY id LIMIT ?
        "#,
    )
    .bind(source)
    .bind(sql_limit(limit))
    .fetch_all(pool)
    .await?;

    let mut hasher = Sha256::new();
    for row in &rows {
        let entity_id: String = row.get("entity_id");
        let subtype: String = row.get("subtype");
        let text: String = row.get("text");
        let truth: Option<bool> = row.get("ground_truth");
        let entity_truth: Option<bool> = row.get("entity_ground_truth");

        hasher.update(entity_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(subtype.as_bytes());
        hasher.update([0x1f]);
        hasher.update((text.len() as u64).to_le_bytes());
        hasher.update(text.as_bytes());
        hasher.update([label_byte(truth), label_byte(entity_truth)]);
        hasher.update([0x1e]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn label_byte(label: Option<bool>) -> u8 {
    match label {
        None => 0,
        Some(false) => 1,
        Some(true) => 2,
    }
}

pub async fn get_record(
    pool: &SqlitePool,
    entity_id: &str,
    subtype: &str,
) -> Result<Option<CorpusRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, entity_id, subtype, text, ground_truth, entity_ground_truth, source_tag, loaded_at
        FROM corpus WHERE entity_id = ? AND subtype = ?
        "#,
    )
    .bind(entity_id)
    .bind(subtype)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(record_from_row))
}

pub(crate) fn record_from_row(row: &SqliteRow) -> CorpusRecord {
    CorpusRecord {
        id: row.get("id"),
        entity_id: row.get("entity_id"),
        subtype: row.get("subtype"),
        text: row.get("text"),
        ground_truth: row.get("ground_truth"),
        entity_ground_truth: row.get("entity_ground_truth"),
        source_tag: row.get("source_tag"),
        loaded_at: row.get("loaded_at"),
    }
}
