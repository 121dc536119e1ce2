use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Corpus store: immutable after load
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpus (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            subtype TEXT NOT NULL,
            text TEXT NOT NULL,
            ground_truth INTEGER,
            entity_ground_truth INTEGER,
            source_tag TEXT NOT NULL,
            loaded_at INTEGER NOT NULL,
            UNIQUE(entity_id, subtype)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
            model TEXT NOT NULL,
            temperature REAL NOT NULL,
            prompt_text TEXT NOT NULL,
            seed INTEGER,
            source_tag TEXT NOT NULL,
            row_limit INTEGER,
            corpus_checksum TEXT,
            config_json TEXT NOT NULL,
            total_items INTEGER NOT NULL DEFAULT 0,
            items_processed INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            metrics_json TEXT,
            accuracy REAL,
            f1 REAL,
            artifacts_json TEXT,
            notes TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Result log: one row per (run, entity, subtype)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            run_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            subtype TEXT NOT NULL,
            detected INTEGER,
            confidence REAL,
            indicators_json TEXT NOT NULL DEFAULT '[]',
            rationale TEXT,
            raw_response TEXT,
            ground_truth INTEGER,
            error_occurred INTEGER NOT NULL DEFAULT 0,
            error_kind TEXT,
            error_message TEXT,
            is_true_positive INTEGER,
            is_true_negative INTEGER,
            is_false_positive INTEGER,
            is_false_negative INTEGER,
            processed_at INTEGER NOT NULL,
            PRIMARY KEY (run_id, entity_id, subtype),
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_corpus_source ON corpus(source_tag)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_results_run_error ON results(run_id, error_occurred)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
