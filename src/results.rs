//! Result log access.
//!
//! `(run_id, entity_id, subtype)` is the table's primary key. A plain
//! [`insert_result`] of an existing key fails with
//! [`EngineError::DuplicateResult`]; [`supersede_errored`] replaces a row
//! only if that row is errored, and fails the same way otherwise. Neither
//! path can ever produce a second row for a key.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

use crate::error::EngineError;
use crate::models::{ErrorKind, Outcome, ResultRecord};

/// How a processed item is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The key must not exist yet.
    Insert,
    /// The key may exist, but only as an errored row.
    SupersedeErrored,
}

/// Error counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultCounts {
    pub total: i64,
    pub errored: i64,
    pub transport_errors: i64,
    pub parse_errors: i64,
}

pub async fn write_result(pool: &SqlitePool, record: &ResultRecord, mode: WriteMode) -> Result<()> {
    match mode {
        WriteMode::Insert => insert_result(pool, record).await,
        WriteMode::SupersedeErrored => supersede_errored(pool, record).await,
    }
}

const INSERT_SQL: &str = r#"
    INSERT INTO results (run_id, entity_id, subtype, detected, confidence, indicators_json,
                         rationale, raw_response, ground_truth, error_occurred, error_kind,
                         error_message, is_true_positive, is_true_negative, is_false_positive,
                         is_false_negative, processed_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

pub async fn insert_result(pool: &SqlitePool, record: &ResultRecord) -> Result<()> {
    let indicators_json = serde_json::to_string(&record.indicators)?;

    let res = sqlx::query(INSERT_SQL)
        .bind(&record.run_id)
        .bind(&record.entity_id)
        .bind(&record.subtype)
        .bind(record.detected)
        .bind(record.confidence)
        .bind(&indicators_json)
        .bind(&record.rationale)
        .bind(&record.raw_response)
        .bind(record.ground_truth)
        .bind(record.error_occurred)
        .bind(record.error_kind.map(ErrorKind::as_str))
        .bind(&record.error_message)
        .bind(record.is_true_positive())
        .bind(record.is_true_negative())
        .bind(record.is_false_positive())
        .bind(record.is_false_negative())
        .bind(record.processed_at)
        .execute(pool)
        .await;

    match res {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(duplicate(record).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Replace an errored row for the same key, or insert if none exists.
pub async fn supersede_errored(pool: &SqlitePool, record: &ResultRecord) -> Result<()> {
    let indicators_json = serde_json::to_string(&record.indicators)?;
    let sql = format!(
        r#"{INSERT_SQL}
        ON CONFLICT(run_id, entity_id, subtype) DO UPDATE SET
            detected = excluded.detected,
            confidence = excluded.confidence,
            indicators_json = excluded.indicators_json,
            rationale = excluded.rationale,
            raw_response = excluded.raw_response,
            ground_truth = excluded.ground_truth,
            error_occurred = excluded.error_occurred,
            error_kind = excluded.error_kind,
            error_message = excluded.error_message,
            is_true_positive = excluded.is_true_positive,
            is_true_negative = excluded.is_true_negative,
            is_false_positive = excluded.is_false_positive,
            is_false_negative = excluded.is_false_negative,
            processed_at = excluded.processed_at
        WHERE results.error_occurred = 1
        "#
    );

    let affected = sqlx::query(&sql)
        .bind(&record.run_id)
        .bind(&record.entity_id)
        .bind(&record.subtype)
        .bind(record.detected)
        .bind(record.confidence)
        .bind(&indicators_json)
        .bind(&record.rationale)
        .bind(&record.raw_response)
        .bind(record.ground_truth)
        .bind(record.error_occurred)
        .bind(record.error_kind.map(ErrorKind::as_str))
        .bind(&record.error_message)
        .bind(record.is_true_positive())
        .bind(record.is_true_negative())
        .bind(record.is_false_positive())
        .bind(record.is_false_negative())
        .bind(record.processed_at)
        .execute(pool)
        .await?
        .rows_affected();

    // Zero rows: the existing row was a success and must stay as is.
    if affected == 0 {
        return Err(duplicate(record).into());
    }
    Ok(())
}

fn duplicate(record: &ResultRecord) -> EngineError {
    EngineError::DuplicateResult {
        run_id: record.run_id.clone(),
        entity_id: record.entity_id.clone(),
        subtype: record.subtype.clone(),
    }
}

pub async fn get_result(
    pool: &SqlitePool,
    run_id: &str,
    entity_id: &str,
    subtype: &str,
) -> Result<Option<ResultRecord>> {
    let row = sqlx::query(
        "SELECT * FROM results WHERE run_id = ? AND entity_id = ? AND subtype = ?",
    )
    .bind(run_id)
    .bind(entity_id)
    .bind(subtype)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(result_from_row).transpose()
}

/// All rows of a run, ordered by key. Consumers must not rely on
/// insertion order.
pub async fn list_results(pool: &SqlitePool, run_id: &str) -> Result<Vec<ResultRecord>> {
    let rows = sqlx::query("SELECT * FROM results WHERE run_id = ? ORDER BY entity_id, subtype")
        .bind(run_id)
        .fetch_all(pool)
        .await?;

    rows.iter().map(result_from_row).collect()
}

pub async fn count_results(pool: &SqlitePool, run_id: &str) -> Result<ResultCounts> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(error_occurred), 0) AS errored,
            COALESCE(SUM(CASE WHEN error_kind = 'transport' THEN 1 ELSE 0 END), 0) AS transport_errors,
            COALESCE(SUM(CASE WHEN error_kind = 'parse' THEN 1 ELSE 0 END), 0) AS parse_errors
        FROM results WHERE run_id = ?
        "#,
    )
    .bind(run_id)
    .fetch_one(pool)
    .await?;

    Ok(ResultCounts {
        total: row.get("total"),
        errored: row.get("errored"),
        transport_errors: row.get("transport_errors"),
        parse_errors: row.get("parse_errors"),
    })
}

fn result_from_row(row: &SqliteRow) -> Result<ResultRecord> {
    let indicators_json: String = row.get("indicators_json");
    let indicators: BTreeSet<String> = serde_json::from_str(&indicators_json)?;
    let error_kind: Option<String> = row.get("error_kind");

    let flags: [Option<bool>; 4] = [
        row.get("is_true_positive"),
        row.get("is_true_negative"),
        row.get("is_false_positive"),
        row.get("is_false_negative"),
    ];
    let outcome = match flags {
        [Some(true), _, _, _] => Some(Outcome::TruePositive),
        [_, Some(true), _, _] => Some(Outcome::TrueNegative),
        [_, _, Some(true), _] => Some(Outcome::FalsePositive),
        [_, _, _, Some(true)] => Some(Outcome::FalseNegative),
        _ => None,
    };

    Ok(ResultRecord {
        run_id: row.get("run_id"),
        entity_id: row.get("entity_id"),
        subtype: row.get("subtype"),
        detected: row.get("detected"),
        confidence: row.get("confidence"),
        indicators,
        rationale: row.get("rationale"),
        raw_response: row.get("raw_response"),
        ground_truth: row.get("ground_truth"),
        error_occurred: row.get("error_occurred"),
        error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
        error_message: row.get("error_message"),
        outcome,
        processed_at: row.get("processed_at"),
    })
}
