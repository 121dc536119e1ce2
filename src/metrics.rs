//! Metrics aggregation over the result log.
//!
//! [`compute`] is a read-only query over the persisted rows of one run. It
//! never looks at in-memory counters, so a run that crashed after 4,000 items
//! and was resumed for the remaining 6,000 reports over all 10,000 rows.
//!
//! Errored rows are excluded from every count except `n_errors` and
//! `n_total`. Derived rates are `None` whenever their denominator is zero.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Confusion matrix counts plus derived rates for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBlock {
    pub n_true_positive: i64,
    pub n_true_negative: i64,
    pub n_false_positive: i64,
    pub n_false_negative: i64,
    pub n_positive_detected: i64,
    pub n_negative_detected: i64,
    pub n_positive_manual: i64,
    pub n_negative_manual: i64,
    /// Non-errored rows with both a verdict and a ground-truth label.
    pub n_scored: i64,
    pub n_errors: i64,
    pub n_total: i64,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

impl MetricsBlock {
    /// Fill in the derived rates from the counts.
    pub fn with_rates(mut self) -> Self {
        let tp = self.n_true_positive;
        let tn = self.n_true_negative;
        let fp = self.n_false_positive;
        let fn_ = self.n_false_negative;

        self.accuracy = ratio(tp + tn, tp + tn + fp + fn_);
        self.precision = ratio(tp, tp + fp);
        self.recall = ratio(tp, tp + fn_);
        self.f1 = f1_score(self.precision, self.recall);
        self
    }
}

fn ratio(num: i64, den: i64) -> Option<f64> {
    if den == 0 {
        None
    } else {
        Some(num as f64 / den as f64)
    }
}

fn f1_score(precision: Option<f64>, recall: Option<f64>) -> Option<f64> {
    let (p, r) = (precision?, recall?);
    let sum = p + r;
    if sum == 0.0 {
        None
    } else {
        Some(2.0 * p * r / sum)
    }
}

/// Aggregate the result log of `run_id` into a [`MetricsBlock`].
pub async fn compute(pool: &SqlitePool, run_id: &str) -> Result<MetricsBlock> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND is_true_positive = 1 THEN 1 ELSE 0 END), 0) AS tp,
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND is_true_negative = 1 THEN 1 ELSE 0 END), 0) AS tn,
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND is_false_positive = 1 THEN 1 ELSE 0 END), 0) AS fp,
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND is_false_negative = 1 THEN 1 ELSE 0 END), 0) AS fn_count,
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND detected = 1 THEN 1 ELSE 0 END), 0) AS pos_detected,
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND detected = 0 THEN 1 ELSE 0 END), 0) AS neg_detected,
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND ground_truth = 1 THEN 1 ELSE 0 END), 0) AS pos_manual,
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND ground_truth = 0 THEN 1 ELSE 0 END), 0) AS neg_manual,
            COALESCE(SUM(CASE WHEN error_occurred = 0 AND detected IS NOT NULL AND ground_truth IS NOT NULL THEN 1 ELSE 0 END), 0) AS scored,
            COALESCE(SUM(CASE WHEN error_occurred = 1 THEN 1 ELSE 0 END), 0) AS errors,
            COUNT(*) AS total
        FROM results
        WHERE run_id = ?
        "#,
    )
    .bind(run_id)
    .fetch_one(pool)
    .await?;

    let block = MetricsBlock {
        n_true_positive: row.get("tp"),
        n_true_negative: row.get("tn"),
        n_false_positive: row.get("fp"),
        n_false_negative: row.get("fn_count"),
        n_positive_detected: row.get("pos_detected"),
        n_negative_detected: row.get("neg_detected"),
        n_positive_manual: row.get("pos_manual"),
        n_negative_manual: row.get("neg_manual"),
        n_scored: row.get("scored"),
        n_errors: row.get("errors"),
        n_total: row.get("total"),
        ..MetricsBlock::default()
    };

    Ok(block.with_rates())
}
