//! Run status and listing output.
//!
//! Backs `lh status <run_id>` and `lh runs`. Everything here is read-only:
//! progress and error counts come straight from the result log, metrics from
//! the registry row (completed runs) or a fresh aggregation (open runs).

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::metrics::{self, MetricsBlock};
use crate::models::{Run, RunStatus};
use crate::registry;
use crate::results::{self, ResultCounts};

/// Everything `lh status` shows for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run_id: String,
    pub name: String,
    pub status: RunStatus,
    pub model: String,
    pub temperature: f64,
    pub seed: Option<i64>,
    pub source: String,
    pub limit: Option<i64>,
    pub corpus_checksum: Option<String>,
    pub total_items: i64,
    pub items_processed: i64,
    pub errored: i64,
    pub transport_errors: i64,
    pub parse_errors: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub notes: Option<String>,
    /// Final metrics for completed runs; provisional ones otherwise.
    pub metrics: MetricsBlock,
    pub artifacts: Vec<String>,
}

pub async fn run_status_report(pool: &SqlitePool, run_id: &str) -> Result<RunStatusReport> {
    let run = registry::require_run(pool, run_id).await?;
    let counts = results::count_results(pool, run_id).await?;
    let metrics = match &run.metrics {
        Some(m) => m.clone(),
        None => metrics::compute(pool, run_id).await?,
    };
    Ok(build_report(run, counts, metrics))
}

fn build_report(run: Run, counts: ResultCounts, metrics: MetricsBlock) -> RunStatusReport {
    RunStatusReport {
        name: run.snapshot.name,
        status: run.status,
        model: run.snapshot.model,
        temperature: run.snapshot.temperature,
        seed: run.snapshot.seed,
        source: run.snapshot.source,
        limit: run.snapshot.limit,
        corpus_checksum: run.corpus_checksum,
        total_items: run.total_items,
        items_processed: counts.total,
        errored: counts.errored,
        transport_errors: counts.transport_errors,
        parse_errors: counts.parse_errors,
        started_at: format_ts_iso(run.started_at),
        ended_at: run.ended_at.map(format_ts_iso),
        notes: run.notes,
        metrics,
        artifacts: run.artifacts,
        run_id: run.run_id,
    }
}

/// CLI entry point for `lh status`.
pub async fn run_status(pool: &SqlitePool, run_id: &str, json: bool) -> Result<()> {
    let report = run_status_report(pool, run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("--- Run ---");
    println!("run_id:       {}", report.run_id);
    println!("name:         {}", report.name);
    println!("status:       {}", report.status);
    println!("model:        {}", report.model);
    println!("temperature:  {}", report.temperature);
    if let Some(seed) = report.seed {
        println!("seed:         {}", seed);
    }
    println!("source:       {}", report.source);
    if let Some(limit) = report.limit {
        println!("limit:        {}", limit);
    }
    println!(
        "checksum:     {}",
        report.corpus_checksum.as_deref().unwrap_or("(none)")
    );
    println!("started_at:   {}", report.started_at);
    if let Some(ref ended) = report.ended_at {
        println!("ended_at:     {}", ended);
    }
    if let Some(ref notes) = report.notes {
        println!("notes:        {}", notes);
    }
    println!();

    println!("--- Progress ---");
    println!(
        "processed:    {} / {} ({}%)",
        report.items_processed,
        report.total_items,
        if report.total_items > 0 {
            (report.items_processed * 100) / report.total_items
        } else {
            0
        }
    );
    println!(
        "errors:       {} (transport {}, parse {})",
        report.errored, report.transport_errors, report.parse_errors
    );
    println!();

    let m = &report.metrics;
    let heading = if report.status == RunStatus::Completed {
        "--- Metrics ---"
    } else {
        "--- Metrics (provisional) ---"
    };
    println!("{}", heading);
    println!(
        "TP {}  TN {}  FP {}  FN {}   (scored {})",
        m.n_true_positive, m.n_true_negative, m.n_false_positive, m.n_false_negative, m.n_scored
    );
    println!(
        "detected +{} / -{}   manual +{} / -{}",
        m.n_positive_detected, m.n_negative_detected, m.n_positive_manual, m.n_negative_manual
    );
    println!("accuracy:     {}", format_rate(m.accuracy));
    println!("precision:    {}", format_rate(m.precision));
    println!("recall:       {}", format_rate(m.recall));
    println!("f1:           {}", format_rate(m.f1));

    if !report.artifacts.is_empty() {
        println!();
        println!("--- Artifacts ---");
        for path in &report.artifacts {
            println!("{}", path);
        }
    }

    Ok(())
}

/// CLI entry point for `lh runs`.
pub async fn run_list(pool: &SqlitePool, limit: i64) -> Result<()> {
    let runs = registry::list_runs(pool, limit).await?;

    if runs.is_empty() {
        println!("no runs");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10} {:<20} {:>12} {:>8}   {}",
        "RUN ID", "STATUS", "NAME", "PROGRESS", "F1", "STARTED"
    );
    println!("{}", "-".repeat(108));
    for run in &runs {
        let f1 = run.metrics.as_ref().and_then(|m| m.f1);
        println!(
            "{:<36}  {:<10} {:<20} {:>12} {:>8}   {}",
            run.run_id,
            run.status.as_str(),
            truncate(&run.snapshot.name, 20),
            format!("{}/{}", run.items_processed, run.total_items),
            format_rate(f1),
            format_ts_relative(run.started_at)
        );
    }
    Ok(())
}

fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:.4}", r),
        None => "n/a".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
