//! Per-item processing: classify, parse, score, write one row.
//!
//! Transport and parse failures are data, not errors: they become a result
//! row with `error_occurred = true` and the loop moves on. The only `Err`
//! this module returns is a store failure (including a duplicate key), which
//! the run controller treats as fatal for the run.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::classifier::{Classifier, ClassifierError, ClassifyRequest};
use crate::models::{CorpusRecord, ErrorKind, Outcome, ParsedResponse, Run, ResultRecord};
use crate::parser::ResponseParser;
use crate::results::{self, WriteMode};

/// Classify `record` with the run's snapshot parameters and persist the
/// outcome.
pub async fn process_item(
    pool: &SqlitePool,
    classifier: &dyn Classifier,
    parser: &dyn ResponseParser,
    run: &Run,
    record: &CorpusRecord,
    mode: WriteMode,
) -> Result<ResultRecord> {
    let snapshot = &run.snapshot;
    let request = ClassifyRequest {
        text: &record.text,
        model: &snapshot.model,
        temperature: snapshot.temperature,
        prompt: &snapshot.prompt,
        seed: snapshot.seed,
    };

    let response = classifier.classify(&request).await;
    let result = build_result(&run.run_id, record, response, parser);

    if let Some(msg) = &result.error_message {
        tracing::warn!(
            run_id = %run.run_id,
            entity_id = %record.entity_id,
            subtype = %record.subtype,
            error = %msg,
            "item failed"
        );
    }

    results::write_result(pool, &result, mode).await?;
    Ok(result)
}

/// Build the result row for one classifier response. Does not touch the
/// store.
pub fn build_result(
    run_id: &str,
    record: &CorpusRecord,
    response: Result<String, ClassifierError>,
    parser: &dyn ResponseParser,
) -> ResultRecord {
    let mut result = ResultRecord {
        run_id: run_id.to_string(),
        entity_id: record.entity_id.clone(),
        subtype: record.subtype.clone(),
        detected: None,
        confidence: None,
        indicators: Default::default(),
        rationale: None,
        raw_response: None,
        ground_truth: record.ground_truth,
        error_occurred: false,
        error_kind: None,
        error_message: None,
        outcome: None,
        processed_at: chrono::Utc::now().timestamp(),
    };

    let raw = match response {
        Ok(raw) => raw,
        Err(e) => {
            set_error(&mut result, ErrorKind::Transport, &e.to_string());
            return result;
        }
    };

    let parsed = parser.parse(&raw);
    result.raw_response = Some(raw);

    match parsed {
        ParsedResponse::Success {
            detected,
            confidence,
            indicators,
            rationale,
        } => {
            result.detected = detected;
            result.confidence = confidence;
            result.indicators = indicators;
            result.rationale = Some(rationale);
            result.outcome = Outcome::score(detected, record.ground_truth);
        }
        ParsedResponse::Error { kind, message } => {
            set_error(&mut result, kind, &message);
        }
    }

    result
}

fn set_error(result: &mut ResultRecord, kind: ErrorKind, message: &str) {
    result.error_occurred = true;
    result.error_kind = Some(kind);
    result.error_message = Some(format!("{}: {}", kind.label(), message));
}
