//! Core data models used throughout the engine.
//!
//! These types represent the corpus records, runs, and per-item results that
//! flow between the store and the run controller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::metrics::MetricsBlock;

/// One unit of text to classify, as stored in the corpus table.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusRecord {
    pub id: i64,
    pub entity_id: String,
    pub subtype: String,
    pub text: String,
    /// Per-subtype label.
    pub ground_truth: Option<bool>,
    /// Aggregate label for the whole entity.
    pub entity_ground_truth: Option<bool>,
    pub source_tag: String,
    pub loaded_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved configuration recorded on a run at creation.
///
/// Resumes always classify with these values, never with whatever the
/// config file says at resume time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub name: String,
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub prompt: String,
    pub seed: Option<i64>,
    pub source: String,
    pub limit: Option<i64>,
    pub max_retries: u32,
}

/// One experiment execution, as stored in the run registry.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub snapshot: RunSnapshot,
    /// `None` for runs created before checksums were recorded.
    pub corpus_checksum: Option<String>,
    pub total_items: i64,
    pub items_processed: i64,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub metrics: Option<MetricsBlock>,
    pub artifacts: Vec<String>,
    pub notes: Option<String>,
}

/// Why an item ended up as an errored result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The classifier call itself failed.
    Transport,
    /// The classifier answered but no verdict could be extracted.
    Parse,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Parse => "parse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transport" => Some(Self::Transport),
            "parse" => Some(Self::Parse),
            _ => None,
        }
    }

    /// Prefix for stored error messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Transport => "transport failure",
            Self::Parse => "parse failure",
        }
    }
}

/// Structured interpretation of one raw classifier response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Success {
        detected: Option<bool>,
        confidence: Option<f64>,
        indicators: BTreeSet<String>,
        rationale: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// Confusion-matrix cell for a scored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    TruePositive,
    TrueNegative,
    FalsePositive,
    FalseNegative,
}

impl Outcome {
    /// Score a verdict against ground truth. `None` when either is unknown.
    pub fn score(detected: Option<bool>, truth: Option<bool>) -> Option<Self> {
        match (detected?, truth?) {
            (true, true) => Some(Self::TruePositive),
            (false, false) => Some(Self::TrueNegative),
            (true, false) => Some(Self::FalsePositive),
            (false, true) => Some(Self::FalseNegative),
        }
    }
}

/// One classification outcome in the result log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub run_id: String,
    pub entity_id: String,
    pub subtype: String,
    pub detected: Option<bool>,
    pub confidence: Option<f64>,
    pub indicators: BTreeSet<String>,
    pub rationale: Option<String>,
    pub raw_response: Option<String>,
    pub ground_truth: Option<bool>,
    pub error_occurred: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// Exported as the four `is_*` flags instead; see [`Self::is_true_positive`].
    #[serde(skip_serializing)]
    pub outcome: Option<Outcome>,
    pub processed_at: i64,
}

impl ResultRecord {
    pub fn is_true_positive(&self) -> Option<bool> {
        self.outcome.map(|o| o == Outcome::TruePositive)
    }
    pub fn is_true_negative(&self) -> Option<bool> {
        self.outcome.map(|o| o == Outcome::TrueNegative)
    }
    pub fn is_false_positive(&self) -> Option<bool> {
        self.outcome.map(|o| o == Outcome::FalsePositive)
    }
    pub fn is_false_negative(&self) -> Option<bool> {
        self.outcome.map(|o| o == Outcome::FalseNegative)
    }
}
