//! Run progress reporting.
//!
//! Reports observable progress while a run works through its items so an
//! operator can see how much is left. Progress is emitted on **stderr** so
//! stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// Work set resolved: `remaining` of `total` slice items still to do.
    Resolved {
        run_id: String,
        remaining: u64,
        total: u64,
    },
    /// One more item written. `done` counts rows in the result log.
    Processing {
        run_id: String,
        done: u64,
        total: u64,
        errors: u64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run 4f1c…  processing  1,234 / 5,000 items".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Resolved {
                run_id,
                remaining,
                total,
            } => format!(
                "run {}  resolved  {} / {} items remaining\n",
                short_id(run_id),
                format_number(*remaining),
                format_number(*total)
            ),
            RunProgressEvent::Processing {
                run_id,
                done,
                total,
                errors,
            } => {
                let mut line = format!(
                    "run {}  processing  {} / {} items",
                    short_id(run_id),
                    format_number(*done),
                    format_number(*total)
                );
                if *errors > 0 {
                    line.push_str(&format!("  ({} errors)", format_number(*errors)));
                }
                line.push('\n');
                line
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Resolved {
                run_id,
                remaining,
                total,
            } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "phase": "resolved",
                "remaining": remaining,
                "total": total
            }),
            RunProgressEvent::Processing {
                run_id,
                done,
                total,
                errors,
            } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "phase": "processing",
                "n": done,
                "total": total,
                "errors": errors
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
