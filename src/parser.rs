//! Turning raw classifier text into a [`ParsedResponse`].
//!
//! Models are asked to answer with a JSON object such as:
//!
//! ```json
//! {"detected": true, "confidence": 0.82, "indicators": ["physical", "threat"], "rationale": "..."}
//! ```
//!
//! In practice answers arrive wrapped in Markdown fences, preceded by chatter,
//! or with trailing commas. [`JsonVerdictParser`] strips those before giving
//! up. A parser never panics; anything it cannot read becomes
//! `ParsedResponse::Error { kind: Parse, .. }`.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::models::{ErrorKind, ParsedResponse};

pub trait ResponseParser: Send + Sync {
    fn parse(&self, raw: &str) -> ParsedResponse;
}

/// Parser for the JSON verdict format above.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonVerdictParser;

impl ResponseParser for JsonVerdictParser {
    fn parse(&self, raw: &str) -> ParsedResponse {
        let Some(candidate) = extract_object(raw) else {
            return parse_error("no JSON object found in response");
        };

        let value: Value = match serde_json::from_str(candidate) {
            Ok(v) => v,
            Err(first) => match serde_json::from_str(&strip_trailing_commas(candidate)) {
                Ok(v) => v,
                Err(_) => return parse_error(format!("invalid JSON: {first}")),
            },
        };

        let Some(obj) = value.as_object() else {
            return parse_error("response JSON is not an object");
        };

        let detected = match obj.get("detected") {
            None => return parse_error("missing 'detected' field"),
            Some(v) => match read_verdict(v) {
                Ok(d) => d,
                Err(msg) => return parse_error(msg),
            },
        };

        let confidence = obj.get("confidence").and_then(read_confidence);

        let indicators: BTreeSet<String> = obj
            .get("indicators")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let rationale = obj
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        ParsedResponse::Success {
            detected,
            confidence,
            indicators,
            rationale,
        }
    }
}

fn parse_error(message: impl Into<String>) -> ParsedResponse {
    ParsedResponse::Error {
        kind: ErrorKind::Parse,
        message: message.into(),
    }
}

/// Slice from the first `{` to the last `}`, which also drops Markdown
/// fences and any prose around the object.
fn extract_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

/// Remove commas that directly precede `}` or `]`, outside of strings.
fn strip_trailing_commas(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// `true`/`false`, common string spellings, or `null` for "undetermined".
fn read_verdict(value: &Value) -> Result<Option<bool>, String> {
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(Some(true)),
        Value::Number(n) if n.as_i64() == Some(0) => Ok(Some(false)),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(Some(true)),
            "false" | "no" | "n" | "0" => Ok(Some(false)),
            "unknown" | "unclear" | "null" | "" => Ok(None),
            other => Err(format!("unrecognized 'detected' value: {other:?}")),
        },
        other => Err(format!("unrecognized 'detected' value: {other}")),
    }
}

/// A number (or numeric string) in [0, 1]. Anything else is dropped.
fn read_confidence(value: &Value) -> Option<f64> {
    let c = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (0.0..=1.0).contains(&c).then_some(c)
}
