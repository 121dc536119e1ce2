//! Classifier abstraction and the OpenAI-compatible HTTP implementation.
//!
//! The engine treats the classifier as a stateless request/response service:
//! one narrative in, one raw text response out. Interpreting that text is the
//! job of [`crate::parser`].
//!
//! # Retry Strategy
//!
//! [`HttpClassifier`] makes `1 + max_retries` attempts per item:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! With the default `max_retries = 0`, each item is attempted once per pass
//! and failures are retried only by a later `resume --retry-errors-only`.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::ClassifierConfig;
use crate::error::EngineError;

/// Everything the classifier needs for one item.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyRequest<'a> {
    pub text: &'a str,
    pub model: &'a str,
    pub temperature: f64,
    pub prompt: &'a str,
    pub seed: Option<i64>,
}

/// Transport or service failure for one classify call.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed service response: {0}")]
    Malformed(String),
}

impl ClassifierError {
    fn is_retryable(&self) -> bool {
        match self {
            ClassifierError::Request(_) => true,
            ClassifierError::Status { status, .. } => *status == 429 || *status >= 500,
            ClassifierError::Malformed(_) => false,
        }
    }
}

/// A text classification service.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Short identifier used in logs (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Classify one text and return the service's raw answer.
    async fn classify(&self, request: &ClassifyRequest<'_>) -> Result<String, ClassifierError>;
}

/// Chat-completions client for OpenAI and compatible servers.
///
/// The prompt is sent as the system message and the narrative as the user
/// message; the first choice's message content is returned verbatim.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl HttpClassifier {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `api_key_env` names a variable that
    /// is not set.
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let api_key = match config.api_key_env.as_deref() {
            Some(var) if !var.is_empty() => Some(std::env::var(var).map_err(|_| {
                EngineError::config(format!("{} environment variable not set", var))
            })?),
            _ => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    async fn attempt(&self, body: &serde_json::Value) -> Result<String, ClassifierError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;
        let status = response.status();

        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;
        parse_chat_response(&json)
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        "openai"
    }

    async fn classify(&self, request: &ClassifyRequest<'_>) -> Result<String, ClassifierError> {
        let body = chat_request_body(request);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1u64 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.attempt(&body).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(attempt, error = %e, "classifier call failed, will retry");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| ClassifierError::Request("no attempts made".to_string())))
    }
}

fn chat_request_body(request: &ClassifyRequest<'_>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": request.model,
        "temperature": request.temperature,
        "messages": [
            { "role": "system", "content": request.prompt },
            { "role": "user", "content": request.text },
        ],
    });
    if let Some(seed) = request.seed {
        body["seed"] = serde_json::json!(seed);
    }
    body
}

/// Extract `choices[0].message.content` from a chat-completions response.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, ClassifierError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ClassifierError::Malformed("missing choices[0].message.content".to_string())
        })
}

/// Create the configured [`Classifier`].
pub fn create_classifier(config: &ClassifierConfig) -> Result<Box<dyn Classifier>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(HttpClassifier::new(config)?)),
        other => Err(EngineError::config(format!("unknown classifier provider: {}", other)).into()),
    }
}
