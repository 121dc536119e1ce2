//! TOML configuration parsing and validation.
//!
//! The configuration is loaded once per command and passed down explicitly.
//! Loading only checks shape; a `prompt_file` is read when a run is created
//! (see [`ExperimentConfig::resolve_prompt`]). The run registry snapshots the
//! resolved values, so a run record stays self-describing and resumable even
//! if the config file or the prompt file changes or disappears later.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub experiment: Option<ExperimentConfig>,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Name of the environment variable holding the API key. Unset means
    /// requests are sent without an `Authorization` header.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: default_endpoint(),
            api_key_env: None,
            model: None,
            temperature: 0.0,
            seed: None,
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExperimentConfig {
    #[serde(default = "default_experiment_name")]
    pub name: String,
    /// Corpus `source_tag` the run draws its items from.
    pub source: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn default_experiment_name() -> String {
    "experiment".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocksConfig {
    /// Directory for run lock files. Defaults to `<db dir>/locks`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

impl Config {
    /// The `[experiment]` section, required by `start`.
    pub fn experiment(&self) -> Result<&ExperimentConfig, EngineError> {
        self.experiment
            .as_ref()
            .ok_or_else(|| EngineError::config("[experiment] section is required to start a run"))
    }

    /// The configured classifier model, required by `start`.
    pub fn model(&self) -> Result<&str, EngineError> {
        self.classifier
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| EngineError::config("classifier.model must be set to start a run"))
    }

    pub fn lock_dir(&self) -> PathBuf {
        match &self.locks.dir {
            Some(dir) => dir.clone(),
            None => self
                .db
                .path
                .parent()
                .map(|p| p.join("locks"))
                .unwrap_or_else(|| PathBuf::from("locks")),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| EngineError::config(format!("failed to parse config file: {e}")))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), EngineError> {
    let classifier = &config.classifier;

    match classifier.provider.as_str() {
        "openai" => {}
        other => {
            return Err(EngineError::config(format!(
                "unknown classifier provider: '{other}'. Must be openai."
            )))
        }
    }

    if !(0.0..=2.0).contains(&classifier.temperature) {
        return Err(EngineError::config(
            "classifier.temperature must be in [0.0, 2.0]",
        ));
    }

    if classifier.timeout_secs == 0 {
        return Err(EngineError::config("classifier.timeout_secs must be >= 1"));
    }

    if let Some(experiment) = &config.experiment {
        if experiment.source.trim().is_empty() {
            return Err(EngineError::config("experiment.source must not be empty"));
        }
        if let Some(limit) = experiment.limit {
            if limit < 1 {
                return Err(EngineError::config("experiment.limit must be >= 1"));
            }
        }
        match (&experiment.prompt, &experiment.prompt_file) {
            (Some(_), Some(_)) => {
                return Err(EngineError::config(
                    "set only one of experiment.prompt and experiment.prompt_file",
                ))
            }
            (None, None) => {
                return Err(EngineError::config(
                    "one of experiment.prompt or experiment.prompt_file is required",
                ))
            }
            _ => {}
        }
    }

    Ok(())
}

impl ExperimentConfig {
    /// Prompt text for a new run, reading `prompt_file` if that is the source.
    ///
    /// Only run creation needs the text; resumed runs use the prompt in their
    /// snapshot, so the file is not touched at load time.
    pub fn resolve_prompt(&self) -> Result<String, EngineError> {
        let text = match (&self.prompt, &self.prompt_file) {
            (Some(prompt), None) => prompt.clone(),
            (None, Some(file)) => std::fs::read_to_string(file).map_err(|e| {
                EngineError::config(format!(
                    "failed to read prompt file {}: {e}",
                    file.display()
                ))
            })?,
            _ => {
                return Err(EngineError::config(
                    "exactly one of experiment.prompt or experiment.prompt_file must be set",
                ))
            }
        };

        if text.trim().is_empty() {
            return Err(EngineError::config("experiment prompt is empty"));
        }
        Ok(text)
    }
}
