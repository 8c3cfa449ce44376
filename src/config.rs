//! Configuration types, read once at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::mail::MailConfig;

/// Default output file for the persisted record stream.
pub const DEFAULT_OUTPUT_PATH: &str = "./poc_extracted_data.jsonl";

/// Polling discipline shared by both consumer stages.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    /// How long to wait on an empty queue before checking again.
    pub idle_delay: Duration,
    /// How long to pause after an unhandled error before resuming.
    pub error_backoff: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_millis(100),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mail: MailConfig,
    pub triage_llm: LlmConfig,
    pub extractor_llm: LlmConfig,
    /// Producer cadence. `None` runs ingestion once at startup.
    pub poll_interval: Option<Duration>,
    pub timing: LoopTiming,
    /// Upper bound on a single classifier call.
    pub classifier_timeout: Duration,
    /// Upper bound on the existing-customer lookup.
    pub lookup_timeout: Duration,
    pub output_path: PathBuf,
    /// Sender patterns that always reach model triage, past the noise rules.
    pub always_classify: Vec<String>,
}

impl PipelineConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mail = MailConfig::from_lookup(&lookup)?;

        let poll_secs: u64 = parse_or(&lookup, "EMAIL_POLL_INTERVAL_SECS", 60)?;
        let poll_interval = (poll_secs > 0).then(|| Duration::from_secs(poll_secs));

        let backend = match lookup("LEAD_LLM_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("anthropic") => LlmBackend::Anthropic,
            Some("openai") => LlmBackend::OpenAi,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "LEAD_LLM_BACKEND".into(),
                    message: format!("unknown backend '{other}' (expected anthropic or openai)"),
                });
            }
        };

        let key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = required(&lookup, key_var)?;

        let triage_model = lookup("LEAD_TRIAGE_MODEL")
            .unwrap_or_else(|| backend.default_triage_model().to_string());
        let extractor_model = lookup("LEAD_EXTRACTOR_MODEL")
            .unwrap_or_else(|| backend.default_extractor_model().to_string());

        let always_classify: Vec<String> = lookup("LEAD_ALWAYS_CLASSIFY")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        for pattern in &always_classify {
            regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
                key: "LEAD_ALWAYS_CLASSIFY".into(),
                message: format!("'{pattern}': {e}"),
            })?;
        }

        let timing = LoopTiming {
            idle_delay: Duration::from_millis(parse_or(&lookup, "LEAD_CONSUMER_IDLE_MS", 100)?),
            error_backoff: Duration::from_millis(parse_or(
                &lookup,
                "LEAD_CONSUMER_BACKOFF_MS",
                5000,
            )?),
        };

        Ok(Self {
            mail,
            triage_llm: LlmConfig {
                backend,
                api_key: SecretString::from(api_key.clone()),
                model: triage_model,
            },
            extractor_llm: LlmConfig {
                backend,
                api_key: SecretString::from(api_key),
                model: extractor_model,
            },
            poll_interval,
            timing,
            classifier_timeout: Duration::from_secs(parse_or(
                &lookup,
                "LEAD_CLASSIFIER_TIMEOUT_SECS",
                60,
            )?),
            lookup_timeout: Duration::from_millis(parse_or(&lookup, "LEAD_LOOKUP_TIMEOUT_MS", 2000)?),
            output_path: lookup("LEAD_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH)),
            always_classify,
        })
    }
}

/// Read a required, non-empty value.
pub(crate) fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an optional value, falling back to `default` when unset.
pub(crate) fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}
