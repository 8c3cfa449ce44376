//! Error types for the lead pipeline.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mail collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail server {host} unreachable: {reason}")]
    Connectivity { host: String, reason: String },

    #[error("Mail protocol error: {0}")]
    Protocol(String),

    #[error("Mail login failed for {user}")]
    Auth { user: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Record sink and customer lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to write record {id}: {reason}")]
    WriteFailed { id: String, reason: String },

    #[error("Lookup failed: {0}")]
    Lookup(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while a stage handles a single job.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Malformed job {id}: {reason}")]
    MalformedJob { id: String, reason: String },

    #[error("Stage {stage} panicked: {message}")]
    Panicked { stage: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}
