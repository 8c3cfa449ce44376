//! LLM-backed classifiers for the two consumer stages.
//!
//! Flow for triage:
//! 1. Rules engine (fast, no LLM) → may short-circuit
//! 2. LLM triage → `{is_reservation_lead, initial_intent_type}`
//!
//! Extraction always goes to the LLM. Both classifiers swallow their own
//! failures and hand back the fallback value instead.

mod extractor;
mod json;
pub mod rules;
mod triage;

pub use extractor::LlmExtractor;
pub use json::extract_json_object;
pub use rules::RulesEngine;
pub use triage::LlmTriageClassifier;

use std::time::Duration;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Run a completion, giving up after `timeout`.
async fn complete_within(
    llm: &dyn LlmProvider,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<CompletionResponse, LlmError> {
    tokio::time::timeout(timeout, llm.complete(request))
        .await
        .map_err(|_| LlmError::Timeout {
            provider: llm.model_name().to_string(),
            timeout,
        })?
}
