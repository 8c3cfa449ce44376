//! First-pass lead triage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::classifier::complete_within;
use crate::classifier::json::parse_enveloped;
use crate::classifier::rules::RulesEngine;
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{RawItem, TriageClassifier, TriageVerdict};

/// Max tokens for the triage LLM call (the answer is two fields).
const TRIAGE_MAX_TOKENS: u32 = 128;

/// Temperature for triage (deterministic-ish).
const TRIAGE_TEMPERATURE: f32 = 0.1;

/// Body characters sent to the model. Enough to judge intent.
const TRIAGE_BODY_CHARS: usize = 2000;

/// Key some models wrap the verdict in.
const TRIAGE_ENVELOPE: &str = "triage_email_lead";

/// Rules engine in front of a small, fast model.
pub struct LlmTriageClassifier {
    llm: Arc<dyn LlmProvider>,
    rules: RulesEngine,
    timeout: Duration,
}

impl LlmTriageClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, rules: RulesEngine, timeout: Duration) -> Self {
        Self {
            llm,
            rules,
            timeout,
        }
    }

    async fn triage(&self, item: &RawItem) -> Result<TriageVerdict, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_triage_system_prompt()),
            ChatMessage::user(build_triage_user_prompt(item)),
        ])
        .with_temperature(TRIAGE_TEMPERATURE)
        .with_max_tokens(TRIAGE_MAX_TOKENS);

        let response = complete_within(self.llm.as_ref(), request, self.timeout).await?;

        parse_triage_response(&response.content).map_err(|reason| {
            warn!(
                id = %item.id,
                raw_response = %response.content,
                error = %reason,
                "Failed to parse triage response"
            );
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            }
        })
    }
}

#[async_trait]
impl TriageClassifier for LlmTriageClassifier {
    async fn classify(&self, item: &RawItem) -> TriageVerdict {
        if let Some(verdict) = self.rules.evaluate(item) {
            debug!(id = %item.id, intent = %verdict.intent, "Rules engine short-circuited triage");
            return verdict;
        }

        match self.triage(item).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(id = %item.id, error = %e, "Triage classification failed, using fallback");
                TriageVerdict::failure()
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_triage_system_prompt() -> String {
    "You are a fast triage evaluator for a hotel reservations inbox. Decide whether an email \
     is a genuine reservation lead.\n\n\
     Fields:\n\
     - \"is_reservation_lead\": true ONLY for a clear request for pricing, dates or availability, \
     or a follow-up/modification to an existing booking. false for everything else \
     (issue tracker notifications, newsletters, internal memos, generic complaints).\n\
     - \"initial_intent_type\": one of \"RFQ\", \"FOLLOW_UP\", \"NOISE_SPAM\", \"COMPLAINT\", \"OTHER\". \
     Use \"NOISE_SPAM\" for automated or unwanted mail.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"is_reservation_lead\": true, \"initial_intent_type\": \"RFQ\"}"
        .to_string()
}

fn build_triage_user_prompt(item: &RawItem) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(&format!("From: {}\n", item.sender));
    prompt.push_str(&format!("Subject: {}\n", item.subject));
    if let Some(sent_at) = item.sent_at {
        prompt.push_str(&format!("Date: {}\n", sent_at.to_rfc3339()));
    }

    let preview: String = item.body.chars().take(TRIAGE_BODY_CHARS).collect();
    prompt.push_str(&format!("\nMessage:\n{preview}"));
    prompt
}

fn parse_triage_response(raw: &str) -> Result<TriageVerdict, String> {
    parse_enveloped(raw, TRIAGE_ENVELOPE)
}
