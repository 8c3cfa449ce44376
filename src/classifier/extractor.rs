//! Deep extraction of booking details from a confirmed lead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::classifier::complete_within;
use crate::classifier::json::parse_enveloped;
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{ExtractionClassifier, ExtractionResult};

const EXTRACTOR_MAX_TOKENS: u32 = 1024;

const EXTRACTOR_TEMPERATURE: f32 = 0.0;

/// Upper bound on the text handed to the model.
const EXTRACTOR_BODY_CHARS: usize = 12_000;

const EXTRACTOR_ENVELOPE: &str = "extract_reservation_details";

/// Structured extraction backed by a larger model.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    async fn try_extract(&self, text: &str) -> Result<ExtractionResult, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_extractor_system_prompt()),
            ChatMessage::user(build_extractor_user_prompt(text)),
        ])
        .with_temperature(EXTRACTOR_TEMPERATURE)
        .with_max_tokens(EXTRACTOR_MAX_TOKENS);

        let response = complete_within(self.llm.as_ref(), request, self.timeout).await?;
        debug!(
            model = %self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Extraction response received"
        );

        parse_enveloped(&response.content, EXTRACTOR_ENVELOPE).map_err(|reason| {
            warn!(raw_response = %response.content, error = %reason, "Failed to parse extraction response");
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            }
        })
    }
}

#[async_trait]
impl ExtractionClassifier for LlmExtractor {
    async fn extract(&self, text: &str) -> ExtractionResult {
        match self.try_extract(text).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Extraction failed, substituting review sentinel");
                ExtractionResult::failure()
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_extractor_system_prompt() -> String {
    "You extract reservation details from an email already confirmed to be a booking lead.\n\n\
     Mandatory rules:\n\
     1. Dates MUST be YYYY-MM-DD. Compute check_out_date when the number of nights is given.\n\
     2. num_rooms is mandatory. If not explicit, derive it from num_people at 2 people per room, rounding up.\n\
     3. Map meal wording to board_basis codes: \"RO\" (room only, no meals), \"BB\" (breakfast), \
     \"HB\" (half board), \"FB\" (full board), \"AI\" (all inclusive), \"UNKNOWN\" if not stated.\n\
     4. Never omit a field. Use null for unknown nullable values and 0 for unknown counts.\n\
     5. intent is one of \"NEW_RFQ\", \"FOLLOW_UP_ORDER\", \"NEW_RFQ_AFTER_PREVIOUS\", \"CANCELLATION\", \"OTHER_INQUIRY\".\n\
     6. confidence_score is your confidence between 0.0 and 1.0.\n\n\
     Respond with ONLY a JSON object of this shape:\n\
     {\"intent\": \"NEW_RFQ\", \"confidence_score\": 0.9,\n\
      \"stay_dates\": {\"check_in_date\": \"2025-06-10\", \"check_out_date\": \"2025-06-13\", \"num_nights\": 3},\n\
      \"accommodation\": {\"num_people\": 4, \"num_rooms\": 2, \"board_basis\": \"BB\"},\n\
      \"hotel_preference\": {\"name\": null, \"star_rating\": 4},\n\
      \"requester_details\": {\"full_name\": \"Ana Pop\", \"organization\": null}}"
        .to_string()
}

fn build_extractor_user_prompt(text: &str) -> String {
    let body: String = text.chars().take(EXTRACTOR_BODY_CHARS).collect();
    format!("Email text:\n{body}")
}
