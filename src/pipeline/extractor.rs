//! Turns one inbound message into a gated `ExtractionDecision`.
//!
//! Flow for a single call:
//! 1. Build the system instruction (template + injected date + locale anchor)
//!    and the user instruction (message body, verbatim)
//! 2. One completion call to the model backend, no retries
//! 3. Strict parse of the response into the decision shape
//! 4. Confidence validation, then the human-review gate
//!
//! The current time is a parameter, never read here, so relative dates in
//! the prompt are reproducible.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ExtractorConfig;
use crate::error::ExtractionError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{
    ExtractedFields, ExtractionAction, ExtractionDecision, InboundMessage,
};

/// Temperature for extraction (low for consistent structured output).
const EXTRACTION_TEMPERATURE: f32 = 0.1;

/// Max tokens for the extraction response.
const EXTRACTION_MAX_TOKENS: u32 = 1024;

/// Fixed part of the system instruction.
const EXTRACTION_SYSTEM_TEMPLATE: &str = "\
ROLE: School administrative assistant for a family.
TASK: Read one school message and extract the calendar event, deadline or \
payment it describes.

INSTRUCTIONS:
1. REASONING: Think step by step. Resolve relative dates (\"next Thursday\", \
\"this coming Friday\", \"tomorrow\") against the CONTEXT date below.
2. LANGUAGE: Write every output field in English.
3. SUMMARY: \"description\" is a short summary for parents, at most two sentences.
4. ACTION: Use CALENDAR_SYNC for events and deadlines, PAYMENT_REQUIRED when \
money is owed, GENERAL_INFO otherwise.
5. CONFIDENCE: A number between 0.0 and 1.0. Go below {threshold} when details \
are missing or the date calculation is uncertain, and set requires_hitl to true.

Respond with ONLY a JSON object:
{
  \"reasoning\": \"step-by-step notes\",
  \"action\": \"CALENDAR_SYNC\" | \"PAYMENT_REQUIRED\" | \"GENERAL_INFO\",
  \"confidence\": 0.0,
  \"requires_hitl\": false,
  \"extracted_data\": {
    \"title\": \"clear event title\",
    \"date\": \"YYYY-MM-DD or full ISO-8601 date-time\",
    \"description\": \"summary for parents\"
  }
}";

/// One model call per message, gated locally.
pub struct Extractor {
    llm: Arc<dyn LlmProvider>,
    config: ExtractorConfig,
}

impl Extractor {
    /// Create a new extractor. The config is read-only from here on.
    pub fn new(llm: Arc<dyn LlmProvider>, config: ExtractorConfig) -> Self {
        Self { llm, config }
    }

    /// Extract a decision for `message` as of `now`.
    ///
    /// Makes at most one backend call. Returns either a fully valid decision
    /// or an error; never a partial decision.
    pub async fn extract(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<ExtractionDecision, ExtractionError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt(now)),
            ChatMessage::user(build_user_prompt(message)),
        ])
        .with_temperature(EXTRACTION_TEMPERATURE)
        .with_max_tokens(EXTRACTION_MAX_TOKENS)
        .with_json_response();

        let response = self.llm.complete(request).await?;
        debug!(
            id = %message.id,
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost_usd = %self.llm.estimate_cost(&response),
            "Extraction completion received"
        );

        let raw = parse_model_decision(&response.content)?;
        let confidence = validate_confidence(raw.confidence)?;

        let decision = ExtractionDecision::gated(
            raw.reasoning,
            raw.action,
            confidence,
            raw.extracted_data,
            raw.requires_hitl,
            self.config.hitl_threshold,
        );

        if decision.requires_human_review() {
            warn!(
                id = %message.id,
                confidence = decision.confidence(),
                threshold = self.config.hitl_threshold,
                backend_flag = raw.requires_hitl,
                "Message flagged for human review"
            );
        }

        Ok(decision)
    }

    /// System instruction for a call made at `now`.
    pub fn system_prompt(&self, now: DateTime<Utc>) -> String {
        let local = now.with_timezone(&self.config.utc_offset);
        let template =
            EXTRACTION_SYSTEM_TEMPLATE.replace("{threshold}", &format!("{:.2}", self.config.hitl_threshold));
        format!(
            "{template}\n\nCONTEXT: Today is {} ({}). Timezone: {} (UTC{}). Location: {}.",
            local.format("%A, %B %d, %Y"),
            local.format("%Y-%m-%d"),
            self.config.timezone_name,
            self.config.utc_offset,
            self.config.location,
        )
    }
}

/// User instruction: the body, untouched.
fn build_user_prompt(message: &InboundMessage) -> String {
    format!("EMAIL CONTENT:\n{}", message.body)
}

// ── Response parsing ────────────────────────────────────────────────

/// Decision shape as the model writes it.
#[derive(Debug, Deserialize)]
struct ModelDecision {
    #[serde(default)]
    reasoning: String,
    action: ExtractionAction,
    confidence: f64,
    #[serde(default, alias = "requires_human_review")]
    requires_hitl: bool,
    #[serde(default, alias = "extracted_fields")]
    extracted_data: ExtractedFields,
}

/// Parse the raw completion. Anything that is not exactly a JSON object of
/// the decision shape is rejected; nothing is repaired.
fn parse_model_decision(raw: &str) -> Result<ModelDecision, ExtractionError> {
    serde_json::from_str(raw.trim()).map_err(|e| ExtractionError::MalformedResponse {
        reason: e.to_string(),
    })
}

fn validate_confidence(value: f64) -> Result<f64, ExtractionError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ExtractionError::ConfidenceOutOfRange { value })
    }
}
