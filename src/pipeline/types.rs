//! Shared types for the extraction pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

// ── Inbound message ─────────────────────────────────────────────────

/// A raw school communication as delivered by the inbound stream.
///
/// The wire format is a JSON object:
/// `{"id", "raw_body", "sender", "subject", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Unique message identity (used as the key in every log line).
    pub id: String,
    /// Message body, passed to the model verbatim.
    #[serde(rename = "raw_body")]
    pub body: String,
    /// Sender address.
    #[serde(default)]
    pub sender: String,
    /// Subject line.
    #[serde(default)]
    pub subject: String,
    /// When the message arrived upstream. Informational only; a missing
    /// value decodes as the Unix epoch.
    #[serde(rename = "timestamp", default)]
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Decode a raw stream payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let message: InboundMessage = serde_json::from_slice(payload)?;
        if message.id.trim().is_empty() {
            return Err(DecodeError::MissingId);
        }
        Ok(message)
    }
}

// ── Action tag ──────────────────────────────────────────────────────

/// What the extraction says should happen with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionAction {
    /// An event or deadline to put on the family calendar.
    CalendarSync,
    /// Something needs to be paid.
    PaymentRequired,
    /// Informational only.
    GeneralInfo,
    /// Any tag the backend sent that we do not recognise.
    #[serde(other)]
    Unknown,
}

impl ExtractionAction {
    /// Wire/DB label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CalendarSync => "CALENDAR_SYNC",
            Self::PaymentRequired => "PAYMENT_REQUIRED",
            Self::GeneralInfo => "GENERAL_INFO",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "CALENDAR_SYNC" => Self::CalendarSync,
            "PAYMENT_REQUIRED" => Self::PaymentRequired,
            "GENERAL_INFO" => Self::GeneralInfo,
            _ => Self::Unknown,
        }
    }
}

// ── Extracted fields ────────────────────────────────────────────────

/// Open key/value mapping produced by the model.
///
/// Expected keys are `title`, `date` (ISO-8601) and `description`, but none
/// are enforced. Readers use the typed accessors and must tolerate absence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedFields(serde_json::Map<String, serde_json::Value>);

impl ExtractedFields {
    pub fn new(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// String value for `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn title(&self) -> Option<&str> {
        self.get_str("title")
    }

    pub fn description(&self) -> Option<&str> {
        self.get_str("description")
    }

    /// Raw `date` string as the model wrote it.
    pub fn date_str(&self) -> Option<&str> {
        self.get_str("date")
    }

    /// Calendar date of the `date` field. Accepts a plain date or any
    /// ISO-8601 date-time; returns `None` when unparseable.
    pub fn date(&self) -> Option<NaiveDate> {
        let raw = self.date_str()?.trim();
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Some(date);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.date_naive());
        }
        raw.get(..10)
            .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// Validated, gated output of one extraction. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionDecision {
    reasoning: String,
    action: ExtractionAction,
    confidence: f64,
    extracted_fields: ExtractedFields,
    requires_human_review: bool,
}

impl ExtractionDecision {
    /// Build a decision, applying the review gate.
    ///
    /// `backend_review` is the model's own flag; it can only raise the
    /// result. Anything below `threshold` always requires review.
    pub(crate) fn gated(
        reasoning: String,
        action: ExtractionAction,
        confidence: f64,
        extracted_fields: ExtractedFields,
        backend_review: bool,
        threshold: f64,
    ) -> Self {
        Self {
            reasoning,
            action,
            confidence,
            extracted_fields,
            requires_human_review: backend_review || confidence < threshold,
        }
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn action(&self) -> ExtractionAction {
        self.action
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn extracted_fields(&self) -> &ExtractedFields {
        &self.extracted_fields
    }

    pub fn requires_human_review(&self) -> bool {
        self.requires_human_review
    }
}
