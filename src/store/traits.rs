//! Persistence seam for processed messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::{ExtractedFields, ExtractionAction, ExtractionDecision, InboundMessage};

/// Where a processed message sits after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    /// Confident enough to act on without a human.
    AutoApproved,
    /// Waiting in the human review queue.
    PendingReview,
}

impl ReviewStatus {
    pub fn for_decision(decision: &ExtractionDecision) -> Self {
        if decision.requires_human_review() {
            Self::PendingReview
        } else {
            Self::AutoApproved
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApproved => "auto_approved",
            Self::PendingReview => "pending_review",
        }
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_approved" => Ok(Self::AutoApproved),
            "pending_review" => Ok(Self::PendingReview),
            other => Err(format!("unknown review status: {other}")),
        }
    }
}

/// A message joined with its extraction outcome, as read back from storage.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub raw_body: String,
    pub received_at: DateTime<Utc>,
    pub action: ExtractionAction,
    pub confidence: f64,
    pub requires_review: bool,
    pub reasoning: String,
    pub extracted_fields: ExtractedFields,
    pub status: ReviewStatus,
    pub processed_at: DateTime<Utc>,
}

/// Sink for finished extractions.
///
/// Called once per successfully extracted message. A failure is logged by
/// the caller and never stops consumption.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or replace the record for `message.id`.
    async fn save_message(
        &self,
        message: &InboundMessage,
        decision: &ExtractionDecision,
    ) -> Result<(), DatabaseError>;
}
