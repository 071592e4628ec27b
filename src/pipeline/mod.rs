//! Extraction pipeline.
//!
//! Every inbound message flows through:
//! 1. `InboundMessage::decode()`: raw stream payload to message
//! 2. `Extractor::extract()`: one model call, strict parse, review gate
//! 3. `MessageStore::save_message()`: best-effort hand-off to persistence
//!
//! `ConsumptionLoop` drives the three steps sequentially over a subscription.

pub mod consumer;
pub mod extractor;
pub mod types;

pub use consumer::{ConsumptionLoop, LoopState, LoopStats};
pub use extractor::Extractor;
pub use types::{ExtractedFields, ExtractionAction, ExtractionDecision, InboundMessage};
