//! Consumption loop: subscribe once, then decode, extract and persist one
//! message at a time until cancelled.
//!
//! State machine:
//! `Starting → Subscribed → {Waiting ⇄ Processing} → Draining → Stopped`
//!
//! Only startup failures (the subscribe call) end `run()` with an error.
//! Everything after that is isolated to the message that caused it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::pipeline::extractor::Extractor;
use crate::pipeline::types::InboundMessage;
use crate::shutdown::ShutdownSignal;
use crate::store::traits::MessageStore;
use crate::stream::InboundStream;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Subscribed,
    Waiting,
    Processing,
    Draining,
    Stopped,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Payloads delivered by the subscription.
    pub received: u64,
    /// Payloads that decoded into a message.
    pub decoded: u64,
    pub decode_failures: u64,
    /// Extractions that produced a valid decision.
    pub extracted: u64,
    pub extraction_failures: u64,
    /// Decisions that require human review.
    pub flagged_for_review: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub transport_errors: u64,
    /// In-flight extractions dropped because the grace period ran out.
    pub discarded: u64,
}

/// Whether the loop keeps receiving after a message.
enum Flow {
    Continue,
    Stop,
}

/// Single sequential consumer over one subscription.
pub struct ConsumptionLoop {
    stream: Arc<dyn InboundStream>,
    extractor: Arc<Extractor>,
    store: Arc<dyn MessageStore>,
    topic: String,
    grace: Duration,
    state: watch::Sender<LoopState>,
}

impl ConsumptionLoop {
    pub fn new(
        stream: Arc<dyn InboundStream>,
        extractor: Arc<Extractor>,
        store: Arc<dyn MessageStore>,
        topic: impl Into<String>,
        grace: Duration,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Starting);
        Self {
            stream,
            extractor,
            store,
            topic: topic.into(),
            grace,
            state,
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: LoopState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "Loop state");
        }
    }

    /// Run until cancelled or until the subscription ends.
    ///
    /// Returns `Err` only if the initial subscribe fails.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<LoopStats, Error> {
        self.set_state(LoopState::Starting);
        let subscribed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = self.stream.subscribe(&self.topic) => Some(result),
        };
        let mut subscription = match subscribed {
            Some(Ok(sub)) => sub,
            Some(Err(e)) => {
                self.set_state(LoopState::Stopped);
                return Err(e.into());
            }
            None => {
                info!(topic = %self.topic, "Cancelled before subscription completed");
                self.set_state(LoopState::Stopped);
                return Ok(LoopStats::default());
            }
        };
        self.set_state(LoopState::Subscribed);
        info!(
            stream = self.stream.name(),
            topic = %self.topic,
            "Subscribed to inbound stream"
        );

        let mut stats = LoopStats::default();

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.set_state(LoopState::Waiting);

            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = subscription.next() => match item {
                    Some(Ok(payload)) => payload,
                    Some(Err(e)) => {
                        stats.transport_errors += 1;
                        warn!(error = %e, "Inbound stream error; still waiting");
                        continue;
                    }
                    None => {
                        warn!("Inbound stream closed");
                        break;
                    }
                },
            };

            self.set_state(LoopState::Processing);
            stats.received += 1;

            let message = match InboundMessage::decode(&payload) {
                Ok(message) => message,
                Err(e) => {
                    stats.decode_failures += 1;
                    warn!(bytes = payload.len(), error = %e, "Dropping undecodable message");
                    continue;
                }
            };
            stats.decoded += 1;

            if let Flow::Stop = self.process(&message, &mut shutdown, &mut stats).await {
                break;
            }
        }

        self.set_state(LoopState::Draining);
        drop(subscription);
        self.set_state(LoopState::Stopped);

        info!(
            received = stats.received,
            extracted = stats.extracted,
            flagged = stats.flagged_for_review,
            persisted = stats.persisted,
            failed = stats.decode_failures + stats.extraction_failures + stats.persist_failures,
            discarded = stats.discarded,
            "Consumption loop stopped"
        );
        Ok(stats)
    }

    /// Extract and persist one message.
    ///
    /// A cancellation that lands mid-extraction gives the call `grace` to
    /// finish. If it does, the decision is still persisted; if not, it is
    /// dropped and nothing is written for this message.
    async fn process(
        &self,
        message: &InboundMessage,
        shutdown: &mut ShutdownSignal,
        stats: &mut LoopStats,
    ) -> Flow {
        let extraction = self.extractor.extract(message, Utc::now());
        tokio::pin!(extraction);

        let (result, flow) = tokio::select! {
            result = &mut extraction => (result, Flow::Continue),
            _ = shutdown.cancelled() => {
                self.set_state(LoopState::Draining);
                info!(
                    id = %message.id,
                    grace_secs = self.grace.as_secs_f64(),
                    "Shutdown requested; waiting for in-flight extraction"
                );
                match tokio::time::timeout(self.grace, &mut extraction).await {
                    Ok(result) => (result, Flow::Stop),
                    Err(_) => {
                        stats.discarded += 1;
                        warn!(id = %message.id, "Grace period elapsed; discarding in-flight extraction");
                        return Flow::Stop;
                    }
                }
            }
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                stats.extraction_failures += 1;
                error!(id = %message.id, error = %e, "Extraction failed; skipping message");
                return flow;
            }
        };
        stats.extracted += 1;
        if decision.requires_human_review() {
            stats.flagged_for_review += 1;
        }

        info!(
            id = %message.id,
            action = decision.action().label(),
            confidence = decision.confidence(),
            requires_review = decision.requires_human_review(),
            title = decision.extracted_fields().title().unwrap_or(""),
            "Message extracted"
        );

        match self.store.save_message(message, &decision).await {
            Ok(()) => stats.persisted += 1,
            Err(e) => {
                stats.persist_failures += 1;
                error!(id = %message.id, error = %e, "Failed to persist decision");
            }
        }

        flow
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::config::ExtractorConfig;
    use crate::error::{DatabaseError, LlmError, StreamError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::pipeline::types::ExtractionDecision;
    use crate::shutdown::Shutdown;
    use crate::stream::MemoryStream;

    const CONFIDENT: &str = r#"{"reasoning":"r","action":"GENERAL_INFO","confidence":0.95,"requires_hitl":false,"extracted_data":{}}"#;

    struct FixedLlm;

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: CONFIDENT.into(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageStore for RecordingStore {
        async fn save_message(
            &self,
            message: &InboundMessage,
            _decision: &ExtractionDecision,
        ) -> Result<(), DatabaseError> {
            self.ids.lock().unwrap().push(message.id.clone());
            Ok(())
        }
    }

    fn payload(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "raw_body": "Spirit day on Friday.",
            "sender": "office@school.example",
            "subject": "Spirit day",
            "timestamp": "2026-10-14T15:00:00Z",
        })
    }

    fn make_loop(stream: MemoryStream, store: Arc<RecordingStore>) -> ConsumptionLoop {
        let extractor = Extractor::new(Arc::new(FixedLlm), ExtractorConfig::default());
        ConsumptionLoop::new(
            Arc::new(stream),
            Arc::new(extractor),
            store,
            "inbound_emails",
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn processes_until_stream_closes() {
        let (stream, publisher) = MemoryStream::new();
        let store = Arc::new(RecordingStore::default());
        let consumer = make_loop(stream, store.clone());

        publisher.publish_json(&payload("a"));
        publisher.publish("not json");
        publisher.publish_error(StreamError::Transport("reset".into()));
        publisher.publish_json(&payload("b"));
        drop(publisher);

        let shutdown = Shutdown::new();
        let stats = consumer.run(shutdown.signal()).await.unwrap();

        assert_eq!(*store.ids.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.decoded, 2);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.persisted, 2);
        assert_eq!(consumer.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn cancelled_before_start_stops_without_receiving() {
        let (stream, publisher) = MemoryStream::new();
        let store = Arc::new(RecordingStore::default());
        let consumer = make_loop(stream, store.clone());
        publisher.publish_json(&payload("a"));

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let stats = consumer.run(shutdown.signal()).await.unwrap();

        assert_eq!(stats, LoopStats::default());
        assert_eq!(consumer.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn subscribe_failure_is_fatal() {
        let (stream, _publisher) = MemoryStream::new();
        let stream = Arc::new(stream);
        let _taken = stream.subscribe("other").await.unwrap();

        let extractor = Extractor::new(Arc::new(FixedLlm), ExtractorConfig::default());
        let consumer = ConsumptionLoop::new(
            stream,
            Arc::new(extractor),
            Arc::new(RecordingStore::default()),
            "inbound_emails",
            Duration::from_secs(1),
        );

        let result = consumer.run(Shutdown::new().signal()).await;
        assert!(matches!(result, Err(Error::Stream(StreamError::SubscribeFailed { .. }))));
        assert_eq!(consumer.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn state_reaches_waiting_after_subscribe() {
        let (stream, _publisher) = MemoryStream::new();
        let consumer = Arc::new(make_loop(stream, Arc::new(RecordingStore::default())));
        let mut states = consumer.watch_state();

        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let task = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(signal).await })
        };

        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|s| *s == LoopState::Waiting),
        )
        .await
        .unwrap()
        .unwrap();

        shutdown.trigger();
        task.await.unwrap().unwrap();
        assert_eq!(consumer.state(), LoopState::Stopped);
    }
}
