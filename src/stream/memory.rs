//! In-process inbound stream backed by an unbounded channel.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::StreamError;
use crate::stream::{InboundStream, Subscription};

type Item = Result<Vec<u8>, StreamError>;

/// Single-subscriber in-memory stream.
pub struct MemoryStream {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Item>>>,
    topic: Mutex<Option<String>>,
}

/// Producer handle for a `MemoryStream`.
#[derive(Clone)]
pub struct MemoryPublisher {
    tx: mpsc::UnboundedSender<Item>,
}

impl MemoryStream {
    pub fn new() -> (Self, MemoryPublisher) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
                topic: Mutex::new(None),
            },
            MemoryPublisher { tx },
        )
    }

    /// Topic passed to the (single) `subscribe` call, if any.
    pub fn subscribed_topic(&self) -> Option<String> {
        self.topic.lock().ok().and_then(|t| t.clone())
    }
}

#[async_trait]
impl InboundStream for MemoryStream {
    fn name(&self) -> &str {
        "memory"
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StreamError> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| StreamError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "stream state poisoned".into(),
            })?
            .take()
            .ok_or_else(|| StreamError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "memory stream already has a subscriber".into(),
            })?;

        if let Ok(mut t) = self.topic.lock() {
            *t = Some(topic.to_string());
        }
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

impl MemoryPublisher {
    /// Deliver a raw payload. Returns false once the subscription is gone.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> bool {
        self.tx.send(Ok(payload.into())).is_ok()
    }

    /// Serialize and deliver a JSON value.
    pub fn publish_json(&self, value: &serde_json::Value) -> bool {
        self.publish(value.to_string())
    }

    /// Inject a transport error.
    pub fn publish_error(&self, error: StreamError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// True once the subscriber dropped its subscription.
    pub fn is_released(&self) -> bool {
        self.tx.is_closed()
    }
}
