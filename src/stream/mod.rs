//! Inbound stream abstraction.
//!
//! A stream adapter only moves raw payload bytes. Decoding into
//! `InboundMessage` belongs to the consumption loop.

pub mod memory;
pub mod redis;

pub use memory::{MemoryPublisher, MemoryStream};
pub use redis::RedisStream;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::StreamError;

/// Live subscription: raw payloads, or transport errors that do not end it.
///
/// The stream ending (`None`) means the transport is gone for good.
/// Dropping the subscription releases it.
pub type Subscription = Pin<Box<dyn Stream<Item = Result<Vec<u8>, StreamError>> + Send>>;

/// Subscribe-only transport delivering raw message payloads.
#[async_trait]
pub trait InboundStream: Send + Sync {
    /// Adapter name for logs (e.g. "redis").
    fn name(&self) -> &str;

    /// Subscribe to `topic`. Failure here is a fatal startup error.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, StreamError>;
}
