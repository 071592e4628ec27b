//! Hub processor: turns inbound school messages into gated, structured
//! extraction decisions.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod shutdown;
pub mod store;
pub mod stream;
