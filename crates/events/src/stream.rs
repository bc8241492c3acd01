//! Outbound event stream abstraction.
//!
//! The stream is the transport behind the outbox: rows are written durably
//! first and shipped afterwards, so a publish may be repeated after a crash.
//! Delivery is at-least-once and consumers are expected to be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

/// A single message on the transaction stream.
///
/// `key` is the transaction id, which gives downstream partitioning per
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamMessage {
    pub key: String,
    pub event_type: String,
    pub event_id: String,
    pub payload: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream unavailable: {0}")]
    Unavailable(String),

    #[error("stream rejected message: {0}")]
    Rejected(String),

    #[error("stream publish timed out")]
    Timeout,
}

/// Sink for outbound messages.
///
/// Implementations must bound the duration of `publish` so a stalled broker
/// cannot block the publisher cycle forever.
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn publish(&self, message: &StreamMessage) -> Result<(), StreamError>;
}

#[async_trait]
impl<S> EventStream for Arc<S>
where
    S: EventStream + ?Sized,
{
    async fn publish(&self, message: &StreamMessage) -> Result<(), StreamError> {
        (**self).publish(message).await
    }
}
