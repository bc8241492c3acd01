//! In-memory event stream for tests/dev.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::stream::{EventStream, StreamError, StreamMessage};

/// Records every published message.
///
/// - No IO
/// - `fail_next(n)` makes the next `n` publishes fail, for retry tests
#[derive(Debug, Default)]
pub struct InMemoryEventStream {
    published: Mutex<Vec<StreamMessage>>,
    failures_remaining: AtomicUsize,
}

impl InMemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Snapshot of everything published so far, in publish order.
    pub fn published(&self) -> Vec<StreamMessage> {
        match self.published.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn published_of_type(&self, event_type: &str) -> Vec<StreamMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    async fn publish(&self, message: &StreamMessage) -> Result<(), StreamError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StreamError::Unavailable("injected failure".to_string()));
        }

        let mut published = self
            .published
            .lock()
            .map_err(|_| StreamError::Unavailable("in-memory stream lock poisoned".to_string()))?;
        published.push(message.clone());
        Ok(())
    }
}
