//! Out-of-band delivery of outbox rows to the event stream.

pub mod publisher;

pub use publisher::{
    CycleReport, OutboxPublisher, OutboxPublisherConfig, OutboxPublisherHandle, PublisherStats,
};
