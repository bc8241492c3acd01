//! Infrastructure layer: stores, Hold Service client, orchestration, event
//! processing, outbox publishing and configuration.

pub mod config;
pub mod error;
pub mod event_stream;
pub mod hold_client;
pub mod orchestrator;
pub mod outbox;
pub mod saga;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use error::{ErrorKind, ServiceError, ServiceResult};
pub use hold_client::{HoldClient, HoldClientError, HttpHoldClient};
pub use orchestrator::{TransactionOrchestrator, TransactionReceipt, TransactionRequest};
pub use saga::{HoldEventProcessor, ProcessOutcome};
