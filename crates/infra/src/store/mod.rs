//! Ledger, idempotency and outbox persistence.
//!
//! The three stores share one atomicity boundary: a [`UnitOfWork`] opened by
//! [`LedgerStore::begin`]. Account and transaction mutations, outbox inserts
//! and idempotency markers written through the same unit of work either all
//! commit or all disappear. Dropping a unit of work without committing rolls
//! it back.
//!
//! Locking: `accounts_for_update` and `transaction_for_update` take exclusive
//! locks held until commit/rollback. Callers lock the transaction before its
//! accounts, and multiple accounts are locked in ascending id order.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use creditx_core::{AccountId, OutboxEventId, TransactionId};
use creditx_events::TransactionEvent;
use creditx_ledger::{Account, EntryLine, NewTransaction, Transaction, TransactionEntry};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    /// The idempotency record already holds a final outcome.
    #[error("event {0} has already been processed")]
    DuplicateEvent(String),

    #[error("corrupt {table} row: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }

    pub fn corrupt(table: &'static str, message: impl fmt::Display) -> Self {
        Self::Corrupt {
            table,
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PUBLISHED" => Ok(Self::Published),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown outbox status {other:?}")),
        }
    }
}

/// A durable delivery intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub event_type: String,
    pub aggregate_id: TransactionId,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingOutcome {
    Success,
    Failed,
    Skipped,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Final outcomes short-circuit redelivery; FAILED leaves the event open
    /// for another attempt.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl FromStr for ProcessingOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(format!("unknown processing outcome {other:?}")),
        }
    }
}

/// Idempotency marker for an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub transaction_id: TransactionId,
    pub payload_hash: String,
    pub outcome: ProcessingOutcome,
    pub processed_at: DateTime<Utc>,
}

/// Scoped, all-or-nothing unit of work across the ledger, idempotency and
/// outbox stores.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock and load the given accounts. Missing ids are absent from the result,
    /// which is ordered by id.
    async fn accounts_for_update(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError>;

    async fn account_for_update(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts_for_update(&[id]).await?.into_iter().next())
    }

    /// Persist balances/status of an account locked by this unit of work.
    async fn save_account(&mut self, account: &Account) -> Result<(), StoreError>;

    async fn insert_transaction(&mut self, new: NewTransaction) -> Result<Transaction, StoreError>;

    async fn transaction_for_update(
        &mut self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, StoreError>;

    async fn save_transaction(&mut self, txn: &Transaction) -> Result<(), StoreError>;

    async fn save_entries(
        &mut self,
        transaction_id: TransactionId,
        lines: &[EntryLine],
    ) -> Result<Vec<TransactionEntry>, StoreError>;

    async fn append_outbox(&mut self, event: &TransactionEvent) -> Result<OutboxEventId, StoreError>;

    /// True when the event id carries a final (SUCCESS/SKIPPED) outcome.
    async fn is_event_processed(&mut self, event_id: &str) -> Result<bool, StoreError>;

    /// True when any final (SUCCESS/SKIPPED) record carries this payload hash.
    async fn is_payload_processed(&mut self, payload_hash: &str) -> Result<bool, StoreError>;

    /// Insert the marker, or overwrite an earlier FAILED one. Fails with
    /// [`StoreError::DuplicateEvent`] when a final outcome is already recorded,
    /// at the latest on commit.
    async fn mark_processed(&mut self, record: &ProcessedEvent) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Entry point to the ledger: units of work plus read-only lookups.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    async fn entries(&self, transaction_id: TransactionId) -> Result<Vec<TransactionEntry>, StoreError>;

    async fn processed_event(&self, event_id: &str) -> Result<Option<ProcessedEvent>, StoreError>;
}

/// Publisher-facing side of the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest PENDING rows first.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn mark_published(&self, id: OutboxEventId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Mark FAILED and count the attempt.
    async fn mark_failed(&self, id: OutboxEventId, error: &str) -> Result<(), StoreError>;

    /// Move FAILED rows with fewer than `max_attempts` attempts back to PENDING.
    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64, StoreError>;

    async fn events_for(&self, aggregate_id: TransactionId) -> Result<Vec<OutboxEvent>, StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        (**self).begin().await
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        (**self).account(id).await
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        (**self).transaction(id).await
    }

    async fn entries(&self, transaction_id: TransactionId) -> Result<Vec<TransactionEntry>, StoreError> {
        (**self).entries(transaction_id).await
    }

    async fn processed_event(&self, event_id: &str) -> Result<Option<ProcessedEvent>, StoreError> {
        (**self).processed_event(event_id).await
    }
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        (**self).fetch_pending(limit).await
    }

    async fn mark_published(&self, id: OutboxEventId, at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).mark_published(id, at).await
    }

    async fn mark_failed(&self, id: OutboxEventId, error: &str) -> Result<(), StoreError> {
        (**self).mark_failed(id, error).await
    }

    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64, StoreError> {
        (**self).requeue_failed(max_attempts).await
    }

    async fn events_for(&self, aggregate_id: TransactionId) -> Result<Vec<OutboxEvent>, StoreError> {
        (**self).events_for(aggregate_id).await
    }
}
