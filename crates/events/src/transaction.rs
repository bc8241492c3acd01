//! Events produced by the ledger through the transactional outbox.
//!
//! Closed set of variants, one per event type, serialized with an explicit
//! `eventType` tag. The outbox stores the tag and the variant payload in
//! separate columns; the payload is what goes on the wire.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use creditx_core::{AccountId, Currency, HoldId, TransactionId};
use creditx_ledger::{Transaction, TransactionStatus, TransactionType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInitiated {
    pub transaction_id: TransactionId,
    pub issuer_account_id: AccountId,
    pub merchant_account_id: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAuthorized {
    pub transaction_id: TransactionId,
    pub hold_id: HoldId,
    pub issuer_account_id: AccountId,
    pub merchant_account_id: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFailed {
    pub transaction_id: TransactionId,
    pub hold_id: Option<HoldId>,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPosted {
    pub transaction_id: TransactionId,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub hold_id: Option<HoldId>,
    pub issuer_account_id: AccountId,
    pub merchant_account_id: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload")]
pub enum TransactionEvent {
    #[serde(rename = "transaction.initiated")]
    Initiated(TransactionInitiated),
    #[serde(rename = "transaction.authorized")]
    Authorized(TransactionAuthorized),
    #[serde(rename = "transaction.failed")]
    Failed(TransactionFailed),
    #[serde(rename = "transaction.posted")]
    Posted(TransactionPosted),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransactionEventError {
    #[error("transaction {0} has no hold id")]
    MissingHold(TransactionId),
}

impl TransactionEvent {
    pub const INITIATED: &'static str = "transaction.initiated";
    pub const AUTHORIZED: &'static str = "transaction.authorized";
    pub const FAILED: &'static str = "transaction.failed";
    pub const POSTED: &'static str = "transaction.posted";

    pub fn initiated(txn: &Transaction) -> Self {
        Self::Initiated(TransactionInitiated {
            transaction_id: txn.id,
            issuer_account_id: txn.issuer_account_id,
            merchant_account_id: txn.merchant_account_id,
            amount: txn.amount,
            currency: txn.currency.clone(),
        })
    }

    /// Requires the hold id; an authorization without a hold cannot be captured.
    pub fn authorized(txn: &Transaction) -> Result<Self, TransactionEventError> {
        let hold_id = txn.hold_id.ok_or(TransactionEventError::MissingHold(txn.id))?;
        Ok(Self::Authorized(TransactionAuthorized {
            transaction_id: txn.id,
            hold_id,
            issuer_account_id: txn.issuer_account_id,
            merchant_account_id: txn.merchant_account_id,
            amount: txn.amount,
            currency: txn.currency.clone(),
            status: txn.status,
        }))
    }

    pub fn failed(
        txn: &Transaction,
        account_id: AccountId,
        amount: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self::Failed(TransactionFailed {
            transaction_id: txn.id,
            hold_id: txn.hold_id,
            account_id,
            amount,
            currency: txn.currency.clone(),
            status: txn.status,
            reason: reason.into(),
        })
    }

    pub fn posted(txn: &Transaction, posted_at: DateTime<Utc>) -> Self {
        Self::Posted(TransactionPosted {
            transaction_id: txn.id,
            kind: txn.kind,
            hold_id: txn.hold_id,
            issuer_account_id: txn.issuer_account_id,
            merchant_account_id: txn.merchant_account_id,
            amount: txn.amount,
            currency: txn.currency.clone(),
            status: txn.status,
            created_at: txn.created_at,
            posted_at,
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Initiated(_) => Self::INITIATED,
            Self::Authorized(_) => Self::AUTHORIZED,
            Self::Failed(_) => Self::FAILED,
            Self::Posted(_) => Self::POSTED,
        }
    }

    /// The transaction the event describes (outbox aggregate id and stream key).
    pub fn aggregate_id(&self) -> TransactionId {
        match self {
            Self::Initiated(e) => e.transaction_id,
            Self::Authorized(e) => e.transaction_id,
            Self::Failed(e) => e.transaction_id,
            Self::Posted(e) => e.transaction_id,
        }
    }

    /// The untagged payload as JSON.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Initiated(e) => serde_json::to_value(e),
            Self::Authorized(e) => serde_json::to_value(e),
            Self::Failed(e) => serde_json::to_value(e),
            Self::Posted(e) => serde_json::to_value(e),
        }
    }
}
