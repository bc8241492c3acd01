//! Transactions and their status state machine.
//!
//! ```text
//! PENDING ──hold authorized──▶ AUTHORIZED ──commit──▶ SUCCESS
//!    │                             │
//!    └──────rejected / expired / voided──────▶ FAILED
//! ```
//!
//! `SUCCESS` and `FAILED` are terminal.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use creditx_core::{AccountId, Currency, DomainError, DomainResult, HoldId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Inbound,
    Cashback,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "INBOUND",
            Self::Cashback => "CASHBACK",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INBOUND" => Ok(Self::Inbound),
            "CASHBACK" => Ok(Self::Cashback),
            other => Err(DomainError::validation(format!("unknown transaction type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Authorized,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Authorized => "AUTHORIZED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// `AUTHORIZED -> AUTHORIZED` is allowed so that an asynchronous hold
    /// confirmation can land after a synchronous one.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Authorized)
                | (Authorized, Authorized)
                | (Authorized, Success)
                | (Pending, Failed)
                | (Authorized, Failed)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "AUTHORIZED" => Ok(Self::Authorized),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!("unknown transaction status {other:?}"))),
        }
    }
}

/// One money movement between an issuer and a merchant account.
///
/// Never deleted; `status` only moves through [`Transaction::transition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub status: TransactionStatus,
    pub issuer_account_id: AccountId,
    pub merchant_account_id: AccountId,
    pub hold_id: Option<HoldId>,
    pub amount: Decimal,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn transition(&mut self, next: TransactionStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn authorize(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(TransactionStatus::Authorized, now)
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(TransactionStatus::Success, now)
    }

    pub fn fail(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(TransactionStatus::Failed, now)
    }

    /// Record the hold id returned by the Hold Service.
    ///
    /// Re-attaching the same id is a no-op; a different id is rejected.
    pub fn attach_hold(&mut self, hold_id: HoldId, now: DateTime<Utc>) -> DomainResult<()> {
        match self.hold_id {
            Some(existing) if existing == hold_id => Ok(()),
            Some(existing) => Err(DomainError::validation(format!(
                "transaction {} already carries hold {existing}, refusing {hold_id}",
                self.id
            ))),
            None => {
                self.hold_id = Some(hold_id);
                self.updated_at = now;
                Ok(())
            }
        }
    }
}

/// A transaction that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub kind: TransactionType,
    pub status: TransactionStatus,
    pub issuer_account_id: AccountId,
    pub merchant_account_id: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl NewTransaction {
    /// An inbound transaction awaiting its hold.
    pub fn inbound(
        issuer_account_id: AccountId,
        merchant_account_id: AccountId,
        amount: Decimal,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: TransactionType::Inbound,
            status: TransactionStatus::Pending,
            issuer_account_id,
            merchant_account_id,
            amount,
            currency,
            created_at: now,
        }
    }

    /// A cashback transaction; these are posted immediately.
    pub fn cashback(
        issuer_account_id: AccountId,
        merchant_account_id: AccountId,
        amount: Decimal,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: TransactionType::Cashback,
            status: TransactionStatus::Success,
            issuer_account_id,
            merchant_account_id,
            amount,
            currency,
            created_at: now,
        }
    }

    pub fn with_id(self, id: TransactionId) -> Transaction {
        Transaction {
            id,
            kind: self.kind,
            status: self.status,
            issuer_account_id: self.issuer_account_id,
            merchant_account_id: self.merchant_account_id,
            hold_id: None,
            amount: self.amount,
            currency: self.currency,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}
