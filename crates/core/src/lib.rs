//! `creditx-core`: shared primitives for the ledger service.
//!
//! Pure domain building blocks only (identifiers, money, errors). No IO.

pub mod error;
pub mod id;
pub mod money;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, HoldId, OutboxEventId, OwnerId, TransactionId};
pub use money::{Currency, MONEY_SCALE, validate_amount};
