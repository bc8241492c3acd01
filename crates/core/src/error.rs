//! Domain error model.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::id::AccountId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only. Storage and transport failures are
/// modelled by the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A balance operation would drive `available` below zero.
    #[error("insufficient balance on account {account_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        account_id: AccountId,
        available: Decimal,
        requested: Decimal,
    },

    /// A state machine transition that is not allowed from the current state.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn insufficient_balance(account_id: AccountId, available: Decimal, requested: Decimal) -> Self {
        Self::InsufficientBalance {
            account_id,
            available,
            requested,
        }
    }
}
