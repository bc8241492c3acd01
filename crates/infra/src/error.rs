//! Service-level error taxonomy shared by the orchestrator and the hold event
//! processor.

use rust_decimal::Decimal;

use creditx_core::{AccountId, DomainError, HoldId, TransactionId};
use creditx_ledger::TransactionStatus;

use crate::hold_client::HoldClientError;
use crate::store::StoreError;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    /// Bad input: wrong role, inactive account, malformed amount, same account twice.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient balance on account {account_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        account_id: AccountId,
        available: Decimal,
        requested: Decimal,
    },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("transaction {id} is {status} and cannot be committed")]
    NotCommittable {
        id: TransactionId,
        status: TransactionStatus,
    },

    #[error("hold mismatch on transaction {id}: expected {expected:?}, got {actual}")]
    HoldMismatch {
        id: TransactionId,
        expected: Option<HoldId>,
        actual: HoldId,
    },

    /// The synchronous hold call failed. The transaction stays PENDING.
    #[error("hold service call for transaction {transaction_id} failed: {source}")]
    HoldService {
        transaction_id: TransactionId,
        #[source]
        source: HoldClientError,
    },

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Persisted state contradicts itself (e.g. a transaction pointing at a
    /// missing account).
    #[error("inconsistent ledger state: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coarse classification used by transports to pick a status code or a
/// retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    HoldMismatch,
    Dependency { retryable: bool },
    Persistence,
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) | Self::InsufficientBalance { .. } | Self::MalformedEvent(_) => {
                ErrorKind::Validation
            }
            Self::AccountNotFound(_) | Self::TransactionNotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition { .. } | Self::NotCommittable { .. } => ErrorKind::Conflict,
            Self::HoldMismatch { .. } => ErrorKind::HoldMismatch,
            Self::HoldService { source, .. } => ErrorKind::Dependency {
                retryable: source.is_retryable(),
            },
            Self::Inconsistent(_) => ErrorKind::Persistence,
            Self::Store(StoreError::Unavailable(_)) => ErrorKind::Dependency { retryable: true },
            Self::Store(_) => ErrorKind::Persistence,
        }
    }

    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Dependency { retryable } => retryable,
            ErrorKind::Persistence => true,
            _ => false,
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::InvalidRequest(msg),
            DomainError::InsufficientBalance {
                account_id,
                available,
                requested,
            } => Self::InsufficientBalance {
                account_id,
                available,
                requested,
            },
            DomainError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
        }
    }
}
