//! Hold lifecycle effects on an issuer account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use creditx_core::{DomainError, DomainResult};

use crate::account::{Account, Release};
use crate::transaction::{Transaction, TransactionStatus};

/// Apply a confirmed hold: reserve `amount` on the issuer and authorize.
///
/// The transaction is checked first so that a rejected transition leaves the
/// account untouched.
pub fn authorize_hold(
    txn: &mut Transaction,
    issuer: &mut Account,
    amount: Decimal,
    now: DateTime<Utc>,
) -> DomainResult<()> {
    ensure_issuer(txn, issuer)?;
    if !txn.status.can_transition_to(TransactionStatus::Authorized) {
        return Err(DomainError::InvalidTransition {
            from: txn.status.as_str(),
            to: TransactionStatus::Authorized.as_str(),
        });
    }
    issuer.reserve(amount, now)?;
    txn.authorize(now)
}

/// Undo a hold that expired or was voided: release `amount` and fail.
///
/// `amount` comes from the inbound event and may disagree with the
/// transaction; the release clamps `reserved` at zero and reports the
/// shortfall instead of failing.
pub fn release_hold(
    txn: &mut Transaction,
    issuer: &mut Account,
    amount: Decimal,
    now: DateTime<Utc>,
) -> DomainResult<Release> {
    ensure_issuer(txn, issuer)?;
    if txn.status != TransactionStatus::Authorized {
        return Err(DomainError::InvalidTransition {
            from: txn.status.as_str(),
            to: TransactionStatus::Failed.as_str(),
        });
    }
    let release = issuer.release(amount, now)?;
    txn.fail(now)?;
    Ok(release)
}

fn ensure_issuer(txn: &Transaction, issuer: &Account) -> DomainResult<()> {
    if txn.issuer_account_id == issuer.id {
        Ok(())
    } else {
        Err(DomainError::validation(format!(
            "account {} is not the issuer of transaction {}",
            issuer.id, txn.id
        )))
    }
}
