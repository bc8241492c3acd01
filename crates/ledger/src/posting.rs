//! Double-entry postings.
//!
//! A posting is a set of signed legs (negative = debit, positive = credit)
//! that sums to zero. Postings are produced only when money actually moves:
//! on commit of an inbound transaction and on cashback.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use creditx_core::{AccountId, DomainError, DomainResult, TransactionId};

use crate::account::Account;
use crate::transaction::{Transaction, TransactionStatus};

/// One leg of a posting before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryLine {
    pub account_id: AccountId,
    pub amount: Decimal,
}

/// A persisted, immutable leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    pub entry_id: i64,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    lines: Vec<EntryLine>,
}

impl Posting {
    /// Move `amount` from `from` to `to`.
    pub fn transfer(from: AccountId, to: AccountId, amount: Decimal) -> DomainResult<Self> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::validation("posting amount must be positive"));
        }
        if from == to {
            return Err(DomainError::validation("posting needs two distinct accounts"));
        }
        Ok(Self {
            lines: vec![
                EntryLine {
                    account_id: from,
                    amount: -amount,
                },
                EntryLine {
                    account_id: to,
                    amount,
                },
            ],
        })
    }

    pub fn lines(&self) -> &[EntryLine] {
        &self.lines
    }

    pub fn total(&self) -> Decimal {
        self.lines.iter().map(|l| l.amount).sum()
    }

    pub fn is_balanced(&self) -> bool {
        self.total().is_zero()
    }
}

/// Finalize an authorized inbound transaction.
///
/// Captures the amount from the issuer (reservation first), credits the
/// merchant, moves the transaction to SUCCESS and returns the posting.
pub fn settle_inbound(
    txn: &mut Transaction,
    issuer: &mut Account,
    merchant: &mut Account,
    now: DateTime<Utc>,
) -> DomainResult<Posting> {
    ensure_parties(txn, issuer, merchant)?;
    let posting = Posting::transfer(issuer.id, merchant.id, txn.amount)?;
    if !txn.status.can_transition_to(TransactionStatus::Success) {
        return Err(DomainError::InvalidTransition {
            from: txn.status.as_str(),
            to: TransactionStatus::Success.as_str(),
        });
    }
    issuer.capture(txn.amount, now)?;
    merchant.credit(txn.amount, now)?;
    txn.complete(now)?;
    Ok(posting)
}

/// Cashback: the merchant pays the issuer back immediately.
pub fn apply_cashback(
    issuer: &mut Account,
    merchant: &mut Account,
    amount: Decimal,
    now: DateTime<Utc>,
) -> DomainResult<Posting> {
    issuer.ensure_active()?;
    merchant.ensure_active()?;
    let posting = Posting::transfer(merchant.id, issuer.id, amount)?;
    merchant.debit(amount, now)?;
    issuer.credit(amount, now)?;
    Ok(posting)
}

fn ensure_parties(txn: &Transaction, issuer: &Account, merchant: &Account) -> DomainResult<()> {
    if txn.issuer_account_id != issuer.id || txn.merchant_account_id != merchant.id {
        return Err(DomainError::validation(format!(
            "accounts {}/{} do not belong to transaction {}",
            issuer.id, merchant.id, txn.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountRole;
    use crate::hold::authorize_hold;
    use crate::transaction::NewTransaction;
    use creditx_core::{Currency, OwnerId};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn accounts(issuer_balance: Decimal, merchant_balance: Decimal) -> (Account, Account) {
        let now = Utc::now();
        (
            Account::open(AccountId::new(1), OwnerId::new(1), AccountRole::Issuer, issuer_balance, now)
                .unwrap(),
            Account::open(AccountId::new(2), OwnerId::new(2), AccountRole::Merchant, merchant_balance, now)
                .unwrap(),
        )
    }

    fn inbound(amount: Decimal) -> Transaction {
        NewTransaction::inbound(AccountId::new(1), AccountId::new(2), amount, Currency::usd(), Utc::now())
            .with_id(TransactionId::new(1))
    }

    #[test]
    fn settle_after_hold_matches_the_reference_scenario() {
        let (mut issuer, mut merchant) = accounts(dec!(1000.00), dec!(500.00));
        let mut txn = inbound(dec!(250.00));
        authorize_hold(&mut txn, &mut issuer, dec!(250.00), Utc::now()).unwrap();

        let posting = settle_inbound(&mut txn, &mut issuer, &mut merchant, Utc::now()).unwrap();

        assert_eq!(issuer.available(), dec!(750.00));
        assert_eq!(issuer.reserved(), dec!(0.00));
        assert_eq!(merchant.available(), dec!(750.00));
        assert_eq!(txn.status, TransactionStatus::Success);
        assert_eq!(posting.lines().len(), 2);
        assert!(posting.is_balanced());
        assert_eq!(posting.lines()[0].amount, dec!(-250.00));
        assert_eq!(posting.lines()[0].account_id, issuer.id);
    }

    #[test]
    fn settle_rejects_pending_without_touching_accounts() {
        let (mut issuer, mut merchant) = accounts(dec!(1000.00), dec!(500.00));
        let mut txn = inbound(dec!(250.00));

        let err = settle_inbound(&mut txn, &mut issuer, &mut merchant, Utc::now()).unwrap_err();

        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(issuer.available(), dec!(1000.00));
        assert_eq!(merchant.available(), dec!(500.00));
    }

    #[test]
    fn cashback_requires_merchant_funds() {
        let (mut issuer, mut merchant) = accounts(dec!(0), dec!(10.00));
        let err = apply_cashback(&mut issuer, &mut merchant, dec!(10.01), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientBalance { .. }));

        let posting = apply_cashback(&mut issuer, &mut merchant, dec!(10.00), Utc::now()).unwrap();
        assert_eq!(issuer.available(), dec!(10.00));
        assert_eq!(merchant.available(), Decimal::ZERO);
        assert_eq!(posting.lines()[0].account_id, merchant.id);
        assert!(posting.is_balanced());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn committed_postings_always_sum_to_zero(
            cents in 1i64..10_000_000,
            extra in 0i64..10_000_000,
            reserve_first in any::<bool>()
        ) {
            let amount = Decimal::new(cents, 2);
            let (mut issuer, mut merchant) = accounts(amount + Decimal::new(extra, 2), Decimal::ZERO);
            let mut txn = inbound(amount);
            if reserve_first {
                authorize_hold(&mut txn, &mut issuer, amount, Utc::now()).unwrap();
            } else {
                txn.authorize(Utc::now()).unwrap();
            }
            let total_before = issuer.available() + issuer.reserved() + merchant.available();

            let posting = settle_inbound(&mut txn, &mut issuer, &mut merchant, Utc::now()).unwrap();

            prop_assert!(posting.is_balanced());
            prop_assert_eq!(issuer.available() + issuer.reserved() + merchant.available(), total_before);
            prop_assert!(issuer.available() >= Decimal::ZERO);
            prop_assert!(issuer.reserved() >= Decimal::ZERO);
        }
    }
}
