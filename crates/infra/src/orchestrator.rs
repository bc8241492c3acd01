//! Transaction Orchestrator.
//!
//! Opens inbound transactions, asks the Hold Service for a hold, commits
//! authorized transactions into double-entry postings and runs the hold-free
//! cashback shortcut. Every ledger mutation and its outbox row share a unit of
//! work.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument, warn};

use creditx_core::{AccountId, Currency, HoldId, TransactionId, validate_amount};
use creditx_events::TransactionEvent;
use creditx_ledger::{
    Account, AccountRole, NewTransaction, Transaction, TransactionStatus, apply_cashback,
    settle_inbound,
};
use creditx_observability::tag_transaction_id;

use crate::error::{ServiceError, ServiceResult};
use crate::hold_client::{CreateHoldRequest, HoldClient, HoldDecision, HoldReceipt};
use crate::store::{LedgerStore, UnitOfWork};

/// Input of the inbound and cashback operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub issuer_account_id: AccountId,
    pub merchant_account_id: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub hold_id: Option<HoldId>,
}

impl From<&Transaction> for TransactionReceipt {
    fn from(txn: &Transaction) -> Self {
        Self {
            transaction_id: txn.id,
            status: txn.status,
            hold_id: txn.hold_id,
        }
    }
}

pub struct TransactionOrchestrator<S, H> {
    store: S,
    hold_client: H,
}

impl<S, H> TransactionOrchestrator<S, H>
where
    S: LedgerStore,
    H: HoldClient,
{
    pub fn new(store: S, hold_client: H) -> Self {
        Self { store, hold_client }
    }

    /// Open a PENDING inbound transaction and request its hold.
    ///
    /// The transaction and its `transaction.initiated` row are committed before
    /// the Hold Service is called; a failed call leaves them in place.
    #[instrument(
        skip(self, request),
        fields(
            issuer_account_id = %request.issuer_account_id,
            merchant_account_id = %request.merchant_account_id,
            amount = %request.amount,
            transaction_id = tracing::field::Empty,
        ),
        err
    )]
    pub async fn create_inbound_transaction(
        &self,
        request: TransactionRequest,
    ) -> ServiceResult<TransactionReceipt> {
        let txn = {
            let mut uow = self.store.begin().await?;
            let (issuer, merchant) = lock_pair(
                uow.as_mut(),
                request.issuer_account_id,
                request.merchant_account_id,
            )
            .await?;
            let amount = validate_amount(request.amount)?;
            issuer.ensure_role(AccountRole::Issuer)?;
            merchant.ensure_role(AccountRole::Merchant)?;
            issuer.ensure_active()?;
            merchant.ensure_active()?;
            issuer.ensure_available(amount)?;

            let txn = uow
                .insert_transaction(NewTransaction::inbound(
                    issuer.id,
                    merchant.id,
                    amount,
                    request.currency.clone(),
                    Utc::now(),
                ))
                .await?;
            uow.append_outbox(&TransactionEvent::initiated(&txn)).await?;
            uow.commit().await?;
            txn
        };
        tag_transaction_id(txn.id);
        info!(transaction_id = %txn.id, "inbound transaction opened");

        let hold_request = CreateHoldRequest {
            transaction_id: txn.id,
            issuer_account_id: txn.issuer_account_id,
            merchant_account_id: txn.merchant_account_id,
            amount: txn.amount,
            currency: txn.currency.clone(),
        };
        let receipt = match self.hold_client.create_hold(&hold_request).await {
            Ok(receipt) => receipt,
            Err(source) => {
                warn!(
                    transaction_id = %txn.id,
                    error = %source,
                    retryable = source.is_retryable(),
                    "hold request failed, transaction left pending"
                );
                return Err(ServiceError::HoldService {
                    transaction_id: txn.id,
                    source,
                });
            }
        };

        self.apply_hold_receipt(txn.id, receipt).await
    }

    async fn apply_hold_receipt(
        &self,
        id: TransactionId,
        receipt: HoldReceipt,
    ) -> ServiceResult<TransactionReceipt> {
        let mut uow = self.store.begin().await?;
        let mut txn = uow
            .transaction_for_update(id)
            .await?
            .ok_or_else(|| ServiceError::Inconsistent(format!("transaction {id} vanished")))?;

        if let Some(existing) = txn.hold_id.filter(|h| *h != receipt.hold_id) {
            warn!(transaction_id = %id, stored = %existing, returned = %receipt.hold_id, "hold service returned a different hold id");
            return Err(ServiceError::HoldMismatch {
                id,
                expected: Some(existing),
                actual: receipt.hold_id,
            });
        }

        let now = Utc::now();
        txn.attach_hold(receipt.hold_id, now)?;

        match receipt.decision() {
            HoldDecision::Authorized if txn.status == TransactionStatus::Pending => {
                txn.authorize(now)?;
                uow.append_outbox(&TransactionEvent::authorized(&txn).map_err(|e| {
                    ServiceError::Inconsistent(e.to_string())
                })?)
                .await?;
                info!(transaction_id = %id, hold_id = %receipt.hold_id, "hold authorized synchronously");
            }
            HoldDecision::Rejected(status) if txn.status == TransactionStatus::Pending => {
                txn.fail(now)?;
                uow.append_outbox(&TransactionEvent::failed(
                    &txn,
                    txn.issuer_account_id,
                    txn.amount,
                    format!("Hold rejected: {status}"),
                ))
                .await?;
                warn!(transaction_id = %id, %status, "hold rejected");
            }
            decision => {
                info!(transaction_id = %id, status = %txn.status, ?decision, "awaiting hold event");
            }
        }

        uow.save_transaction(&txn).await?;
        uow.commit().await?;
        Ok(TransactionReceipt::from(&txn))
    }

    /// Post an AUTHORIZED transaction: capture on the issuer, credit the
    /// merchant, write both entries and emit `transaction.posted`.
    #[instrument(skip(self, id, hold_id), fields(transaction_id = %id, hold_id = %hold_id), err)]
    pub async fn commit_transaction(
        &self,
        id: TransactionId,
        hold_id: HoldId,
    ) -> ServiceResult<TransactionReceipt> {
        let mut uow = self.store.begin().await?;
        let mut txn = uow
            .transaction_for_update(id)
            .await?
            .ok_or(ServiceError::TransactionNotFound(id))?;
        tag_transaction_id(id);

        if txn.status != TransactionStatus::Authorized {
            return Err(ServiceError::NotCommittable {
                id,
                status: txn.status,
            });
        }
        if txn.hold_id != Some(hold_id) {
            return Err(ServiceError::HoldMismatch {
                id,
                expected: txn.hold_id,
                actual: hold_id,
            });
        }

        let (mut issuer, mut merchant) =
            lock_pair(uow.as_mut(), txn.issuer_account_id, txn.merchant_account_id)
                .await
                .map_err(|e| match e {
                    ServiceError::AccountNotFound(account) => ServiceError::Inconsistent(format!(
                        "transaction {id} references missing account {account}"
                    )),
                    other => other,
                })?;

        let now = Utc::now();
        let posting = settle_inbound(&mut txn, &mut issuer, &mut merchant, now)?;

        uow.save_account(&issuer).await?;
        uow.save_account(&merchant).await?;
        uow.save_entries(txn.id, posting.lines()).await?;
        uow.save_transaction(&txn).await?;
        uow.append_outbox(&TransactionEvent::posted(&txn, now)).await?;
        uow.commit().await?;

        info!(transaction_id = %id, amount = %txn.amount, "transaction posted");
        Ok(TransactionReceipt::from(&txn))
    }

    /// Merchant pays the issuer back immediately; no hold involved.
    #[instrument(
        skip(self, request),
        fields(
            issuer_account_id = %request.issuer_account_id,
            merchant_account_id = %request.merchant_account_id,
            amount = %request.amount,
        ),
        err
    )]
    pub async fn create_cashback_transaction(
        &self,
        request: TransactionRequest,
    ) -> ServiceResult<TransactionReceipt> {
        let mut uow = self.store.begin().await?;
        let (mut issuer, mut merchant) = lock_pair(
            uow.as_mut(),
            request.issuer_account_id,
            request.merchant_account_id,
        )
        .await?;
        let amount = validate_amount(request.amount)?;

        let now = Utc::now();
        let posting = apply_cashback(&mut issuer, &mut merchant, amount, now)?;
        let txn = uow
            .insert_transaction(NewTransaction::cashback(
                issuer.id,
                merchant.id,
                amount,
                request.currency.clone(),
                now,
            ))
            .await?;
        tag_transaction_id(txn.id);

        uow.save_account(&issuer).await?;
        uow.save_account(&merchant).await?;
        uow.save_entries(txn.id, posting.lines()).await?;
        uow.append_outbox(&TransactionEvent::posted(&txn, now)).await?;
        uow.commit().await?;

        info!(transaction_id = %txn.id, "cashback posted");
        Ok(TransactionReceipt::from(&txn))
    }
}

/// Lock both accounts (ascending id order) and return them as
/// `(issuer, merchant)`.
///
/// Missing accounts are reported before any other request problem.
async fn lock_pair(
    uow: &mut dyn UnitOfWork,
    issuer_id: AccountId,
    merchant_id: AccountId,
) -> ServiceResult<(Account, Account)> {
    let mut accounts = uow.accounts_for_update(&[issuer_id, merchant_id]).await?;
    let issuer = take_account(&mut accounts, issuer_id)?;
    if issuer_id == merchant_id {
        return Err(ServiceError::InvalidRequest(
            "issuer and merchant must be different accounts".to_string(),
        ));
    }
    let merchant = take_account(&mut accounts, merchant_id)?;
    Ok((issuer, merchant))
}

fn take_account(accounts: &mut Vec<Account>, id: AccountId) -> ServiceResult<Account> {
    let position = accounts
        .iter()
        .position(|a| a.id == id)
        .ok_or(ServiceError::AccountNotFound(id))?;
    Ok(accounts.swap_remove(position))
}
