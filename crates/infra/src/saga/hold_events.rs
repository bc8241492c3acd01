//! Hold Event Processor.
//!
//! Applies `hold.created`, `hold.expired` and `hold.voided` idempotently:
//!
//! 1. lock the transaction row (serializes concurrent deliveries),
//! 2. consult the event-id and payload-hash markers,
//! 3. apply the balance and status effects plus the outbox row,
//! 4. record the outcome marker and commit, all in one unit of work.
//!
//! A failed attempt is recorded as FAILED in a separate unit of work and the
//! error is returned; FAILED markers never short-circuit a later delivery.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use creditx_core::{AccountId, HoldId};
use creditx_events::{
    HoldCreated, HoldEvent, HoldEventKind, InboundMessage, TransactionEvent,
};
use creditx_ledger::{Transaction, TransactionStatus, authorize_hold, release_hold};
use creditx_observability::tag_transaction_id;

use crate::error::{ServiceError, ServiceResult};
use crate::store::{LedgerStore, ProcessedEvent, ProcessingOutcome, StoreError, UnitOfWork};

const HOLD_EXPIRED_REASON: &str = "Hold expired";
const HOLD_VOIDED_REASON: &str = "Hold voided";

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessOutcome {
    /// Effects applied and marked SUCCESS.
    Applied,
    /// Already handled with a final outcome; nothing done.
    Duplicate,
    /// Not applicable to the transaction's current state; marked SKIPPED.
    Skipped { reason: String },
    /// Missing, unknown or mismatched tag; nothing recorded.
    Unroutable,
}

impl ProcessOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

pub struct HoldEventProcessor<S> {
    store: S,
}

impl<S> HoldEventProcessor<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Route a raw message by its tag.
    pub async fn handle_message(&self, message: &InboundMessage) -> ServiceResult<ProcessOutcome> {
        match message.decode() {
            Ok(Some(event)) => self.process(&event).await,
            Ok(None) => {
                info!(tag = ?message.tag(), "skipping message without a hold event tag");
                Ok(ProcessOutcome::Unroutable)
            }
            Err(err) => Err(ServiceError::MalformedEvent(err.to_string())),
        }
    }

    /// Typed entry point: a message tagged with another kind is skipped.
    pub async fn handle_as(
        &self,
        expected: HoldEventKind,
        message: &InboundMessage,
    ) -> ServiceResult<ProcessOutcome> {
        match message.decode_as(expected) {
            Ok(Some(event)) => self.process(&event).await,
            Ok(None) => {
                info!(expected = %expected, tag = ?message.tag(), "skipping message with mismatched tag");
                Ok(ProcessOutcome::Unroutable)
            }
            Err(err) => Err(ServiceError::MalformedEvent(err.to_string())),
        }
    }

    pub async fn on_hold_created(&self, message: &InboundMessage) -> ServiceResult<ProcessOutcome> {
        self.handle_as(HoldEventKind::Created, message).await
    }

    pub async fn on_hold_expired(&self, message: &InboundMessage) -> ServiceResult<ProcessOutcome> {
        self.handle_as(HoldEventKind::Expired, message).await
    }

    pub async fn on_hold_voided(&self, message: &InboundMessage) -> ServiceResult<ProcessOutcome> {
        self.handle_as(HoldEventKind::Voided, message).await
    }

    #[instrument(
        skip(self, event),
        fields(
            event_type = %event.kind(),
            transaction_id = %event.transaction_id(),
            hold_id = %event.hold_id(),
        ),
        err
    )]
    pub async fn process(&self, event: &HoldEvent) -> ServiceResult<ProcessOutcome> {
        tag_transaction_id(event.transaction_id());
        let event_id = event.event_id();
        let payload_hash = event
            .payload_hash()
            .map_err(|e| ServiceError::MalformedEvent(e.to_string()))?;

        match self.apply(event, &event_id, &payload_hash).await {
            Ok(outcome) => Ok(outcome),
            Err(ServiceError::Store(StoreError::DuplicateEvent(_))) => {
                info!(%event_id, "hold event completed by a concurrent delivery");
                Ok(ProcessOutcome::Duplicate)
            }
            Err(err) => {
                error!(%event_id, error = %err, "hold event processing failed");
                if let Err(mark_err) = self.record_failure(event, &event_id, &payload_hash).await {
                    error!(%event_id, error = %mark_err, "could not record failed outcome");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        event: &HoldEvent,
        event_id: &str,
        payload_hash: &str,
    ) -> ServiceResult<ProcessOutcome> {
        let mut uow = self.store.begin().await?;
        let transaction_id = event.transaction_id();
        let locked = uow.transaction_for_update(transaction_id).await?;

        if uow.is_event_processed(event_id).await? || uow.is_payload_processed(payload_hash).await? {
            uow.rollback().await?;
            info!(%event_id, "duplicate hold event ignored");
            return Ok(ProcessOutcome::Duplicate);
        }

        let mut txn = locked.ok_or(ServiceError::TransactionNotFound(transaction_id))?;
        let now = Utc::now();
        let outcome = match event {
            HoldEvent::Created(e) => apply_created(uow.as_mut(), &mut txn, e, now).await?,
            HoldEvent::Expired(e) => {
                let release = ReleaseRequest {
                    account_id: e.account_id,
                    hold_id: e.hold_id,
                    amount: e.amount,
                    reason: HOLD_EXPIRED_REASON.to_string(),
                };
                apply_release(uow.as_mut(), &mut txn, release, now).await?
            }
            HoldEvent::Voided(e) => {
                let reason = e
                    .reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .unwrap_or(HOLD_VOIDED_REASON);
                let release = ReleaseRequest {
                    account_id: e.account_id,
                    hold_id: e.hold_id,
                    amount: e.amount,
                    reason: reason.to_string(),
                };
                apply_release(uow.as_mut(), &mut txn, release, now).await?
            }
        };

        let marker = match &outcome {
            ProcessOutcome::Skipped { reason } => {
                info!(%event_id, %reason, "hold event skipped");
                ProcessingOutcome::Skipped
            }
            _ => ProcessingOutcome::Success,
        };
        uow.mark_processed(&ProcessedEvent {
            event_id: event_id.to_string(),
            event_type: event.kind().as_str().to_string(),
            transaction_id,
            payload_hash: payload_hash.to_string(),
            outcome: marker,
            processed_at: now,
        })
        .await?;
        uow.commit().await?;

        if outcome == ProcessOutcome::Applied {
            info!(%event_id, status = %txn.status, "hold event applied");
        }
        Ok(outcome)
    }

    async fn record_failure(
        &self,
        event: &HoldEvent,
        event_id: &str,
        payload_hash: &str,
    ) -> Result<(), StoreError> {
        let mut uow = self.store.begin().await?;
        let marked = uow
            .mark_processed(&ProcessedEvent {
                event_id: event_id.to_string(),
                event_type: event.kind().as_str().to_string(),
                transaction_id: event.transaction_id(),
                payload_hash: payload_hash.to_string(),
                outcome: ProcessingOutcome::Failed,
                processed_at: Utc::now(),
            })
            .await;
        match marked {
            Ok(()) => match uow.commit().await {
                Err(StoreError::DuplicateEvent(_)) => Ok(()),
                other => other,
            },
            // A final outcome won the race; keep it.
            Err(StoreError::DuplicateEvent(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Reserve on the issuer and authorize.
async fn apply_created(
    uow: &mut dyn UnitOfWork,
    txn: &mut Transaction,
    event: &HoldCreated,
    now: DateTime<Utc>,
) -> ServiceResult<ProcessOutcome> {
    if txn.status.is_terminal() {
        return Ok(ProcessOutcome::skipped(format!("transaction is {}", txn.status)));
    }
    if let Some(stored) = txn.hold_id.filter(|h| *h != event.hold_id) {
        warn!(transaction_id = %txn.id, %stored, received = %event.hold_id, "hold.created for a different hold");
        return Ok(ProcessOutcome::skipped(format!(
            "hold {} does not match stored hold {stored}",
            event.hold_id
        )));
    }
    if event.issuer_account_id != txn.issuer_account_id {
        warn!(transaction_id = %txn.id, received = %event.issuer_account_id, "hold.created for a different issuer");
        return Ok(ProcessOutcome::skipped(format!(
            "issuer {} does not match transaction issuer {}",
            event.issuer_account_id, txn.issuer_account_id
        )));
    }
    if event.amount != txn.amount {
        warn!(transaction_id = %txn.id, event_amount = %event.amount, transaction_amount = %txn.amount, "hold amount differs from transaction amount");
    }

    let mut issuer = uow
        .account_for_update(txn.issuer_account_id)
        .await?
        .ok_or_else(|| {
            ServiceError::Inconsistent(format!(
                "transaction {} references missing issuer {}",
                txn.id, txn.issuer_account_id
            ))
        })?;

    let was_pending = txn.status == TransactionStatus::Pending;
    txn.attach_hold(event.hold_id, now)?;
    authorize_hold(txn, &mut issuer, event.amount, now)?;

    uow.save_account(&issuer).await?;
    uow.save_transaction(txn).await?;
    if was_pending {
        let authorized =
            TransactionEvent::authorized(txn).map_err(|e| ServiceError::Inconsistent(e.to_string()))?;
        uow.append_outbox(&authorized).await?;
    }
    Ok(ProcessOutcome::Applied)
}

struct ReleaseRequest {
    account_id: AccountId,
    hold_id: HoldId,
    amount: Decimal,
    reason: String,
}

/// Give reserved funds back and fail the transaction.
async fn apply_release(
    uow: &mut dyn UnitOfWork,
    txn: &mut Transaction,
    release: ReleaseRequest,
    now: DateTime<Utc>,
) -> ServiceResult<ProcessOutcome> {
    if txn.status != TransactionStatus::Authorized {
        return Ok(ProcessOutcome::skipped(format!("transaction is {}", txn.status)));
    }
    if txn.hold_id != Some(release.hold_id) {
        warn!(transaction_id = %txn.id, received = %release.hold_id, "release for a different hold");
        return Ok(ProcessOutcome::skipped(format!(
            "hold {} does not match stored hold",
            release.hold_id
        )));
    }
    if release.account_id != txn.issuer_account_id {
        warn!(transaction_id = %txn.id, received = %release.account_id, "release for a different account");
        return Ok(ProcessOutcome::skipped(format!(
            "account {} is not the issuer of transaction {}",
            release.account_id, txn.id
        )));
    }

    let mut issuer = uow
        .account_for_update(txn.issuer_account_id)
        .await?
        .ok_or_else(|| {
            ServiceError::Inconsistent(format!(
                "transaction {} references missing issuer {}",
                txn.id, txn.issuer_account_id
            ))
        })?;

    let released = release_hold(txn, &mut issuer, release.amount, now)?;
    if released.is_clamped() {
        warn!(
            transaction_id = %txn.id,
            account_id = %issuer.id,
            requested = %release.amount,
            released = %released.released,
            shortfall = %released.shortfall,
            "reserved balance below release amount, clamped at zero"
        );
    }

    uow.save_account(&issuer).await?;
    uow.save_transaction(txn).await?;
    uow.append_outbox(&TransactionEvent::failed(
        txn,
        issuer.id,
        release.amount,
        release.reason,
    ))
    .await?;
    Ok(ProcessOutcome::Applied)
}
