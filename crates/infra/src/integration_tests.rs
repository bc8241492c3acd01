//! End-to-end flows over the in-memory stores.
//!
//! Orchestrator → Hold Service (fake) → Hold Event Processor → commit, with
//! the outbox and idempotency markers checked along the way.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use creditx_core::{AccountId, Currency, HoldId, OwnerId, TransactionId};
    use creditx_events::{InboundMessage, TransactionEvent};
    use creditx_ledger::{Account, AccountRole, TransactionStatus};

    use crate::error::{ErrorKind, ServiceError};
    use crate::hold_client::{CreateHoldRequest, HoldClient, HoldClientError, HoldReceipt};
    use crate::orchestrator::{TransactionOrchestrator, TransactionRequest};
    use crate::saga::{HoldEventProcessor, ProcessOutcome};
    use crate::store::{
        InMemoryLedgerStore, LedgerStore, OutboxStore, ProcessingOutcome, StoreError,
    };

    const ISSUER: AccountId = AccountId::new(1);
    const MERCHANT: AccountId = AccountId::new(2);

    /// Hold Service stand-in. `None` status simulates a timeout.
    struct FakeHoldClient {
        status: Mutex<Option<&'static str>>,
        next_hold: AtomicI64,
        requests: Mutex<Vec<CreateHoldRequest>>,
    }

    impl FakeHoldClient {
        fn replying(status: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(Some(status)),
                next_hold: AtomicI64::new(100),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn timing_out() -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(None),
                next_hold: AtomicI64::new(100),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HoldClient for FakeHoldClient {
        async fn create_hold(&self, request: &CreateHoldRequest) -> Result<HoldReceipt, HoldClientError> {
            self.requests.lock().unwrap().push(request.clone());
            let status = *self.status.lock().unwrap();
            match status {
                Some(status) => Ok(HoldReceipt {
                    hold_id: HoldId::new(self.next_hold.fetch_add(1, Ordering::SeqCst)),
                    status: status.to_string(),
                }),
                None => Err(HoldClientError::Timeout),
            }
        }
    }

    struct Harness {
        store: InMemoryLedgerStore,
        hold_client: Arc<FakeHoldClient>,
        orchestrator: TransactionOrchestrator<InMemoryLedgerStore, Arc<FakeHoldClient>>,
        processor: HoldEventProcessor<InMemoryLedgerStore>,
    }

    fn harness(hold_client: Arc<FakeHoldClient>) -> Harness {
        let store = InMemoryLedgerStore::new();
        let now = Utc::now();
        store
            .insert_account(
                Account::open(ISSUER, OwnerId::new(10), AccountRole::Issuer, dec!(1000.00), now).unwrap(),
            )
            .unwrap();
        store
            .insert_account(
                Account::open(MERCHANT, OwnerId::new(20), AccountRole::Merchant, dec!(500.00), now).unwrap(),
            )
            .unwrap();
        Harness {
            orchestrator: TransactionOrchestrator::new(store.clone(), hold_client.clone()),
            processor: HoldEventProcessor::new(store.clone()),
            store,
            hold_client,
        }
    }

    fn request(amount: Decimal) -> TransactionRequest {
        TransactionRequest {
            issuer_account_id: ISSUER,
            merchant_account_id: MERCHANT,
            amount,
            currency: Currency::usd(),
        }
    }

    fn created(txn: TransactionId, hold: i64, amount: &str) -> InboundMessage {
        let payload = json!({
            "holdId": hold,
            "transactionId": txn.get(),
            "issuerAccountId": ISSUER.get(),
            "merchantAccountId": MERCHANT.get(),
            "amount": amount,
            "currency": "USD",
            "status": "AUTHORIZED",
            "expiresAt": "2026-12-31T00:00:00Z",
        });
        InboundMessage::new(Some("hold.created".to_string()), payload.to_string())
    }

    fn expired(txn: TransactionId, hold: i64, amount: &str) -> InboundMessage {
        let payload = json!({
            "holdId": hold,
            "transactionId": txn.get(),
            "accountId": ISSUER.get(),
            "amount": amount,
            "status": "EXPIRED",
            "expiresAt": "2026-12-31T00:00:00Z",
        });
        InboundMessage::new(Some("hold.expired".to_string()), payload.to_string())
    }

    fn voided(txn: TransactionId, hold: i64, amount: &str, reason: Option<&str>) -> InboundMessage {
        let payload = json!({
            "holdId": hold,
            "transactionId": txn.get(),
            "accountId": ISSUER.get(),
            "amount": amount,
            "status": "VOIDED",
            "reason": reason,
        });
        InboundMessage::new(Some("hold.voided".to_string()), payload.to_string())
    }

    async fn balances(store: &InMemoryLedgerStore, id: AccountId) -> (Decimal, Decimal) {
        let account = store.account(id).await.unwrap().unwrap();
        (account.available(), account.reserved())
    }

    async fn status(store: &InMemoryLedgerStore, id: TransactionId) -> TransactionStatus {
        store.transaction(id).await.unwrap().unwrap().status
    }

    async fn outbox_types(store: &InMemoryLedgerStore, id: TransactionId) -> Vec<String> {
        store
            .events_for(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    /// PENDING inbound transaction for `amount` with hold 100, authorized via hold.created.
    async fn authorized(h: &Harness, amount: Decimal) -> TransactionId {
        let receipt = h.orchestrator.create_inbound_transaction(request(amount)).await.unwrap();
        let outcome = h
            .processor
            .handle_message(&created(receipt.transaction_id, 100, &amount.to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied);
        receipt.transaction_id
    }

    #[tokio::test]
    async fn inbound_transaction_records_initiation_and_requests_a_hold() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let receipt = h.orchestrator.create_inbound_transaction(request(dec!(250.00))).await.unwrap();

        assert_eq!(receipt.status, TransactionStatus::Pending);
        assert_eq!(receipt.hold_id, Some(HoldId::new(100)));

        let rows = h.store.events_for(receipt.transaction_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, TransactionEvent::INITIATED);
        assert_eq!(rows[0].aggregate_id, receipt.transaction_id);
        assert_eq!(rows[0].payload["amount"], "250.00");

        let sent = h.hold_client.requests.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].transaction_id, receipt.transaction_id);
        assert_eq!(sent[0].amount, dec!(250.00));

        // Nothing is reserved before the hold is confirmed.
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1000.00), dec!(0)));
    }

    #[tokio::test]
    async fn hold_created_reserves_and_authorizes() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(250.00)).await;

        assert_eq!(balances(&h.store, ISSUER).await, (dec!(750.00), dec!(250.00)));
        assert_eq!(status(&h.store, id).await, TransactionStatus::Authorized);
        assert_eq!(
            outbox_types(&h.store, id).await,
            vec![TransactionEvent::INITIATED, TransactionEvent::AUTHORIZED]
        );

        let authorized = &h.store.events_for(id).await.unwrap()[1];
        assert_eq!(authorized.payload["holdId"], 100);
        assert_eq!(authorized.payload["status"], "AUTHORIZED");

        let marker = h
            .store
            .processed_event(&creditx_events::event_id("hold.created", id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.outcome, ProcessingOutcome::Success);
    }

    #[tokio::test]
    async fn commit_posts_a_balanced_double_entry() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(250.00)).await;

        let receipt = h.orchestrator.commit_transaction(id, HoldId::new(100)).await.unwrap();
        assert_eq!(receipt.status, TransactionStatus::Success);

        assert_eq!(balances(&h.store, ISSUER).await, (dec!(750.00), dec!(0.00)));
        assert_eq!(balances(&h.store, MERCHANT).await, (dec!(750.00), dec!(0)));
        assert_eq!(status(&h.store, id).await, TransactionStatus::Success);

        let entries = h.store.entries(id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().map(|e| e.amount).sum::<Decimal>(), Decimal::ZERO);
        assert!(entries.iter().any(|e| e.account_id == ISSUER && e.amount == dec!(-250.00)));
        assert!(entries.iter().any(|e| e.account_id == MERCHANT && e.amount == dec!(250.00)));

        let types = outbox_types(&h.store, id).await;
        assert_eq!(types.last().map(String::as_str), Some(TransactionEvent::POSTED));
    }

    #[tokio::test]
    async fn synchronous_authorization_is_followed_by_the_reservation() {
        let h = harness(FakeHoldClient::replying("AUTHORIZED"));
        let receipt = h.orchestrator.create_inbound_transaction(request(dec!(250.00))).await.unwrap();
        assert_eq!(receipt.status, TransactionStatus::Authorized);
        let id = receipt.transaction_id;

        let outcome = h.processor.handle_message(&created(id, 100, "250.00")).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(750.00), dec!(250.00)));
        // Only one authorization is announced.
        assert_eq!(
            outbox_types(&h.store, id).await,
            vec![TransactionEvent::INITIATED, TransactionEvent::AUTHORIZED]
        );

        h.orchestrator.commit_transaction(id, HoldId::new(100)).await.unwrap();
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(750.00), dec!(0.00)));
        assert_eq!(balances(&h.store, MERCHANT).await, (dec!(750.00), dec!(0)));
    }

    #[tokio::test]
    async fn committing_before_the_reservation_debits_available() {
        let h = harness(FakeHoldClient::replying("AUTHORIZED"));
        let id = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap()
            .transaction_id;

        h.orchestrator.commit_transaction(id, HoldId::new(100)).await.unwrap();
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(750.00), dec!(0)));

        // The late hold.created finds a terminal transaction.
        let outcome = h.processor.handle_message(&created(id, 100, "250.00")).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(750.00), dec!(0)));
    }

    #[tokio::test]
    async fn rejected_hold_fails_the_transaction() {
        let h = harness(FakeHoldClient::replying("DECLINED"));
        let receipt = h.orchestrator.create_inbound_transaction(request(dec!(250.00))).await.unwrap();
        assert_eq!(receipt.status, TransactionStatus::Failed);

        let rows = h.store.events_for(receipt.transaction_id).await.unwrap();
        assert_eq!(rows.last().unwrap().event_type, TransactionEvent::FAILED);
        assert_eq!(rows.last().unwrap().payload["reason"], "Hold rejected: DECLINED");
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1000.00), dec!(0)));
    }

    #[tokio::test]
    async fn hold_service_failure_leaves_a_pending_transaction() {
        let h = harness(FakeHoldClient::timing_out());
        let err = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap_err();

        let ServiceError::HoldService { transaction_id, .. } = &err else {
            panic!("expected a hold service error, got {err:?}");
        };
        assert_eq!(err.kind(), ErrorKind::Dependency { retryable: true });

        let txn = h.store.transaction(*transaction_id).await.unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Pending);
        assert_eq!(txn.hold_id, None);
        assert_eq!(
            outbox_types(&h.store, *transaction_id).await,
            vec![TransactionEvent::INITIATED]
        );
    }

    #[tokio::test]
    async fn late_hold_created_adopts_the_hold_id() {
        let h = harness(FakeHoldClient::timing_out());
        let err = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap_err();
        let ServiceError::HoldService { transaction_id: id, .. } = err else {
            panic!("expected a hold service error");
        };

        let outcome = h.processor.handle_message(&created(id, 555, "250.00")).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied);
        let txn = h.store.transaction(id).await.unwrap().unwrap();
        assert_eq!(txn.hold_id, Some(HoldId::new(555)));
        assert_eq!(txn.status, TransactionStatus::Authorized);

        h.orchestrator.commit_transaction(id, HoldId::new(555)).await.unwrap();
        assert_eq!(status(&h.store, id).await, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn hold_created_for_another_hold_is_skipped() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap()
            .transaction_id;

        let outcome = h.processor.handle_message(&created(id, 999, "250.00")).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert_eq!(status(&h.store, id).await, TransactionStatus::Pending);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1000.00), dec!(0)));

        let marker = h
            .store
            .processed_event(&creditx_events::event_id("hold.created", id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.outcome, ProcessingOutcome::Skipped);
    }

    #[tokio::test]
    async fn replaying_hold_created_is_idempotent() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(250.00)).await;
        let snapshot = (
            balances(&h.store, ISSUER).await,
            status(&h.store, id).await,
            h.store.outbox_len().unwrap(),
        );

        for _ in 0..3 {
            let outcome = h.processor.handle_message(&created(id, 100, "250.00")).await.unwrap();
            assert_eq!(outcome, ProcessOutcome::Duplicate);
        }

        assert_eq!(
            (
                balances(&h.store, ISSUER).await,
                status(&h.store, id).await,
                h.store.outbox_len().unwrap(),
            ),
            snapshot
        );
    }

    #[tokio::test]
    async fn concurrent_deliveries_apply_once() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap()
            .transaction_id;

        let message = created(id, 100, "250.00");
        let (a, b) = tokio::join!(
            h.processor.handle_message(&message),
            h.processor.handle_message(&message)
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| o == &ProcessOutcome::Duplicate);
        assert_eq!(outcomes, vec![ProcessOutcome::Applied, ProcessOutcome::Duplicate]);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(750.00), dec!(250.00)));
    }

    #[tokio::test]
    async fn failed_attempt_is_recorded_and_retry_applies() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap()
            .transaction_id;
        let event_id = creditx_events::event_id("hold.created", id);

        h.store.fail_next_commits(1);
        let err = h
            .processor
            .handle_message(&created(id, 100, "250.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Store(StoreError::Unavailable(_))));

        let marker = h.store.processed_event(&event_id).await.unwrap().unwrap();
        assert_eq!(marker.outcome, ProcessingOutcome::Failed);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1000.00), dec!(0)));
        assert_eq!(status(&h.store, id).await, TransactionStatus::Pending);

        // Same event id and payload hash; FAILED does not short-circuit.
        let outcome = h.processor.handle_message(&created(id, 100, "250.00")).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(750.00), dec!(250.00)));
        let marker = h.store.processed_event(&event_id).await.unwrap().unwrap();
        assert_eq!(marker.outcome, ProcessingOutcome::Success);
    }

    #[tokio::test]
    async fn hold_created_beyond_available_fails_and_is_marked() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap()
            .transaction_id;

        let err = h
            .processor
            .handle_message(&created(id, 100, "5000.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientBalance { .. }));

        let marker = h
            .store
            .processed_event(&creditx_events::event_id("hold.created", id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.outcome, ProcessingOutcome::Failed);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1000.00), dec!(0)));
    }

    #[tokio::test]
    async fn expiry_with_an_oversized_amount_clamps_reserved() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(100.00)).await;
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(900.00), dec!(100.00)));

        let outcome = h.processor.handle_message(&expired(id, 100, "250.00")).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied);

        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1150.00), dec!(0.00)));
        assert_eq!(status(&h.store, id).await, TransactionStatus::Failed);

        let failed = h.store.events_for(id).await.unwrap().pop().unwrap();
        assert_eq!(failed.event_type, TransactionEvent::FAILED);
        assert_eq!(failed.payload["reason"], "Hold expired");
        assert_eq!(failed.payload["accountId"], ISSUER.get());
    }

    #[tokio::test]
    async fn expiry_after_success_is_skipped() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(250.00)).await;
        h.orchestrator.commit_transaction(id, HoldId::new(100)).await.unwrap();
        let before = (balances(&h.store, ISSUER).await, balances(&h.store, MERCHANT).await);

        let outcome = h.processor.handle_message(&expired(id, 100, "250.00")).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert_eq!(
            (balances(&h.store, ISSUER).await, balances(&h.store, MERCHANT).await),
            before
        );

        let marker = h
            .store
            .processed_event(&creditx_events::event_id("hold.expired", id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.outcome, ProcessingOutcome::Skipped);
    }

    #[tokio::test]
    async fn void_uses_the_supplied_reason() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(250.00)).await;

        let outcome = h
            .processor
            .handle_message(&voided(id, 100, "250.00", Some("Customer cancelled")))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1000.00), dec!(0.00)));

        let failed = h.store.events_for(id).await.unwrap().pop().unwrap();
        assert_eq!(failed.payload["reason"], "Customer cancelled");
    }

    #[tokio::test]
    async fn void_without_reason_uses_the_default() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(250.00)).await;

        h.processor
            .handle_message(&voided(id, 100, "250.00", None))
            .await
            .unwrap();
        let failed = h.store.events_for(id).await.unwrap().pop().unwrap();
        assert_eq!(failed.payload["reason"], "Hold voided");
    }

    #[tokio::test]
    async fn release_of_a_pending_transaction_is_skipped() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap()
            .transaction_id;

        let outcome = h.processor.handle_message(&expired(id, 100, "250.00")).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert_eq!(status(&h.store, id).await, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn typed_handlers_skip_mismatched_tags() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap()
            .transaction_id;

        let outcome = h.processor.on_hold_expired(&created(id, 100, "250.00")).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Unroutable);
        assert_eq!(status(&h.store, id).await, TransactionStatus::Pending);

        let unknown = InboundMessage::new(Some("hold.renewed".to_string()), "{}");
        assert_eq!(
            h.processor.handle_message(&unknown).await.unwrap(),
            ProcessOutcome::Unroutable
        );

        let outcome = h.processor.on_hold_created(&created(id, 100, "250.00")).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_validation_error() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let msg = InboundMessage::new(Some("hold.created".to_string()), r#"{"holdId":"x"}"#);
        let err = h.processor.handle_message(&msg).await.unwrap_err();
        assert!(matches!(err, ServiceError::MalformedEvent(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn commit_requires_an_authorized_transaction() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap()
            .transaction_id;

        let err = h.orchestrator.commit_transaction(id, HoldId::new(100)).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotCommittable { .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1000.00), dec!(0)));
        assert_eq!(balances(&h.store, MERCHANT).await, (dec!(500.00), dec!(0)));
        assert!(h.store.entries(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_rejects_a_second_commit() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(250.00)).await;
        h.orchestrator.commit_transaction(id, HoldId::new(100)).await.unwrap();

        let err = h.orchestrator.commit_transaction(id, HoldId::new(100)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(balances(&h.store, MERCHANT).await, (dec!(750.00), dec!(0)));
    }

    #[tokio::test]
    async fn commit_checks_the_hold_id() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let id = authorized(&h, dec!(250.00)).await;

        let err = h.orchestrator.commit_transaction(id, HoldId::new(7)).await.unwrap_err();
        assert!(matches!(err, ServiceError::HoldMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::HoldMismatch);
        assert_eq!(status(&h.store, id).await, TransactionStatus::Authorized);
    }

    #[tokio::test]
    async fn commit_of_an_unknown_transaction_is_not_found() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let err = h
            .orchestrator
            .commit_transaction(TransactionId::new(404), HoldId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_requests_perform_no_mutation() {
        let h = harness(FakeHoldClient::replying("PENDING"));

        let swapped = TransactionRequest {
            issuer_account_id: MERCHANT,
            merchant_account_id: ISSUER,
            ..request(dec!(10.00))
        };
        let cases = vec![
            (request(dec!(0)), ErrorKind::Validation),
            (request(dec!(-5.00)), ErrorKind::Validation),
            (request(dec!(1.005)), ErrorKind::Validation),
            (request(dec!(1000.01)), ErrorKind::Validation),
            (swapped, ErrorKind::Validation),
            (
                TransactionRequest {
                    merchant_account_id: AccountId::new(99),
                    ..request(dec!(10.00))
                },
                ErrorKind::NotFound,
            ),
            (
                TransactionRequest {
                    merchant_account_id: ISSUER,
                    ..request(dec!(10.00))
                },
                ErrorKind::Validation,
            ),
        ];

        for (req, kind) in cases {
            let err = h.orchestrator.create_inbound_transaction(req.clone()).await.unwrap_err();
            assert_eq!(err.kind(), kind, "request {req:?} gave {err:?}");
        }

        assert_eq!(h.store.transaction_count().unwrap(), 0);
        assert_eq!(h.store.outbox_len().unwrap(), 0);
        assert!(h.hold_client.requests.lock().unwrap().is_empty());
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1000.00), dec!(0)));
    }

    #[tokio::test]
    async fn missing_accounts_are_reported_before_amount_problems() {
        let h = harness(FakeHoldClient::replying("PENDING"));

        let unknown_issuer = TransactionRequest {
            issuer_account_id: AccountId::new(999),
            ..request(dec!(0))
        };
        let err = h
            .orchestrator
            .create_inbound_transaction(unknown_issuer.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccountNotFound(id) if id == AccountId::new(999)));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = h
            .orchestrator
            .create_cashback_transaction(unknown_issuer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let same_missing = TransactionRequest {
            issuer_account_id: AccountId::new(999),
            merchant_account_id: AccountId::new(999),
            ..request(dec!(10.00))
        };
        let err = h
            .orchestrator
            .create_inbound_transaction(same_missing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(h.store.transaction_count().unwrap(), 0);
        assert!(h.hold_client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn crash_before_commit_leaves_neither_transaction_nor_outbox_row() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        h.store.fail_next_commits(1);

        let err = h
            .orchestrator
            .create_inbound_transaction(request(dec!(250.00)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Store(_)));
        assert_eq!(h.store.transaction_count().unwrap(), 0);
        assert_eq!(h.store.outbox_len().unwrap(), 0);
        assert!(h.hold_client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cashback_posts_immediately() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let receipt = h
            .orchestrator
            .create_cashback_transaction(request(dec!(40.00)))
            .await
            .unwrap();

        assert_eq!(receipt.status, TransactionStatus::Success);
        assert_eq!(receipt.hold_id, None);
        assert_eq!(balances(&h.store, ISSUER).await, (dec!(1040.00), dec!(0)));
        assert_eq!(balances(&h.store, MERCHANT).await, (dec!(460.00), dec!(0)));

        let entries = h.store.entries(receipt.transaction_id).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.amount).sum::<Decimal>(), Decimal::ZERO);
        assert_eq!(
            outbox_types(&h.store, receipt.transaction_id).await,
            vec![TransactionEvent::POSTED]
        );
        let posted = &h.store.events_for(receipt.transaction_id).await.unwrap()[0];
        assert_eq!(posted.payload["type"], "CASHBACK");
        assert!(h.hold_client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cashback_cannot_overdraw_the_merchant() {
        let h = harness(FakeHoldClient::replying("PENDING"));
        let err = h
            .orchestrator
            .create_cashback_transaction(request(dec!(500.01)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientBalance { .. }));
        assert_eq!(h.store.transaction_count().unwrap(), 0);
        assert_eq!(balances(&h.store, MERCHANT).await, (dec!(500.00), dec!(0)));
    }
}
