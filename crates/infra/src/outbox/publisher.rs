//! Outbox publisher: a single periodic task shipping PENDING rows.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use creditx_events::{EventStream, StreamError, StreamMessage};

use crate::store::{OutboxEvent, OutboxStore, StoreError};

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    /// Period between cycles
    pub interval: Duration,
    /// Maximum rows per cycle
    pub batch_size: usize,
    /// FAILED rows with fewer attempts are re-queued at the start of a cycle
    pub max_attempts: u32,
    /// Upper bound for a single publish call
    pub publish_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            batch_size: 50,
            max_attempts: 5,
            publish_timeout: Duration::from_secs(5),
            name: "outbox-publisher".to_string(),
        }
    }
}

impl OutboxPublisherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub requeued: u64,
    pub published: u64,
    pub failed: u64,
}

/// Publisher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PublisherStats {
    pub cycles: u64,
    pub cycle_errors: u64,
    pub published: u64,
    pub failed: u64,
    pub requeued: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running publisher.
#[derive(Debug)]
pub struct OutboxPublisherHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<PublisherStats>>,
}

impl OutboxPublisherHandle {
    /// Request graceful shutdown and wait for the running cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.join.await {
            error!(error = %err, "outbox publisher task ended abnormally");
        }
    }

    pub fn stats(&self) -> PublisherStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<PublisherStats>) -> MutexGuard<'_, PublisherStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct OutboxPublisher<O, E> {
    store: O,
    stream: E,
    config: OutboxPublisherConfig,
}

impl<O, E> OutboxPublisher<O, E>
where
    O: OutboxStore,
    E: EventStream,
{
    pub fn new(store: O, stream: E, config: OutboxPublisherConfig) -> Self {
        Self {
            store,
            stream,
            config,
        }
    }

    pub fn config(&self) -> &OutboxPublisherConfig {
        &self.config
    }

    /// Run one cycle: re-queue retryable FAILED rows, then publish up to
    /// `batch_size` PENDING rows, oldest first.
    ///
    /// A row is marked PUBLISHED only after the stream accepted it, so a crash
    /// in between leads to a second delivery.
    pub async fn run_once(&self) -> Result<CycleReport, StoreError> {
        let mut report = CycleReport {
            requeued: self.store.requeue_failed(self.config.max_attempts).await?,
            ..CycleReport::default()
        };

        let rows = self.store.fetch_pending(self.config.batch_size).await?;
        for row in rows {
            match self.publish(&row).await {
                Ok(()) => {
                    self.store.mark_published(row.id, Utc::now()).await?;
                    report.published += 1;
                    debug!(outbox_id = %row.id, event_type = %row.event_type, "outbox row published");
                }
                Err(err) => {
                    warn!(
                        outbox_id = %row.id,
                        event_type = %row.event_type,
                        transaction_id = %row.aggregate_id,
                        attempt = row.attempts + 1,
                        error = %err,
                        "outbox publish failed"
                    );
                    self.store.mark_failed(row.id, &err.to_string()).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn publish(&self, row: &OutboxEvent) -> Result<(), StreamError> {
        let message = StreamMessage {
            key: row.aggregate_id.to_string(),
            event_type: row.event_type.clone(),
            event_id: row.id.to_string(),
            payload: row.payload.to_string(),
        };
        match tokio::time::timeout(self.config.publish_timeout, self.stream.publish(&message)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Timeout),
        }
    }

    /// Spawn the publisher as a background task. Cycles never overlap.
    pub fn spawn(self) -> OutboxPublisherHandle
    where
        O: 'static,
        E: 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::new(Mutex::new(PublisherStats::default()));
        let join = tokio::spawn(publisher_loop(self, shutdown_rx, stats.clone()));

        OutboxPublisherHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn publisher_loop<O, E>(
    publisher: OutboxPublisher<O, E>,
    mut shutdown_rx: oneshot::Receiver<()>,
    stats: Arc<Mutex<PublisherStats>>,
) where
    O: OutboxStore,
    E: EventStream,
{
    let name = publisher.config.name.clone();
    info!(publisher = %name, interval_ms = publisher.config.interval.as_millis() as u64, "outbox publisher started");
    let started = Instant::now();

    let mut ticker = tokio::time::interval(publisher.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                let result = publisher.run_once().await;
                let mut s = lock_stats(&stats);
                s.cycles += 1;
                s.uptime_secs = started.elapsed().as_secs();
                match result {
                    Ok(report) => {
                        s.published += report.published;
                        s.failed += report.failed;
                        s.requeued += report.requeued;
                    }
                    Err(err) => {
                        s.cycle_errors += 1;
                        error!(publisher = %name, error = %err, "outbox cycle failed");
                    }
                }
            }
        }
    }

    info!(publisher = %name, "outbox publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use creditx_core::{AccountId, Currency, TransactionId};
    use creditx_events::{InMemoryEventStream, TransactionEvent};
    use creditx_ledger::NewTransaction;
    use rust_decimal_macros::dec;

    use crate::store::{InMemoryLedgerStore, LedgerStore, OutboxStatus};

    async fn seed_outbox(store: &InMemoryLedgerStore, rows: i64) {
        let mut uow = store.begin().await.unwrap();
        for i in 1..=rows {
            let txn = NewTransaction::inbound(
                AccountId::new(1),
                AccountId::new(2),
                dec!(10.00),
                Currency::usd(),
                Utc::now(),
            )
            .with_id(TransactionId::new(i));
            uow.append_outbox(&TransactionEvent::initiated(&txn)).await.unwrap();
        }
        uow.commit().await.unwrap();
    }

    fn publisher(
        store: &InMemoryLedgerStore,
        stream: &Arc<InMemoryEventStream>,
        config: OutboxPublisherConfig,
    ) -> OutboxPublisher<InMemoryLedgerStore, Arc<InMemoryEventStream>> {
        OutboxPublisher::new(store.clone(), stream.clone(), config)
    }

    #[tokio::test]
    async fn publishes_pending_rows_keyed_by_transaction() {
        let store = InMemoryLedgerStore::new();
        let stream = Arc::new(InMemoryEventStream::new());
        seed_outbox(&store, 3).await;

        let report = publisher(&store, &stream, OutboxPublisherConfig::default())
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.published, 3);
        let sent = stream.published();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].key, "1");
        assert_eq!(sent[0].event_type, "transaction.initiated");
        let payload: serde_json::Value = serde_json::from_str(&sent[0].payload).unwrap();
        assert_eq!(payload["transactionId"], 1);

        let rows = store.events_for(TransactionId::new(1)).await.unwrap();
        assert_eq!(rows[0].status, OutboxStatus::Published);
        assert!(rows[0].published_at.is_some());
    }

    #[tokio::test]
    async fn batch_size_bounds_a_cycle() {
        let store = InMemoryLedgerStore::new();
        let stream = Arc::new(InMemoryEventStream::new());
        seed_outbox(&store, 5).await;

        let p = publisher(&store, &stream, OutboxPublisherConfig::default().with_batch_size(2));
        assert_eq!(p.run_once().await.unwrap().published, 2);
        assert_eq!(p.run_once().await.unwrap().published, 2);
        assert_eq!(p.run_once().await.unwrap().published, 1);
        assert_eq!(p.run_once().await.unwrap().published, 0);
    }

    #[tokio::test]
    async fn failed_rows_are_requeued_until_attempts_run_out() {
        let store = InMemoryLedgerStore::new();
        let stream = Arc::new(InMemoryEventStream::new());
        seed_outbox(&store, 1).await;
        let p = publisher(&store, &stream, OutboxPublisherConfig::default().with_max_attempts(2));

        stream.fail_next(2);
        let first = p.run_once().await.unwrap();
        assert_eq!((first.requeued, first.published, first.failed), (0, 0, 1));

        let second = p.run_once().await.unwrap();
        assert_eq!((second.requeued, second.published, second.failed), (1, 0, 1));

        // Two attempts used up: the row stays FAILED.
        let third = p.run_once().await.unwrap();
        assert_eq!(third, CycleReport::default());

        let row = &store.events_for(TransactionId::new(1)).await.unwrap()[0];
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.attempts, 2);
        assert!(row.last_error.as_deref().unwrap().contains("injected"));
        assert!(stream.published().is_empty());
    }

    struct StalledStream;

    #[async_trait]
    impl EventStream for StalledStream {
        async fn publish(&self, _message: &StreamMessage) -> Result<(), StreamError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_publish_is_cut_off_by_the_timeout() {
        let store = InMemoryLedgerStore::new();
        seed_outbox(&store, 1).await;
        let p = OutboxPublisher::new(
            store.clone(),
            StalledStream,
            OutboxPublisherConfig::default().with_publish_timeout(Duration::from_millis(20)),
        );

        let report = p.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        let row = &store.events_for(TransactionId::new(1)).await.unwrap()[0];
        assert_eq!(row.last_error.as_deref(), Some("stream publish timed out"));
    }

    #[tokio::test]
    async fn spawned_publisher_drains_and_shuts_down() {
        let store = InMemoryLedgerStore::new();
        let stream = Arc::new(InMemoryEventStream::new());
        seed_outbox(&store, 2).await;

        let handle = publisher(
            &store,
            &stream,
            OutboxPublisherConfig::default().with_interval(Duration::from_millis(10)),
        )
        .spawn();

        for _ in 0..100 {
            if handle.stats().published == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stream.published().len(), 2);
        let stats = handle.stats();
        assert!(stats.cycles >= 1);
        assert_eq!(stats.published, 2);
        handle.shutdown().await;
    }
}
