use std::sync::Arc;

use anyhow::Context;

use creditx_core::{AccountId, TransactionId};
use creditx_events::{EventStream, InMemoryEventStream};
use creditx_infra::{
    HoldClient, HoldEventProcessor, HttpHoldClient, ServiceError, ServiceResult,
    TransactionOrchestrator,
    config::AppConfig,
    event_stream::{
        HoldEventConsumerConfig, RedisHoldEventConsumer, RedisHoldEventConsumerHandle,
        RedisStreamsPublisher,
    },
    outbox::{OutboxPublisher, OutboxPublisherConfig, OutboxPublisherHandle},
    store::{InMemoryLedgerStore, LedgerStore, OutboxStore, PostgresLedgerStore},
};
use creditx_ledger::{Account, Transaction, TransactionEntry};

pub type SharedStore = Arc<dyn LedgerStore>;
pub type SharedHoldClient = Arc<dyn HoldClient>;

/// Request-facing services shared by every handler.
pub struct AppServices {
    store: SharedStore,
    orchestrator: TransactionOrchestrator<SharedStore, SharedHoldClient>,
    processor: Arc<HoldEventProcessor<SharedStore>>,
}

impl AppServices {
    pub fn new(store: SharedStore, hold_client: SharedHoldClient) -> Self {
        Self {
            orchestrator: TransactionOrchestrator::new(store.clone(), hold_client),
            processor: Arc::new(HoldEventProcessor::new(store.clone())),
            store,
        }
    }

    pub fn orchestrator(&self) -> &TransactionOrchestrator<SharedStore, SharedHoldClient> {
        &self.orchestrator
    }

    pub fn processor(&self) -> &Arc<HoldEventProcessor<SharedStore>> {
        &self.processor
    }

    pub async fn account(&self, id: AccountId) -> ServiceResult<Account> {
        self.store
            .account(id)
            .await?
            .ok_or(ServiceError::AccountNotFound(id))
    }

    pub async fn transaction_with_entries(
        &self,
        id: TransactionId,
    ) -> ServiceResult<(Transaction, Vec<TransactionEntry>)> {
        let txn = self
            .store
            .transaction(id)
            .await?
            .ok_or(ServiceError::TransactionNotFound(id))?;
        let entries = self.store.entries(id).await?;
        Ok((txn, entries))
    }
}

/// Services plus the background tasks started alongside the HTTP server.
pub struct Runtime {
    services: Arc<AppServices>,
    publisher: OutboxPublisherHandle,
    consumer: Option<RedisHoldEventConsumerHandle>,
}

impl Runtime {
    /// Wire stores, clients and background tasks from configuration.
    ///
    /// Without `DATABASE_URL` the ledger lives in memory; without `REDIS_URL`
    /// outbox rows go to an in-memory stream and no hold events are consumed.
    pub async fn start(config: &AppConfig) -> anyhow::Result<Self> {
        let (store, outbox): (SharedStore, Arc<dyn OutboxStore>) = match &config.database_url {
            Some(url) => {
                let pg = PostgresLedgerStore::connect(url, config.database_max_connections)
                    .await
                    .context("failed to connect to postgres")?;
                pg.init_schema().await.context("failed to apply schema")?;
                tracing::info!("using postgres ledger store");
                let pg = Arc::new(pg);
                let store: SharedStore = pg.clone();
                let outbox: Arc<dyn OutboxStore> = pg;
                (store, outbox)
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory ledger store");
                let mem = Arc::new(InMemoryLedgerStore::new());
                let store: SharedStore = mem.clone();
                let outbox: Arc<dyn OutboxStore> = mem;
                (store, outbox)
            }
        };

        let hold_client = HttpHoldClient::new(&config.hold_service_url, config.hold_service_timeout)
            .context("failed to build hold service client")?;
        let services = Arc::new(AppServices::new(store, Arc::new(hold_client)));

        let stream: Arc<dyn EventStream> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisStreamsPublisher::connect(url, config.transaction_stream_key.clone())
                    .await
                    .context("failed to connect to redis")?,
            ),
            None => {
                tracing::warn!("REDIS_URL not set; outbox events go to an in-memory stream");
                Arc::new(InMemoryEventStream::new())
            }
        };

        let publisher = OutboxPublisher::new(
            outbox,
            stream,
            OutboxPublisherConfig::default()
                .with_interval(config.outbox_interval)
                .with_batch_size(config.outbox_batch_size)
                .with_max_attempts(config.outbox_max_attempts),
        )
        .spawn();

        let consumer = match &config.redis_url {
            Some(url) => {
                let consumer_config = HoldEventConsumerConfig::new(
                    config.hold_events_stream_key.clone(),
                    config.hold_events_group.clone(),
                )
                .with_max_deliveries(config.hold_events_max_deliveries);
                let consumer =
                    RedisHoldEventConsumer::connect(url, services.processor().clone(), consumer_config)
                        .await
                        .context("failed to start hold event consumer")?;
                Some(consumer.spawn())
            }
            None => None,
        };

        Ok(Self {
            services,
            publisher,
            consumer,
        })
    }

    pub fn services(&self) -> Arc<AppServices> {
        self.services.clone()
    }

    /// Stop the consumer first so no new ledger work starts, then drain the publisher.
    pub async fn shutdown(self) {
        if let Some(consumer) = self.consumer {
            let stats = consumer.stats();
            consumer.shutdown().await;
            tracing::info!(?stats, "hold event consumer stopped");
        }
        let stats = self.publisher.stats();
        self.publisher.shutdown().await;
        tracing::info!(?stats, "outbox publisher stopped");
    }
}
