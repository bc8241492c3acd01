//! Postgres-backed ledger store.
//!
//! A unit of work wraps one `sqlx` transaction. Row locks are plain
//! `SELECT ... FOR UPDATE` and are released by `COMMIT`/`ROLLBACK`; dropping
//! the unit of work rolls back.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation on `processed_events`) | `23505` | `DuplicateEvent` |
//! | Database (other) | any | `Database` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Decode / ColumnDecode | N/A | `Corrupt` |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction as SqlxTransaction};
use tracing::{debug, instrument};

use creditx_core::{AccountId, Currency, HoldId, OutboxEventId, OwnerId, TransactionId};
use creditx_events::TransactionEvent;
use creditx_ledger::{
    Account, AccountParts, EntryLine, NewTransaction, Transaction, TransactionEntry,
};

use super::{
    LedgerStore, OutboxEvent, OutboxStore, ProcessedEvent, ProcessingOutcome, StoreError,
    UnitOfWork,
};

const SCHEMA: &str = include_str!("schema.sql");

const ACCOUNT_COLUMNS: &str = "account_id, owner_id, role, status, available, reserved, credit_limit, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "transaction_id, type, status, issuer_account_id, merchant_account_id, hold_id, amount, currency, created_at, updated_at";
const OUTBOX_COLUMNS: &str = "event_id, event_type, aggregate_id, payload, status, attempts, last_error, created_at, published_at";

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("init_schema", e))?;
        debug!("ledger schema ready");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PostgresUnitOfWork { tx }))
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("account", e))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE transaction_id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transaction", e))?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn entries(&self, transaction_id: TransactionId) -> Result<Vec<TransactionEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, transaction_id, account_id, amount, created_at
            FROM transaction_entries
            WHERE transaction_id = $1
            ORDER BY entry_id ASC
            "#,
        )
        .bind(transaction_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries", e))?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn processed_event(&self, event_id: &str) -> Result<Option<ProcessedEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT event_id, event_type, transaction_id, payload_hash, outcome, processed_at
            FROM processed_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("processed_event", e))?;
        row.as_ref().map(processed_from_row).transpose()
    }
}

#[async_trait]
impl OutboxStore for PostgresLedgerStore {
    #[instrument(skip(self), err)]
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE status = 'PENDING' ORDER BY created_at ASC, event_id ASC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending", e))?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_published(&self, id: OutboxEventId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PUBLISHED', published_at = $2, last_error = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(id.get())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(())
    }

    async fn mark_failed(&self, id: OutboxEventId, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED', attempts = attempts + 1, last_error = $2
            WHERE event_id = $1
            "#,
        )
        .bind(id.get())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;
        Ok(())
    }

    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'PENDING' WHERE status = 'FAILED' AND attempts < $1",
        )
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_failed", e))?;
        Ok(result.rows_affected())
    }

    async fn events_for(&self, aggregate_id: TransactionId) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE aggregate_id = $1 ORDER BY event_id ASC"
        ))
        .bind(aggregate_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_for", e))?;
        rows.iter().map(outbox_from_row).collect()
    }
}

pub struct PostgresUnitOfWork {
    tx: SqlxTransaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn accounts_for_update(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let ids: Vec<i64> = ids.iter().map(AccountId::get).collect();
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = ANY($1) ORDER BY account_id ASC FOR UPDATE"
        ))
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("accounts_for_update", e))?;
        rows.iter().map(account_from_row).collect()
    }

    async fn save_account(&mut self, account: &Account) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET status = $2, available = $3, reserved = $4, credit_limit = $5, updated_at = $6
            WHERE account_id = $1
            "#,
        )
        .bind(account.id.get())
        .bind(account.status.as_str())
        .bind(account.available())
        .bind(account.reserved())
        .bind(account.credit_limit)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_account", e))?;
        Ok(())
    }

    async fn insert_transaction(&mut self, new: NewTransaction) -> Result<Transaction, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO transactions
                (type, status, issuer_account_id, merchant_account_id, amount, currency, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING transaction_id
            "#,
        )
        .bind(new.kind.as_str())
        .bind(new.status.as_str())
        .bind(new.issuer_account_id.get())
        .bind(new.merchant_account_id.get())
        .bind(new.amount)
        .bind(new.currency.as_str())
        .bind(new.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transaction", e))?;

        let id: i64 = row
            .try_get("transaction_id")
            .map_err(|e| map_sqlx_error("insert_transaction", e))?;
        Ok(new.with_id(TransactionId::new(id)))
    }

    async fn transaction_for_update(
        &mut self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE transaction_id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("transaction_for_update", e))?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn save_transaction(&mut self, txn: &Transaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2, hold_id = $3, updated_at = $4
            WHERE transaction_id = $1
            "#,
        )
        .bind(txn.id.get())
        .bind(txn.status.as_str())
        .bind(txn.hold_id.map(|h| h.get()))
        .bind(txn.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_transaction", e))?;
        Ok(())
    }

    async fn save_entries(
        &mut self,
        transaction_id: TransactionId,
        lines: &[EntryLine],
    ) -> Result<Vec<TransactionEntry>, StoreError> {
        let mut saved = Vec::with_capacity(lines.len());
        for line in lines {
            let row = sqlx::query(
                r#"
                INSERT INTO transaction_entries (transaction_id, account_id, amount)
                VALUES ($1, $2, $3)
                RETURNING entry_id, transaction_id, account_id, amount, created_at
                "#,
            )
            .bind(transaction_id.get())
            .bind(line.account_id.get())
            .bind(line.amount)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("save_entries", e))?;
            saved.push(entry_from_row(&row)?);
        }
        Ok(saved)
    }

    async fn append_outbox(&mut self, event: &TransactionEvent) -> Result<OutboxEventId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO outbox_events (event_type, aggregate_id, payload, status)
            VALUES ($1, $2, $3, 'PENDING')
            RETURNING event_id
            "#,
        )
        .bind(event.event_type())
        .bind(event.aggregate_id().get())
        .bind(event.payload()?)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_outbox", e))?;

        let id: i64 = row
            .try_get("event_id")
            .map_err(|e| map_sqlx_error("append_outbox", e))?;
        Ok(OutboxEventId::new(id))
    }

    async fn is_event_processed(&mut self, event_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM processed_events WHERE event_id = $1 AND outcome <> 'FAILED') AS found",
        )
        .bind(event_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("is_event_processed", e))?;
        row.try_get("found")
            .map_err(|e| map_sqlx_error("is_event_processed", e))
    }

    async fn is_payload_processed(&mut self, payload_hash: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM processed_events WHERE payload_hash = $1 AND outcome <> 'FAILED') AS found",
        )
        .bind(payload_hash)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("is_payload_processed", e))?;
        row.try_get("found")
            .map_err(|e| map_sqlx_error("is_payload_processed", e))
    }

    async fn mark_processed(&mut self, record: &ProcessedEvent) -> Result<(), StoreError> {
        // Concurrent deliveries race on the primary key; the loser either
        // blocks until the winner commits and then matches no row, or fails
        // with a unique violation.
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, transaction_id, payload_hash, outcome, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO UPDATE
                SET payload_hash = EXCLUDED.payload_hash,
                    outcome = EXCLUDED.outcome,
                    processed_at = EXCLUDED.processed_at
                WHERE processed_events.outcome = 'FAILED'
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(record.transaction_id.get())
        .bind(&record.payload_hash)
        .bind(record.outcome.as_str())
        .bind(record.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateEvent(record.event_id.clone())
            } else {
                map_sqlx_error("mark_processed", e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateEvent(record.event_id.clone()));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::database(
            operation,
            match db_err.code() {
                Some(code) => format!("[{code}] {}", db_err.message()),
                None => db_err.message().to_string(),
            },
        ),
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::corrupt("row", format!("{operation}: {err}"))
        }
        other => StoreError::database(operation, other.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code == "23505";
        }
    }
    false
}

fn parse_column<T>(table: &'static str, value: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| StoreError::corrupt(table, e))
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let get = |e| map_sqlx_error("account_from_row", e);
    let role: String = row.try_get("role").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let parts = AccountParts {
        id: AccountId::new(row.try_get("account_id").map_err(get)?),
        owner_id: OwnerId::new(row.try_get("owner_id").map_err(get)?),
        role: parse_column("accounts", &role)?,
        status: parse_column("accounts", &status)?,
        available: row.try_get::<Decimal, _>("available").map_err(get)?,
        reserved: row.try_get::<Decimal, _>("reserved").map_err(get)?,
        credit_limit: row.try_get::<Decimal, _>("credit_limit").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    };
    Account::restore(parts).map_err(|e| StoreError::corrupt("accounts", e))
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let get = |e| map_sqlx_error("transaction_from_row", e);
    let kind: String = row.try_get("type").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let currency: String = row.try_get("currency").map_err(get)?;
    let hold_id: Option<i64> = row.try_get("hold_id").map_err(get)?;
    Ok(Transaction {
        id: TransactionId::new(row.try_get("transaction_id").map_err(get)?),
        kind: parse_column("transactions", &kind)?,
        status: parse_column("transactions", &status)?,
        issuer_account_id: AccountId::new(row.try_get("issuer_account_id").map_err(get)?),
        merchant_account_id: AccountId::new(row.try_get("merchant_account_id").map_err(get)?),
        hold_id: hold_id.map(HoldId::new),
        amount: row.try_get("amount").map_err(get)?,
        currency: parse_column::<Currency>("transactions", &currency)?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<TransactionEntry, StoreError> {
    let get = |e| map_sqlx_error("entry_from_row", e);
    Ok(TransactionEntry {
        entry_id: row.try_get("entry_id").map_err(get)?,
        transaction_id: TransactionId::new(row.try_get("transaction_id").map_err(get)?),
        account_id: AccountId::new(row.try_get("account_id").map_err(get)?),
        amount: row.try_get("amount").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    let get = |e| map_sqlx_error("outbox_from_row", e);
    let status: String = row.try_get("status").map_err(get)?;
    Ok(OutboxEvent {
        id: OutboxEventId::new(row.try_get("event_id").map_err(get)?),
        event_type: row.try_get("event_type").map_err(get)?,
        aggregate_id: TransactionId::new(row.try_get("aggregate_id").map_err(get)?),
        payload: row.try_get("payload").map_err(get)?,
        status: parse_column("outbox_events", &status)?,
        attempts: row.try_get("attempts").map_err(get)?,
        last_error: row.try_get("last_error").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        published_at: row.try_get("published_at").map_err(get)?,
    })
}

fn processed_from_row(row: &PgRow) -> Result<ProcessedEvent, StoreError> {
    let get = |e| map_sqlx_error("processed_from_row", e);
    let outcome: String = row.try_get("outcome").map_err(get)?;
    Ok(ProcessedEvent {
        event_id: row.try_get("event_id").map_err(get)?,
        event_type: row.try_get("event_type").map_err(get)?,
        transaction_id: TransactionId::new(row.try_get("transaction_id").map_err(get)?),
        payload_hash: row.try_get("payload_hash").map_err(get)?,
        outcome: parse_column::<ProcessingOutcome>("processed_events", &outcome)?,
        processed_at: row.try_get("processed_at").map_err(get)?,
    })
}

#[cfg(test)]
mod tests {
    //! Run with: `DATABASE_URL=postgres://... cargo test -p creditx-infra -- --ignored`

    use super::*;

    async fn store() -> Option<PostgresLedgerStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PostgresLedgerStore::connect(&url, 4).await.unwrap();
        store.init_schema().await.unwrap();
        Some(store)
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    fn marker(event_id: &str, outcome: ProcessingOutcome) -> ProcessedEvent {
        ProcessedEvent {
            event_id: event_id.to_string(),
            event_type: "hold.created".to_string(),
            transaction_id: TransactionId::new(1),
            payload_hash: format!("{event_id}-hash"),
            outcome,
            processed_at: Utc::now(),
        }
    }

    async fn open_issuer(store: &PostgresLedgerStore) -> AccountId {
        let row = sqlx::query(
            "INSERT INTO accounts (owner_id, role, status, available) VALUES (1, 'ISSUER', 'ACTIVE', 100) RETURNING account_id",
        )
        .fetch_one(&*store.pool)
        .await
        .unwrap();
        AccountId::new(row.get("account_id"))
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn failed_marker_is_overwritten_and_final_marker_is_not() {
        let Some(store) = store().await else { return };
        let event_id = unique("evt");

        let mut uow = store.begin().await.unwrap();
        uow.mark_processed(&marker(&event_id, ProcessingOutcome::Failed)).await.unwrap();
        uow.commit().await.unwrap();
        assert!(store.processed_event(&event_id).await.unwrap().is_some());

        let mut uow = store.begin().await.unwrap();
        assert!(uow.is_event_processed(&event_id).await.unwrap());
        uow.mark_processed(&marker(&event_id, ProcessingOutcome::Success)).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let again = uow.mark_processed(&marker(&event_id, ProcessingOutcome::Failed)).await;
        assert!(matches!(again, Err(StoreError::DuplicateEvent(id)) if id == event_id));
        uow.rollback().await.unwrap();

        let record = store.processed_event(&event_id).await.unwrap().unwrap();
        assert_eq!(record.outcome, ProcessingOutcome::Success);
        assert_eq!(record.payload_hash, format!("{event_id}-hash"));
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn locked_account_blocks_a_second_unit_of_work_until_commit() {
        let Some(store) = store().await else { return };
        let id = open_issuer(&store).await;

        let mut first = store.begin().await.unwrap();
        let mut account = first.account_for_update(id).await.unwrap().unwrap();
        account.reserve(rust_decimal_macros::dec!(40), Utc::now()).unwrap();
        first.save_account(&account).await.unwrap();

        let contender = store.clone();
        let second = tokio::spawn(async move {
            let mut uow = contender.begin().await.unwrap();
            let locked = uow.accounts_for_update(&[id]).await.unwrap();
            uow.rollback().await.unwrap();
            locked
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.is_finished(), "row lock was not held");

        first.commit().await.unwrap();
        let seen = second.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].available(), rust_decimal_macros::dec!(60));
        assert_eq!(seen[0].reserved(), rust_decimal_macros::dec!(40));
    }
}
