//! In-memory ledger store.
//!
//! Intended for tests/dev. Committed state sits behind a `RwLock`; a unit of
//! work stages its writes privately and applies them in one critical section
//! on commit. Row locks are emulated with one async mutex per account and per
//! transaction, held by the unit of work until it is committed or dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use creditx_core::{AccountId, OutboxEventId, TransactionId};
use creditx_events::TransactionEvent;
use creditx_ledger::{Account, EntryLine, NewTransaction, Transaction, TransactionEntry};

use super::{
    LedgerStore, OutboxEvent, OutboxStatus, OutboxStore, ProcessedEvent, StoreError, UnitOfWork,
};

type RowLocks<K> = Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<TransactionId, Transaction>,
    entries: Vec<TransactionEntry>,
    outbox: BTreeMap<OutboxEventId, OutboxEvent>,
    processed: HashMap<String, ProcessedEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<State>,
    account_locks: RowLocks<AccountId>,
    transaction_locks: RowLocks<TransactionId>,
    transaction_seq: AtomicI64,
    entry_seq: AtomicI64,
    outbox_seq: AtomicI64,
    failing_commits: AtomicUsize,
}

impl Inner {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

fn row_lock<K>(locks: &RowLocks<K>, key: K) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError>
where
    K: std::hash::Hash + Eq,
{
    let mut locks = locks
        .lock()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
    Ok(locks.entry(key).or_default().clone())
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    inner: Arc<Inner>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite an account outside any unit of work.
    pub fn insert_account(&self, account: Account) -> Result<(), StoreError> {
        self.inner.write()?.accounts.insert(account.id, account);
        Ok(())
    }

    /// Make the next `count` commits fail after staging, as a crash would.
    pub fn fail_next_commits(&self, count: usize) {
        self.inner.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn outbox_len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read()?.outbox.len())
    }

    pub fn transaction_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read()?.transactions.len())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(InMemoryUnitOfWork::new(self.inner.clone())))
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.inner.read()?.accounts.get(&id).cloned())
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        Ok(self.inner.read()?.transactions.get(&id).cloned())
    }

    async fn entries(&self, transaction_id: TransactionId) -> Result<Vec<TransactionEntry>, StoreError> {
        Ok(self
            .inner
            .read()?
            .entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn processed_event(&self, event_id: &str) -> Result<Option<ProcessedEvent>, StoreError> {
        Ok(self.inner.read()?.processed.get(event_id).cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryLedgerStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let state = self.inner.read()?;
        let mut pending: Vec<OutboxEvent> = state
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.created_at, e.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, id: OutboxEventId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.inner.write()?;
        let row = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| StoreError::database("mark_published", format!("outbox row {id} not found")))?;
        row.status = OutboxStatus::Published;
        row.published_at = Some(at);
        row.last_error = None;
        Ok(())
    }

    async fn mark_failed(&self, id: OutboxEventId, error: &str) -> Result<(), StoreError> {
        let mut state = self.inner.write()?;
        let row = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| StoreError::database("mark_failed", format!("outbox row {id} not found")))?;
        row.status = OutboxStatus::Failed;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64, StoreError> {
        let mut state = self.inner.write()?;
        let mut requeued = 0;
        for row in state.outbox.values_mut() {
            if row.status == OutboxStatus::Failed && (row.attempts as i64) < i64::from(max_attempts) {
                row.status = OutboxStatus::Pending;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn events_for(&self, aggregate_id: TransactionId) -> Result<Vec<OutboxEvent>, StoreError> {
        Ok(self
            .inner
            .read()?
            .outbox
            .values()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }
}

/// Staged writes plus the row locks they were made under.
pub struct InMemoryUnitOfWork {
    inner: Arc<Inner>,
    account_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    transaction_guards: HashMap<TransactionId, OwnedMutexGuard<()>>,
    inserted: HashSet<TransactionId>,
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<TransactionId, Transaction>,
    entries: Vec<TransactionEntry>,
    outbox: Vec<OutboxEvent>,
    processed: Vec<ProcessedEvent>,
}

impl InMemoryUnitOfWork {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            account_guards: HashMap::new(),
            transaction_guards: HashMap::new(),
            inserted: HashSet::new(),
            accounts: BTreeMap::new(),
            transactions: BTreeMap::new(),
            entries: Vec::new(),
            outbox: Vec::new(),
            processed: Vec::new(),
        }
    }

    fn final_record<'a>(
        staged: &'a [ProcessedEvent],
        committed: &'a HashMap<String, ProcessedEvent>,
        matches: impl Fn(&ProcessedEvent) -> bool,
    ) -> bool {
        staged
            .iter()
            .chain(committed.values())
            .any(|r| r.outcome.is_final() && matches(r))
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn accounts_for_update(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        for id in &ids {
            if !self.account_guards.contains_key(id) {
                let lock = row_lock(&self.inner.account_locks, *id)?;
                let guard = lock.lock_owned().await;
                self.account_guards.insert(*id, guard);
            }
        }

        let state = self.inner.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.accounts
                    .get(id)
                    .or_else(|| state.accounts.get(id))
                    .cloned()
            })
            .collect())
    }

    async fn save_account(&mut self, account: &Account) -> Result<(), StoreError> {
        if !self.account_guards.contains_key(&account.id) {
            return Err(StoreError::database(
                "save_account",
                format!("account {} was not locked by this unit of work", account.id),
            ));
        }
        self.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn insert_transaction(&mut self, new: NewTransaction) -> Result<Transaction, StoreError> {
        let id = TransactionId::new(next_id(&self.inner.transaction_seq));
        let txn = new.with_id(id);
        self.inserted.insert(id);
        self.transactions.insert(id, txn.clone());
        Ok(txn)
    }

    async fn transaction_for_update(
        &mut self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, StoreError> {
        if !self.inserted.contains(&id) && !self.transaction_guards.contains_key(&id) {
            let lock = row_lock(&self.inner.transaction_locks, id)?;
            let guard = lock.lock_owned().await;
            self.transaction_guards.insert(id, guard);
        }
        let state = self.inner.read()?;
        Ok(self
            .transactions
            .get(&id)
            .or_else(|| state.transactions.get(&id))
            .cloned())
    }

    async fn save_transaction(&mut self, txn: &Transaction) -> Result<(), StoreError> {
        if !self.inserted.contains(&txn.id) && !self.transaction_guards.contains_key(&txn.id) {
            return Err(StoreError::database(
                "save_transaction",
                format!("transaction {} was not locked by this unit of work", txn.id),
            ));
        }
        self.transactions.insert(txn.id, txn.clone());
        Ok(())
    }

    async fn save_entries(
        &mut self,
        transaction_id: TransactionId,
        lines: &[EntryLine],
    ) -> Result<Vec<TransactionEntry>, StoreError> {
        let now = Utc::now();
        let saved: Vec<TransactionEntry> = lines
            .iter()
            .map(|line| TransactionEntry {
                entry_id: next_id(&self.inner.entry_seq),
                transaction_id,
                account_id: line.account_id,
                amount: line.amount,
                created_at: now,
            })
            .collect();
        self.entries.extend(saved.iter().cloned());
        Ok(saved)
    }

    async fn append_outbox(&mut self, event: &TransactionEvent) -> Result<OutboxEventId, StoreError> {
        let id = OutboxEventId::new(next_id(&self.inner.outbox_seq));
        self.outbox.push(OutboxEvent {
            id,
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id(),
            payload: event.payload()?,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            published_at: None,
        });
        Ok(id)
    }

    async fn is_event_processed(&mut self, event_id: &str) -> Result<bool, StoreError> {
        let state = self.inner.read()?;
        Ok(Self::final_record(&self.processed, &state.processed, |r| {
            r.event_id == event_id
        }))
    }

    async fn is_payload_processed(&mut self, payload_hash: &str) -> Result<bool, StoreError> {
        let state = self.inner.read()?;
        Ok(Self::final_record(&self.processed, &state.processed, |r| {
            r.payload_hash == payload_hash
        }))
    }

    async fn mark_processed(&mut self, record: &ProcessedEvent) -> Result<(), StoreError> {
        self.processed.retain(|r| r.event_id != record.event_id);
        self.processed.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let failing = this
            .inner
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        let mut state = this.inner.write()?;

        // Same rule as the conditional upsert in Postgres: only FAILED markers
        // may be overwritten.
        if let Some(dup) = this.processed.iter().find(|r| {
            state
                .processed
                .get(&r.event_id)
                .is_some_and(|existing| existing.outcome.is_final())
        }) {
            return Err(StoreError::DuplicateEvent(dup.event_id.clone()));
        }

        state.accounts.extend(this.accounts);
        state.transactions.extend(this.transactions);
        state.entries.extend(this.entries);
        for row in this.outbox {
            state.outbox.insert(row.id, row);
        }
        for record in this.processed {
            state.processed.insert(record.event_id.clone(), record);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
