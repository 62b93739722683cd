use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::domain::balance::Balance;
use crate::domain::transaction::Transaction;
use crate::error::{Error, Result};
use crate::repository::{
    compare_balances, compare_transactions, AccountingStore, BalanceFilter, BalanceRepository,
    BalanceStats, BalanceWrite, Page, ProcessingCommit, TransactionFilter, TransactionRepository,
    TransactionStats,
};
use crate::types::{BalanceId, TransactionId, TransactionStatus, Version};

/// In-memory store with the same unique-index and optimistic-locking
/// behavior as the postgres adapter. One mutex over the whole state gives
/// multi-row atomicity for free; no lock is ever held across an await.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    // Test hook: fail the next N processing commits with a transient error.
    commit_failures: AtomicU32,
}

#[derive(Default)]
struct Inner {
    transactions: BTreeMap<TransactionId, Transaction>,
    balances: BTreeMap<BalanceId, Balance>,
    source_index: HashMap<String, TransactionId>,
    balance_index: HashMap<(String, Option<String>), BalanceId>,
    next_transaction_id: TransactionId,
    next_balance_id: BalanceId,
}

fn balance_key(portfolio_id: &str, security_id: Option<&str>) -> (String, Option<String>) {
    let security = security_id.filter(|s| !s.is_empty()).map(str::to_string);
    (portfolio_id.to_string(), security)
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_transaction_id: 1,
                next_balance_id: 1,
                ..Inner::default()
            }),
            commit_failures: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` processing commits fail with a transient io
    /// error, for exercising the retry path in tests.
    pub fn fail_commits(&self, count: u32) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic mid-mutation; propagating the panic
        // is the only sound option for an accounting store.
        self.inner.lock().expect("memory store mutex poisoned")
    }
}

impl Inner {
    fn apply_balance_write(&mut self, write: &BalanceWrite) -> Result<()> {
        match write.expected_version {
            Some(expected) => {
                let id = write.id.ok_or_else(|| {
                    Error::Internal("balance update without an id".to_string())
                })?;
                let balance = self
                    .balances
                    .get_mut(&id)
                    .ok_or_else(|| Error::not_found("balance", id.to_string()))?;
                if balance.version != expected {
                    return Err(Error::OptimisticLock {
                        entity: "balance",
                        id,
                    });
                }
                balance.quantity_long = write.quantity_long;
                balance.quantity_short = write.quantity_short;
                balance.version += 1;
                balance.last_updated = OffsetDateTime::now_utc();
            }
            None => {
                let key = balance_key(&write.portfolio_id, write.security_id.as_deref());
                if self.balance_index.contains_key(&key) {
                    return Err(Error::DuplicateKey(format!(
                        "balance already exists for portfolio {} security {}",
                        write.portfolio_id,
                        write.security_id.as_deref().unwrap_or("cash"),
                    )));
                }
                let id = self.next_balance_id;
                self.next_balance_id += 1;
                let now = OffsetDateTime::now_utc();
                let balance = Balance {
                    id: Some(id),
                    portfolio_id: write.portfolio_id.clone(),
                    security_id: key.1.clone(),
                    quantity_long: write.quantity_long,
                    quantity_short: write.quantity_short,
                    version: 1,
                    created_at: now,
                    last_updated: now,
                };
                self.balance_index.insert(key, id);
                self.balances.insert(id, balance);
            }
        }
        Ok(())
    }

    /// Pre-flight for an atomic write set: every CAS must match and every
    /// insert key must be free, otherwise nothing is applied.
    fn check_balance_writes(&self, writes: &[BalanceWrite]) -> Result<()> {
        for write in writes {
            match write.expected_version {
                Some(expected) => {
                    let id = write.id.ok_or_else(|| {
                        Error::Internal("balance update without an id".to_string())
                    })?;
                    let balance = self
                        .balances
                        .get(&id)
                        .ok_or_else(|| Error::not_found("balance", id.to_string()))?;
                    if balance.version != expected {
                        return Err(Error::OptimisticLock {
                            entity: "balance",
                            id,
                        });
                    }
                }
                None => {
                    let key = balance_key(&write.portfolio_id, write.security_id.as_deref());
                    if self.balance_index.contains_key(&key) {
                        return Err(Error::DuplicateKey(format!(
                            "balance already exists for portfolio {} security {}",
                            write.portfolio_id,
                            write.security_id.as_deref().unwrap_or("cash"),
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for MemoryStore {
    async fn create_transaction(&self, mut transaction: Transaction) -> Result<Transaction> {
        let mut inner = self.lock();
        if inner.source_index.contains_key(&transaction.source_id) {
            return Err(Error::DuplicateKey(format!(
                "source_id {} already exists",
                transaction.source_id
            )));
        }
        let id = inner.next_transaction_id;
        inner.next_transaction_id += 1;
        transaction.id = Some(id);
        inner
            .source_index
            .insert(transaction.source_id.clone(), id);
        inner.transactions.insert(id, transaction.clone());
        Ok(transaction)
    }

    async fn transaction_by_id(&self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.lock().transactions.get(&id).cloned())
    }

    async fn transaction_by_source_id(&self, source_id: &str) -> Result<Option<Transaction>> {
        let inner = self.lock();
        Ok(inner
            .source_index
            .get(source_id)
            .and_then(|id| inner.transactions.get(id))
            .cloned())
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        sort: &[String],
        page: Page,
    ) -> Result<Vec<Transaction>> {
        let inner = self.lock();
        let mut rows: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        rows.sort_by(|a, b| compare_transactions(a, b, sort));
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn update_transaction_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        error_message: Option<String>,
        expected_version: Version,
    ) -> Result<Transaction> {
        let mut inner = self.lock();
        let transaction = inner
            .transactions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("transaction", id.to_string()))?;
        if transaction.version != expected_version {
            return Err(Error::OptimisticLock {
                entity: "transaction",
                id,
            });
        }
        transaction.status = status;
        transaction.error_message = error_message;
        transaction.version += 1;
        Ok(transaction.clone())
    }

    async fn transaction_stats(&self) -> Result<TransactionStats> {
        let inner = self.lock();
        let mut stats = TransactionStats::default();
        for transaction in inner.transactions.values() {
            stats.total += 1;
            *stats.by_status.entry(transaction.status).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[async_trait]
impl BalanceRepository for MemoryStore {
    async fn balance_by_id(&self, id: BalanceId) -> Result<Option<Balance>> {
        Ok(self.lock().balances.get(&id).cloned())
    }

    async fn balance_for(
        &self,
        portfolio_id: &str,
        security_id: Option<&str>,
    ) -> Result<Option<Balance>> {
        let inner = self.lock();
        let key = balance_key(portfolio_id, security_id);
        Ok(inner
            .balance_index
            .get(&key)
            .and_then(|id| inner.balances.get(id))
            .cloned())
    }

    async fn cash_balance(&self, portfolio_id: &str) -> Result<Option<Balance>> {
        self.balance_for(portfolio_id, None).await
    }

    async fn balances_for_portfolio(&self, portfolio_id: &str) -> Result<Vec<Balance>> {
        let inner = self.lock();
        Ok(inner
            .balances
            .values()
            .filter(|b| b.portfolio_id == portfolio_id)
            .cloned()
            .collect())
    }

    async fn list_balances(
        &self,
        filter: &BalanceFilter,
        sort: &[String],
        page: Page,
    ) -> Result<Vec<Balance>> {
        let inner = self.lock();
        let mut rows: Vec<Balance> = inner
            .balances
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        rows.sort_by(|a, b| compare_balances(a, b, sort));
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn upsert_balance(&self, balance: Balance) -> Result<Balance> {
        let mut inner = self.lock();
        let key = balance_key(&balance.portfolio_id, balance.security_id.as_deref());
        match inner.balance_index.get(&key).copied() {
            Some(id) => {
                let existing = inner
                    .balances
                    .get_mut(&id)
                    .ok_or_else(|| Error::Internal("balance index out of sync".to_string()))?;
                existing.quantity_long = balance.quantity_long;
                existing.quantity_short = balance.quantity_short;
                existing.version += 1;
                existing.last_updated = OffsetDateTime::now_utc();
                Ok(existing.clone())
            }
            None => {
                let id = inner.next_balance_id;
                inner.next_balance_id += 1;
                let mut stored = balance;
                stored.id = Some(id);
                stored.security_id = key.1.clone();
                stored.version = 1;
                inner.balance_index.insert(key, id);
                inner.balances.insert(id, stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update_balance_quantities(
        &self,
        id: BalanceId,
        quantity_long: Decimal,
        quantity_short: Decimal,
        expected_version: Version,
    ) -> Result<Balance> {
        let mut inner = self.lock();
        let write = BalanceWrite {
            id: Some(id),
            portfolio_id: String::new(),
            security_id: None,
            quantity_long,
            quantity_short,
            expected_version: Some(expected_version),
        };
        inner.apply_balance_write(&write)?;
        Ok(inner
            .balances
            .get(&id)
            .cloned()
            .expect("balance vanished after update"))
    }

    async fn update_balances(&self, writes: Vec<BalanceWrite>) -> Result<()> {
        let mut inner = self.lock();
        inner.check_balance_writes(&writes)?;
        for write in &writes {
            inner.apply_balance_write(write)?;
        }
        Ok(())
    }

    async fn balance_stats(&self) -> Result<BalanceStats> {
        let inner = self.lock();
        let mut stats = BalanceStats {
            total: inner.balances.len() as u64,
            ..BalanceStats::default()
        };
        let mut portfolios: Vec<&str> = Vec::new();
        for balance in inner.balances.values() {
            if balance.is_cash() {
                stats.cash_rows += 1;
            } else {
                stats.security_rows += 1;
            }
            if !portfolios.contains(&balance.portfolio_id.as_str()) {
                portfolios.push(&balance.portfolio_id);
            }
        }
        stats.portfolios = portfolios.len() as u64;
        Ok(stats)
    }
}

#[async_trait]
impl AccountingStore for MemoryStore {
    async fn commit_processing(&self, commit: ProcessingCommit) -> Result<()> {
        if self
            .commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::TransientIo(
                "injected commit failure".to_string(),
            ));
        }

        let mut inner = self.lock();

        // Validate everything before touching anything so the commit is
        // all-or-nothing under the single lock.
        inner.check_balance_writes(&commit.balance_writes)?;
        let transaction = inner
            .transactions
            .get(&commit.transaction_id)
            .ok_or_else(|| Error::not_found("transaction", commit.transaction_id.to_string()))?;
        if transaction.version != commit.expected_transaction_version {
            return Err(Error::OptimisticLock {
                entity: "transaction",
                id: commit.transaction_id,
            });
        }

        for write in &commit.balance_writes {
            inner.apply_balance_write(write)?;
        }
        let transaction = inner
            .transactions
            .get_mut(&commit.transaction_id)
            .expect("transaction vanished during commit");
        transaction.status = commit.status;
        transaction.error_message = commit.error_message;
        transaction.reprocessing_attempts = commit.reprocessing_attempts;
        transaction.version += 1;
        Ok(())
    }
}
