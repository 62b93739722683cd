//! Repository contracts between the accounting engine and its stores, plus
//! the filter, pagination and sorting vocabulary shared by every backend.
//! Two flavors implement these traits: the durable postgres adapter and an
//! in-memory store with identical optimistic-locking semantics.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::domain::balance::Balance;
use crate::domain::transaction::Transaction;
use crate::error::{Error, ErrorCode, Result, ValidationError};
use crate::types::{BalanceId, TransactionId, TransactionStatus, TransactionType, Version};

pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Sortable transaction fields; only indexed columns are admitted.
pub const TRANSACTION_SORT_FIELDS: &[&str] = &[
    "portfolio_id",
    "security_id",
    "transaction_date",
    "transaction_type",
    "status",
];

/// Sortable balance fields.
pub const BALANCE_SORT_FIELDS: &[&str] = &["portfolio_id", "security_id"];

/// Offset pagination with the service-wide default page size.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }
}

/// Parses a comma-separated sort list against a field whitelist.
pub fn parse_sort(spec: &str, whitelist: &[&str]) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    for raw in spec.split(',') {
        let field = raw.trim();
        if field.is_empty() {
            continue;
        }
        if !whitelist.contains(&field) {
            return Err(Error::Validation(vec![ValidationError::new(
                "sortby",
                field,
                ErrorCode::InvalidValue,
                format!("{field} is not a sortable field"),
            )]));
        }
        fields.push(field.to_string());
    }
    Ok(fields)
}

/// Equality, IN-list and range filters over transactions. Empty filter
/// matches everything.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TransactionFilter {
    pub portfolio_id: Option<String>,
    pub portfolio_ids: Option<Vec<String>>,
    pub security_id: Option<String>,
    pub transaction_type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub statuses: Option<Vec<TransactionStatus>>,
    pub transaction_date: Option<Date>,
    pub date_from: Option<Date>,
    pub date_to: Option<Date>,
    pub min_quantity: Option<Decimal>,
    pub max_quantity: Option<Decimal>,
}

impl TransactionFilter {
    pub fn for_status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, transaction: &Transaction) -> bool {
        if let Some(portfolio_id) = &self.portfolio_id {
            if &transaction.portfolio_id != portfolio_id {
                return false;
            }
        }
        if let Some(portfolio_ids) = &self.portfolio_ids {
            if !portfolio_ids.contains(&transaction.portfolio_id) {
                return false;
            }
        }
        if let Some(security_id) = &self.security_id {
            if transaction.security_id.as_deref() != Some(security_id.as_str()) {
                return false;
            }
        }
        if let Some(transaction_type) = self.transaction_type {
            if transaction.transaction_type != transaction_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if transaction.status != status {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&transaction.status) {
                return false;
            }
        }
        if let Some(date) = self.transaction_date {
            if transaction.transaction_date != date {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if transaction.transaction_date < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if transaction.transaction_date > to {
                return false;
            }
        }
        if let Some(min) = self.min_quantity {
            if transaction.quantity < min {
                return false;
            }
        }
        if let Some(max) = self.max_quantity {
            if transaction.quantity > max {
                return false;
            }
        }
        true
    }
}

/// Equality filters over balances.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BalanceFilter {
    pub portfolio_id: Option<String>,
    pub security_id: Option<String>,
}

impl BalanceFilter {
    pub fn for_portfolio(portfolio_id: impl Into<String>) -> Self {
        Self {
            portfolio_id: Some(portfolio_id.into()),
            security_id: None,
        }
    }

    pub fn matches(&self, balance: &Balance) -> bool {
        if let Some(portfolio_id) = &self.portfolio_id {
            if &balance.portfolio_id != portfolio_id {
                return false;
            }
        }
        if let Some(security_id) = &self.security_id {
            if balance.security_id.as_deref() != Some(security_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Comparator over the whitelisted transaction sort fields; used by the
/// in-memory store, mirroring the ORDER BY the postgres adapter emits.
pub fn compare_transactions(a: &Transaction, b: &Transaction, fields: &[String]) -> Ordering {
    for field in fields {
        let ord = match field.as_str() {
            "portfolio_id" => a.portfolio_id.cmp(&b.portfolio_id),
            "security_id" => a.security_id.cmp(&b.security_id),
            "transaction_date" => a.transaction_date.cmp(&b.transaction_date),
            "transaction_type" => a
                .transaction_type
                .to_string()
                .cmp(&b.transaction_type.to_string()),
            "status" => a.status.to_string().cmp(&b.status.to_string()),
            _ => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}

pub fn compare_balances(a: &Balance, b: &Balance, fields: &[String]) -> Ordering {
    for field in fields {
        let ord = match field.as_str() {
            "portfolio_id" => a.portfolio_id.cmp(&b.portfolio_id),
            "security_id" => a.security_id.cmp(&b.security_id),
            _ => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}

/// Transaction counts rolled up by status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TransactionStats {
    pub total: u64,
    pub by_status: BTreeMap<TransactionStatus, u64>,
}

/// Balance row counts.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct BalanceStats {
    pub total: u64,
    pub portfolios: u64,
    pub security_rows: u64,
    pub cash_rows: u64,
}

/// One row of the atomic multi-balance mutation: a compare-and-set update
/// when `expected_version` is present, an insert of a fresh row otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceWrite {
    pub id: Option<BalanceId>,
    pub portfolio_id: String,
    pub security_id: Option<String>,
    pub quantity_long: Decimal,
    pub quantity_short: Decimal,
    pub expected_version: Option<Version>,
}

/// Everything the processor commits in one atomic unit: the balance rows it
/// mutates plus the status flip on the transaction row itself. Either all of
/// it lands or none of it does.
#[derive(Clone, Debug)]
pub struct ProcessingCommit {
    pub transaction_id: TransactionId,
    pub expected_transaction_version: Version,
    pub status: TransactionStatus,
    pub error_message: Option<String>,
    pub reprocessing_attempts: i32,
    pub balance_writes: Vec<BalanceWrite>,
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Persists a new transaction, assigning its id. A `source_id` already
    /// on file surfaces as [`Error::DuplicateKey`].
    async fn create_transaction(&self, transaction: Transaction) -> Result<Transaction>;

    async fn transaction_by_id(&self, id: TransactionId) -> Result<Option<Transaction>>;

    async fn transaction_by_source_id(&self, source_id: &str) -> Result<Option<Transaction>>;

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        sort: &[String],
        page: Page,
    ) -> Result<Vec<Transaction>>;

    /// Compare-and-set status update; a stale `expected_version` surfaces as
    /// [`Error::OptimisticLock`].
    async fn update_transaction_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        error_message: Option<String>,
        expected_version: Version,
    ) -> Result<Transaction>;

    async fn transaction_stats(&self) -> Result<TransactionStats>;
}

#[async_trait]
pub trait BalanceRepository: Send + Sync {
    async fn balance_by_id(&self, id: BalanceId) -> Result<Option<Balance>>;

    /// Looks up the unique row for `(portfolio, security)`; `None` security
    /// addresses the cash row.
    async fn balance_for(
        &self,
        portfolio_id: &str,
        security_id: Option<&str>,
    ) -> Result<Option<Balance>>;

    async fn cash_balance(&self, portfolio_id: &str) -> Result<Option<Balance>>;

    async fn balances_for_portfolio(&self, portfolio_id: &str) -> Result<Vec<Balance>>;

    async fn list_balances(
        &self,
        filter: &BalanceFilter,
        sort: &[String],
        page: Page,
    ) -> Result<Vec<Balance>>;

    /// Upsert keyed on `(portfolio_id, security_id)`: inserts a fresh row or
    /// overwrites quantities and bumps the version of the existing one.
    async fn upsert_balance(&self, balance: Balance) -> Result<Balance>;

    /// Compare-and-set quantity update on a single row.
    async fn update_balance_quantities(
        &self,
        id: BalanceId,
        quantity_long: Decimal,
        quantity_short: Decimal,
        expected_version: Version,
    ) -> Result<Balance>;

    /// Applies every write or none of them. Any version mismatch aborts the
    /// whole set with [`Error::OptimisticLock`]; a racing insert aborts with
    /// [`Error::DuplicateKey`].
    async fn update_balances(&self, writes: Vec<BalanceWrite>) -> Result<()>;

    async fn balance_stats(&self) -> Result<BalanceStats>;
}

/// The combined store the processor runs against.
#[async_trait]
pub trait AccountingStore: TransactionRepository + BalanceRepository {
    /// Commits balance writes and the transaction status flip as one atomic
    /// unit, so a transaction is PROC exactly when its effect is applied.
    async fn commit_processing(&self, commit: ProcessingCommit) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::{parse_sort, Page, BALANCE_SORT_FIELDS, TRANSACTION_SORT_FIELDS};

    #[test]
    fn test_that_default_page_is_fifty_rows() {
        let page = Page::default();
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, 50);
    }

    #[test]
    fn test_that_sort_whitelist_rejects_unindexed_fields() {
        let fields = parse_sort("portfolio_id, transaction_date", TRANSACTION_SORT_FIELDS).unwrap();
        assert_eq!(fields, vec!["portfolio_id", "transaction_date"]);
        assert!(parse_sort("quantity", TRANSACTION_SORT_FIELDS).is_err());
        assert!(parse_sort("status", BALANCE_SORT_FIELDS).is_err());
        assert!(parse_sort("", TRANSACTION_SORT_FIELDS).unwrap().is_empty());
    }
}
