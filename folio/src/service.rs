//! Application services behind the HTTP and file boundaries: batch create
//! and process, queries over transactions and balances, the portfolio
//! summary, and stats. This module also assembles the service container the
//! binaries start from.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cache::{get_or_set, keys, Cache, TtlTable};
use crate::config::CacheConfig;
use crate::domain::transaction::Transaction;
use crate::error::{Error, ErrorCode, Result, ValidationError};
use crate::external::{
    CachedPortfolioSource, CachedSecuritySource, PortfolioSource, SecuritySource,
};
use crate::processor::{BatchOutcome, ProcessorConfig, TransactionProcessor};
use crate::repository::{
    AccountingStore, BalanceFilter, BalanceRepository, BalanceStats, Page, TransactionFilter,
    TransactionRepository, TransactionStats,
};
use crate::types::{parse_compact_date, BalanceId, TransactionId, TransactionType};
use crate::validation::TransactionValidator;

/// Inbound transaction payload. Type and date stay raw strings so one bad
/// record yields a field error instead of failing the whole envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransactionPost {
    pub portfolio_id: String,
    #[serde(default)]
    pub security_id: Option<String>,
    pub source_id: String,
    pub transaction_type: String,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub transaction_date: String,
}

impl TransactionPost {
    /// Converts the payload into a NEW transaction, accumulating every field
    /// error on the way.
    pub fn to_transaction(&self) -> std::result::Result<Transaction, Vec<ValidationError>> {
        let mut errors = Vec::new();

        let transaction_type: Option<TransactionType> = self.transaction_type.parse().ok();
        if transaction_type.is_none() {
            errors.push(ValidationError::new(
                "transaction_type",
                &self.transaction_type,
                ErrorCode::InvalidValue,
                format!("{} is not a transaction type", self.transaction_type),
            ));
        }
        let transaction_date = parse_compact_date(&self.transaction_date);
        if transaction_date.is_none() {
            errors.push(ValidationError::new(
                "transaction_date",
                &self.transaction_date,
                ErrorCode::InvalidValue,
                format!("{} is not a YYYYMMDD date", self.transaction_date),
            ));
        }
        let (Some(transaction_type), Some(transaction_date)) = (transaction_type, transaction_date)
        else {
            return Err(errors);
        };

        let mut builder = Transaction::builder()
            .portfolio_id(&self.portfolio_id)
            .source_id(&self.source_id)
            .transaction_type(transaction_type)
            .quantity(self.quantity)
            .transaction_date(transaction_date);
        if let Some(security_id) = &self.security_id {
            builder = builder.security_id(security_id);
        }
        if let Some(price) = self.price {
            builder = builder.price(price);
        }
        builder.build()
    }
}

/// Per-record result of a batch create: the stored row on success, the
/// accumulated field errors or the processor's failure otherwise.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RecordResult {
    pub source_id: String,
    pub transaction: Option<Transaction>,
    pub errors: Vec<ValidationError>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl RecordResult {
    pub fn succeeded(&self) -> bool {
        self.transaction.is_some() && self.errors.is_empty() && self.error_message.is_none()
    }

    /// The first human-readable reason this record failed.
    pub fn failure_message(&self) -> Option<String> {
        self.errors
            .first()
            .map(|e| e.message.clone())
            .or_else(|| self.error_message.clone())
    }

    fn failure(source_id: String, errors: Vec<ValidationError>) -> Self {
        Self {
            source_id,
            transaction: None,
            errors,
            error_code: None,
            error_message: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CreateSummary {
    pub total_requested: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CreateOutcome {
    pub results: Vec<RecordResult>,
    pub summary: CreateSummary,
}

impl CreateOutcome {
    fn from_results(results: Vec<RecordResult>) -> Self {
        let successful = results.iter().filter(|r| r.succeeded()).count();
        let total_requested = results.len();
        let summary = CreateSummary {
            total_requested,
            successful,
            failed: total_requested - successful,
            success_rate: if total_requested > 0 {
                successful as f64 / total_requested as f64
            } else {
                0.0
            },
        };
        Self { results, summary }
    }
}

/// Position counts and cash for one portfolio.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PortfolioSummary {
    pub portfolio_id: String,
    pub portfolio_name: Option<String>,
    pub total_positions: usize,
    pub long_positions: usize,
    pub short_positions: usize,
    pub cash: Decimal,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

pub struct TransactionService {
    store: Arc<dyn AccountingStore>,
    processor: Arc<TransactionProcessor>,
    cache: Arc<dyn Cache>,
    ttls: TtlTable,
}

impl TransactionService {
    pub fn new(
        store: Arc<dyn AccountingStore>,
        processor: Arc<TransactionProcessor>,
        cache: Arc<dyn Cache>,
        ttls: TtlTable,
    ) -> Self {
        Self {
            store,
            processor,
            cache,
            ttls,
        }
    }

    /// Validates, persists and synchronously processes a batch of inbound
    /// records. A record whose `source_id` is already on file comes back as
    /// an idempotent success carrying the stored row, untouched.
    pub async fn create_transactions(&self, posts: Vec<TransactionPost>) -> CreateOutcome {
        let mut results = Vec::with_capacity(posts.len());
        for post in posts {
            results.push(self.create_one(post).await);
        }
        CreateOutcome::from_results(results)
    }

    async fn create_one(&self, post: TransactionPost) -> RecordResult {
        let source_id = post.source_id.clone();

        let transaction = match post.to_transaction() {
            Ok(transaction) => transaction,
            Err(errors) => return RecordResult::failure(source_id, errors),
        };

        // Idempotency: the same source_id returns the existing row as-is,
        // with no side effects.
        match self.store.transaction_by_source_id(&source_id).await {
            Ok(Some(existing)) => {
                return RecordResult {
                    source_id,
                    transaction: Some(existing),
                    errors: Vec::new(),
                    error_code: None,
                    error_message: None,
                };
            }
            Ok(None) => {}
            Err(err) => {
                return RecordResult {
                    source_id,
                    transaction: None,
                    errors: Vec::new(),
                    error_code: Some(ErrorCode::Transient.to_string()),
                    error_message: Some(err.to_string()),
                };
            }
        }

        let created = match self.store.create_transaction(transaction).await {
            Ok(created) => created,
            Err(Error::DuplicateKey(_)) => {
                // Lost a race to another writer with the same source_id;
                // that is still the idempotent success path.
                match self.store.transaction_by_source_id(&source_id).await {
                    Ok(Some(existing)) => {
                        return RecordResult {
                            source_id,
                            transaction: Some(existing),
                            errors: Vec::new(),
                            error_code: None,
                            error_message: None,
                        };
                    }
                    other => {
                        let message = match other {
                            Err(err) => err.to_string(),
                            _ => "duplicate source_id vanished".to_string(),
                        };
                        return RecordResult {
                            source_id,
                            transaction: None,
                            errors: Vec::new(),
                            error_code: Some(ErrorCode::Transient.to_string()),
                            error_message: Some(message),
                        };
                    }
                }
            }
            Err(err) => {
                return RecordResult {
                    source_id,
                    transaction: None,
                    errors: Vec::new(),
                    error_code: Some(ErrorCode::Transient.to_string()),
                    error_message: Some(err.to_string()),
                };
            }
        };

        let outcome = self.processor.process(created.clone()).await;
        let refreshed = self
            .store
            .transaction_by_id(outcome.transaction_id.unwrap_or_default())
            .await
            .ok()
            .flatten()
            .unwrap_or(created);

        if outcome.succeeded() {
            RecordResult {
                source_id,
                transaction: Some(refreshed),
                errors: Vec::new(),
                error_code: None,
                error_message: None,
            }
        } else {
            RecordResult {
                source_id,
                transaction: Some(refreshed),
                errors: Vec::new(),
                error_code: outcome.error_code,
                error_message: outcome.error_message,
            }
        }
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction> {
        let store = self.store.clone();
        get_or_set(
            self.cache.as_ref(),
            &self.ttls,
            &keys::transaction(id),
            || async move {
                store
                    .transaction_by_id(id)
                    .await?
                    .ok_or_else(|| Error::not_found("transaction", id.to_string()))
            },
        )
        .await
    }

    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        sort: &[String],
        page: Page,
    ) -> Result<Vec<Transaction>> {
        self.store.list_transactions(filter, sort, page).await
    }

    pub async fn transaction_stats(&self) -> Result<TransactionStats> {
        let store = self.store.clone();
        get_or_set(
            self.cache.as_ref(),
            &self.ttls,
            &keys::transaction_stats(),
            || async move { store.transaction_stats().await },
        )
        .await
    }

    pub async fn reprocess_failed(&self, limit: u64) -> Result<BatchOutcome> {
        self.processor.reprocess_failed(limit).await
    }
}

pub struct BalanceService {
    store: Arc<dyn AccountingStore>,
    portfolios: Arc<dyn PortfolioSource>,
    cache: Arc<dyn Cache>,
    ttls: TtlTable,
}

impl BalanceService {
    pub fn new(
        store: Arc<dyn AccountingStore>,
        portfolios: Arc<dyn PortfolioSource>,
        cache: Arc<dyn Cache>,
        ttls: TtlTable,
    ) -> Self {
        Self {
            store,
            portfolios,
            cache,
            ttls,
        }
    }

    pub async fn get_balance(&self, id: BalanceId) -> Result<crate::domain::balance::Balance> {
        let store = self.store.clone();
        get_or_set(
            self.cache.as_ref(),
            &self.ttls,
            &keys::balance(id),
            || async move {
                store
                    .balance_by_id(id)
                    .await?
                    .ok_or_else(|| Error::not_found("balance", id.to_string()))
            },
        )
        .await
    }

    pub async fn list_balances(
        &self,
        filter: &BalanceFilter,
        sort: &[String],
        page: Page,
    ) -> Result<Vec<crate::domain::balance::Balance>> {
        self.store.list_balances(filter, sort, page).await
    }

    pub async fn balance_stats(&self) -> Result<BalanceStats> {
        let store = self.store.clone();
        get_or_set(
            self.cache.as_ref(),
            &self.ttls,
            &keys::balance_stats(),
            || async move { store.balance_stats().await },
        )
        .await
    }

    /// Position counts, cash quantity and the latest update time for one
    /// portfolio, cached under a short TTL and dropped on any balance write
    /// in the portfolio.
    pub async fn portfolio_summary(&self, portfolio_id: &str) -> Result<PortfolioSummary> {
        let store = self.store.clone();
        let portfolios = self.portfolios.clone();
        let portfolio_id_owned = portfolio_id.to_string();
        get_or_set(
            self.cache.as_ref(),
            &self.ttls,
            &keys::portfolio_summary(portfolio_id),
            || async move {
                let balances = store.balances_for_portfolio(&portfolio_id_owned).await?;

                let mut summary = PortfolioSummary {
                    portfolio_id: portfolio_id_owned.clone(),
                    portfolio_name: None,
                    total_positions: 0,
                    long_positions: 0,
                    short_positions: 0,
                    cash: Decimal::ZERO,
                    last_updated: None,
                };
                for balance in &balances {
                    if balance.is_cash() {
                        summary.cash = balance.quantity_long;
                    } else {
                        summary.total_positions += 1;
                        if !balance.quantity_long.is_zero() {
                            summary.long_positions += 1;
                        }
                        if !balance.quantity_short.is_zero() {
                            summary.short_positions += 1;
                        }
                    }
                    if summary
                        .last_updated
                        .map_or(true, |latest| balance.last_updated > latest)
                    {
                        summary.last_updated = Some(balance.last_updated);
                    }
                }

                // The portfolio name is decoration; a reference outage must
                // not take the summary down with it.
                match portfolios.get_portfolio(&portfolio_id_owned).await {
                    Ok(record) => summary.portfolio_name = Some(record.name),
                    Err(err) => {
                        log::warn!("portfolio lookup for summary failed: {err}");
                    }
                }
                Ok(summary)
            },
        )
        .await
    }
}

/// The assembled service container: stores, caches, cached reference-data
/// sources, validator, processor and the two services, wired once at
/// startup.
pub struct Services {
    pub transactions: Arc<TransactionService>,
    pub balances: Arc<BalanceService>,
    pub processor: Arc<TransactionProcessor>,
    pub store: Arc<dyn AccountingStore>,
    pub cache: Arc<dyn Cache>,
}

impl Services {
    pub fn build<S>(
        store: Arc<S>,
        portfolios: Arc<dyn PortfolioSource>,
        securities: Arc<dyn SecuritySource>,
        cache: Arc<dyn Cache>,
        processor_config: ProcessorConfig,
        cache_config: &CacheConfig,
    ) -> Self
    where
        S: AccountingStore + 'static,
    {
        let transaction_repository: Arc<dyn crate::repository::TransactionRepository> =
            store.clone();
        let store: Arc<dyn AccountingStore> = store;
        let ttls = TtlTable::new(cache_config);
        let portfolios: Arc<dyn PortfolioSource> = Arc::new(CachedPortfolioSource::new(
            portfolios,
            cache.clone(),
            ttls.clone(),
        ));
        let securities: Arc<dyn SecuritySource> = Arc::new(CachedSecuritySource::new(
            securities,
            cache.clone(),
            ttls.clone(),
        ));

        let validator = Arc::new(TransactionValidator::new(
            portfolios.clone(),
            securities,
            transaction_repository,
            processor_config.max_retries,
        ));
        let processor = Arc::new(TransactionProcessor::new(
            store.clone(),
            validator,
            cache.clone(),
            processor_config,
        ));
        let transactions = Arc::new(TransactionService::new(
            store.clone(),
            processor.clone(),
            cache.clone(),
            ttls.clone(),
        ));
        let balances = Arc::new(BalanceService::new(
            store.clone(),
            portfolios,
            cache.clone(),
            ttls,
        ));

        Self {
            transactions,
            balances,
            processor,
            store,
            cache,
        }
    }
}

