//! Transaction processing: validate, compute balance impact, and commit the
//! balance mutations together with the status flip as one atomic unit.
//!
//! The commit sequence per transaction:
//!
//! 1. validate_for_processing - ineligible or invalid records are marked
//!    ERROR or FATAL and never touch a balance
//! 2. load current security and cash balances (missing rows are zero)
//! 3. compute post-state via the calculator, constraint violations are FATAL
//! 4. commit balance writes + status PROC in one store transaction
//! 5. an optimistic-lock or duplicate-key conflict reloads and retries;
//!    other transient failures mark the record ERROR for reprocessing
//!
//! Reprocessing attempts increment once per reprocess pass over a record,
//! never inside the internal conflict-retry loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{invalidate_portfolio, invalidate_transaction, Cache};
use crate::calculator::BalanceCalculator;
use crate::domain::balance::Balance;
use crate::domain::transaction::Transaction;
use crate::error::{Error, ErrorCode, Result, ValidationError};
use crate::repository::{
    AccountingStore, BalanceRepository, Page, ProcessingCommit, TransactionFilter,
    TransactionRepository,
};
use crate::types::{TransactionId, TransactionStatus, TransactionType};
use crate::validation::TransactionValidator;

/// Whether a clean NotFound from reference data terminates the record or
/// leaves it re-queueable. The documented default is ERROR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NotFoundPolicy {
    #[default]
    Error,
    Fatal,
}

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Bounds both reprocessing passes per record and the internal
    /// optimistic-lock retry loop.
    pub max_retries: i32,
    pub not_found_policy: NotFoundPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            not_found_policy: NotFoundPolicy::Error,
        }
    }
}

/// Result of processing one transaction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProcessOutcome {
    pub transaction_id: Option<TransactionId>,
    pub source_id: String,
    pub transaction_type: Option<TransactionType>,
    pub status: TransactionStatus,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TransactionStatus::Proc && self.error_code.is_none()
    }
}

/// Rolled-up counts over a batch, by status, type and error code.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BatchSummary {
    pub total_requested: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub by_status: BTreeMap<TransactionStatus, usize>,
    pub by_type: BTreeMap<TransactionType, usize>,
    pub by_error_code: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BatchOutcome {
    pub results: Vec<ProcessOutcome>,
    pub summary: BatchSummary,
}

impl BatchOutcome {
    pub fn from_results(results: Vec<ProcessOutcome>) -> Self {
        let mut summary = BatchSummary {
            total_requested: results.len(),
            ..BatchSummary::default()
        };
        for outcome in &results {
            if outcome.succeeded() {
                summary.successful += 1;
            } else {
                summary.failed += 1;
            }
            *summary.by_status.entry(outcome.status).or_insert(0) += 1;
            if let Some(transaction_type) = outcome.transaction_type {
                *summary.by_type.entry(transaction_type).or_insert(0) += 1;
            }
            if let Some(code) = &outcome.error_code {
                *summary.by_error_code.entry(code.clone()).or_insert(0) += 1;
            }
        }
        if summary.total_requested > 0 {
            summary.success_rate = summary.successful as f64 / summary.total_requested as f64;
        }
        Self { results, summary }
    }
}

pub struct TransactionProcessor {
    store: Arc<dyn AccountingStore>,
    validator: Arc<TransactionValidator>,
    cache: Arc<dyn Cache>,
    config: ProcessorConfig,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<dyn AccountingStore>,
        validator: Arc<TransactionValidator>,
        cache: Arc<dyn Cache>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            validator,
            cache,
            config,
        }
    }

    /// Processes one persisted transaction through to PROC, ERROR or FATAL.
    pub async fn process(&self, transaction: Transaction) -> ProcessOutcome {
        let Some(id) = transaction.id else {
            return ProcessOutcome {
                transaction_id: None,
                source_id: transaction.source_id.clone(),
                transaction_type: Some(transaction.transaction_type),
                status: transaction.status,
                error_message: Some("transaction has not been persisted".to_string()),
                error_code: Some("INTERNAL".to_string()),
            };
        };

        // One attempt increment per reprocess pass over an ERROR record.
        let attempts = if transaction.status == TransactionStatus::Error {
            transaction.reprocessing_attempts + 1
        } else {
            transaction.reprocessing_attempts
        };

        match self.validator.validate_for_processing(&transaction).await {
            Ok(()) => {}
            Err(Error::Validation(errors)) => {
                if errors.iter().any(|e| e.code == ErrorCode::NotProcessable) {
                    // Terminal rows are left exactly as they are.
                    return ProcessOutcome {
                        transaction_id: Some(id),
                        source_id: transaction.source_id.clone(),
                        transaction_type: Some(transaction.transaction_type),
                        status: transaction.status,
                        error_message: errors.first().map(|e| e.message.clone()),
                        error_code: Some(ErrorCode::NotProcessable.to_string()),
                    };
                }
                let status = self.classify_validation(&errors);
                let message = Error::Validation(errors.clone()).to_string();
                let code = errors.first().map(|e| e.code.to_string());
                return self
                    .mark(&transaction, id, attempts, status, message, code)
                    .await;
            }
            Err(err) if err.is_retryable() => {
                return self
                    .mark(
                        &transaction,
                        id,
                        attempts,
                        TransactionStatus::Error,
                        err.to_string(),
                        Some(ErrorCode::Transient.to_string()),
                    )
                    .await;
            }
            Err(err) => {
                return self
                    .mark(
                        &transaction,
                        id,
                        attempts,
                        TransactionStatus::Fatal,
                        err.to_string(),
                        None,
                    )
                    .await;
            }
        }

        let mut current = transaction.clone();
        let mut conflict_retries = 0;
        loop {
            let balances = self.load_balances(&current).await;
            let (security_balance, cash_balance) = match balances {
                Ok(pair) => pair,
                Err(err) => {
                    return self
                        .mark(
                            &current,
                            id,
                            attempts,
                            TransactionStatus::Error,
                            err.to_string(),
                            Some(ErrorCode::Transient.to_string()),
                        )
                        .await;
                }
            };

            let calculation = match BalanceCalculator::calculate(
                &current,
                security_balance.as_ref(),
                cash_balance.as_ref(),
            ) {
                Ok(calculation) => calculation,
                Err(err) => {
                    return self
                        .mark(
                            &current,
                            id,
                            attempts,
                            TransactionStatus::Fatal,
                            err.to_string(),
                            None,
                        )
                        .await;
                }
            };

            let commit = ProcessingCommit {
                transaction_id: id,
                expected_transaction_version: current.version,
                status: TransactionStatus::Proc,
                error_message: None,
                reprocessing_attempts: attempts,
                balance_writes: calculation.writes(),
            };

            match self.store.commit_processing(commit).await {
                Ok(()) => {
                    invalidate_portfolio(
                        self.cache.as_ref(),
                        &current.portfolio_id,
                        current.security_id.as_deref(),
                        &calculation.balance_ids(),
                    )
                    .await;
                    invalidate_transaction(self.cache.as_ref(), Some(id), &current.source_id)
                        .await;
                    return ProcessOutcome {
                        transaction_id: Some(id),
                        source_id: current.source_id.clone(),
                        transaction_type: Some(current.transaction_type),
                        status: TransactionStatus::Proc,
                        error_message: None,
                        error_code: None,
                    };
                }
                Err(err @ (Error::OptimisticLock { .. } | Error::DuplicateKey(_)))
                    if conflict_retries < self.config.max_retries =>
                {
                    conflict_retries += 1;
                    log::info!(
                        "transaction {id}: balance conflict ({err}), retry {conflict_retries}"
                    );
                    // Another writer may have finished this very transaction;
                    // reload before going around again.
                    match self.store.transaction_by_id(id).await {
                        Ok(Some(reloaded)) => {
                            if !reloaded.status.can_process() {
                                return ProcessOutcome {
                                    transaction_id: Some(id),
                                    source_id: reloaded.source_id.clone(),
                                    transaction_type: Some(reloaded.transaction_type),
                                    status: reloaded.status,
                                    error_message: reloaded.error_message.clone(),
                                    error_code: None,
                                };
                            }
                            current = reloaded;
                        }
                        Ok(None) | Err(_) => {}
                    }
                }
                // A conflict that outlived the retry budget is still only a
                // lost race, so the record stays re-queueable.
                Err(err) if err.is_retryable() || matches!(err, Error::DuplicateKey(_)) => {
                    return self
                        .mark(
                            &current,
                            id,
                            attempts,
                            TransactionStatus::Error,
                            err.to_string(),
                            Some(ErrorCode::Transient.to_string()),
                        )
                        .await;
                }
                Err(err) => {
                    return self
                        .mark(
                            &current,
                            id,
                            attempts,
                            TransactionStatus::Fatal,
                            err.to_string(),
                            None,
                        )
                        .await;
                }
            }
        }
    }

    /// Sequential processing of a batch with per-record isolation.
    pub async fn process_batch(&self, transactions: Vec<Transaction>) -> BatchOutcome {
        let mut results = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            results.push(self.process(transaction).await);
        }
        BatchOutcome::from_results(results)
    }

    /// Picks up to `limit` ERROR transactions and runs them again.
    pub async fn reprocess_failed(&self, limit: u64) -> Result<BatchOutcome> {
        let filter = TransactionFilter::for_status(TransactionStatus::Error);
        let failed = self
            .store
            .list_transactions(&filter, &[], Page::new(0, limit))
            .await?;
        log::info!("reprocessing {} failed transactions", failed.len());
        Ok(self.process_batch(failed).await)
    }

    async fn load_balances(
        &self,
        transaction: &Transaction,
    ) -> Result<(Option<Balance>, Option<Balance>)> {
        let security_balance = match transaction.security_id.as_deref() {
            Some(security_id) if transaction.transaction_type.is_security() => {
                self.store
                    .balance_for(&transaction.portfolio_id, Some(security_id))
                    .await?
            }
            _ => None,
        };
        let cash_balance = self.store.cash_balance(&transaction.portfolio_id).await?;
        Ok((security_balance, cash_balance))
    }

    fn classify_validation(&self, errors: &[ValidationError]) -> TransactionStatus {
        if errors.iter().any(|e| e.code.is_structural()) {
            return TransactionStatus::Fatal;
        }
        if errors.iter().any(|e| e.code == ErrorCode::NotFound)
            && self.config.not_found_policy == NotFoundPolicy::Fatal
        {
            return TransactionStatus::Fatal;
        }
        TransactionStatus::Error
    }

    /// Records a failure outcome on the row. The write itself can race or
    /// fail transiently; the outcome still reports the classification so the
    /// batch summary reflects what happened to the record.
    async fn mark(
        &self,
        transaction: &Transaction,
        id: TransactionId,
        attempts: i32,
        status: TransactionStatus,
        message: String,
        code: Option<String>,
    ) -> ProcessOutcome {
        let commit = ProcessingCommit {
            transaction_id: id,
            expected_transaction_version: transaction.version,
            status,
            error_message: Some(message.clone()),
            reprocessing_attempts: attempts,
            balance_writes: Vec::new(),
        };
        if let Err(err) = self.store.commit_processing(commit).await {
            log::warn!("transaction {id}: could not record {status} status: {err}");
        } else {
            invalidate_transaction(self.cache.as_ref(), Some(id), &transaction.source_id).await;
        }
        ProcessOutcome {
            transaction_id: Some(id),
            source_id: transaction.source_id.clone(),
            transaction_type: Some(transaction.transaction_type),
            status,
            error_message: Some(message),
            error_code: code,
        }
    }
}
