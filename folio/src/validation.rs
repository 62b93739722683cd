//! Transaction validation: field and business-rule checks over the entity,
//! reference existence against the portfolio and security services, source-id
//! uniqueness, and processing eligibility. Errors accumulate into one list;
//! only a transient lookup failure aborts early, because it says nothing
//! about the record itself.

use std::sync::Arc;

use crate::domain::transaction::Transaction;
use crate::error::{Error, ErrorCode, Result, ValidationError};
use crate::external::{PortfolioSource, SecuritySource};
use crate::repository::TransactionRepository;
use crate::types::valid_entity_id;

pub const DEFAULT_MAX_RETRIES: i32 = 3;

pub struct TransactionValidator {
    portfolios: Arc<dyn PortfolioSource>,
    securities: Arc<dyn SecuritySource>,
    transactions: Arc<dyn TransactionRepository>,
    max_retries: i32,
}

impl TransactionValidator {
    pub fn new(
        portfolios: Arc<dyn PortfolioSource>,
        securities: Arc<dyn SecuritySource>,
        transactions: Arc<dyn TransactionRepository>,
        max_retries: i32,
    ) -> Self {
        Self {
            portfolios,
            securities,
            transactions,
            max_retries,
        }
    }

    /// Full validation of a transaction: shape, reference existence and
    /// source-id uniqueness. Transient lookup failures propagate as errors
    /// in their own right so the caller can classify the record retryable.
    pub async fn validate(&self, transaction: &Transaction) -> Result<()> {
        let mut errors = transaction.validate_shape();

        // Reference lookups only make sense for well-formed ids.
        if valid_entity_id(&transaction.portfolio_id) {
            match self.portfolios.get_portfolio(&transaction.portfolio_id).await {
                Ok(_) => {}
                Err(Error::NotFound { .. }) => {
                    errors.push(ValidationError::new(
                        "portfolio_id",
                        &transaction.portfolio_id,
                        ErrorCode::NotFound,
                        format!("portfolio {} does not exist", transaction.portfolio_id),
                    ));
                }
                Err(err) => return Err(err),
            }
        }

        if transaction.transaction_type.is_security() {
            if let Some(security_id) = transaction.security_id.as_deref() {
                if valid_entity_id(security_id) {
                    match self.securities.get_security(security_id).await {
                        Ok(_) => {}
                        Err(Error::NotFound { .. }) => {
                            errors.push(ValidationError::new(
                                "security_id",
                                security_id,
                                ErrorCode::NotFound,
                                format!("security {security_id} does not exist"),
                            ));
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        match self
            .transactions
            .transaction_by_source_id(&transaction.source_id)
            .await?
        {
            Some(existing) if existing.id != transaction.id => {
                errors.push(ValidationError::new(
                    "source_id",
                    &transaction.source_id,
                    ErrorCode::DuplicateSourceId,
                    format!(
                        "source_id {} already belongs to transaction {}",
                        transaction.source_id,
                        existing.id.unwrap_or_default()
                    ),
                ));
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    /// Validation on the processing path adds the eligibility gate: only NEW
    /// or ERROR rows with attempts left may be picked up. Eligibility
    /// failures short-circuit, the rest accumulates as usual.
    pub async fn validate_for_processing(&self, transaction: &Transaction) -> Result<()> {
        if !transaction.status.can_process() {
            return Err(Error::Validation(vec![ValidationError::new(
                "status",
                transaction.status.to_string(),
                ErrorCode::NotProcessable,
                format!("transactions in status {} cannot be processed", transaction.status),
            )]));
        }
        if transaction.reprocessing_attempts >= self.max_retries {
            return Err(Error::Validation(vec![ValidationError::new(
                "reprocessing_attempts",
                transaction.reprocessing_attempts.to_string(),
                ErrorCode::MaxRetriesExceeded,
                format!(
                    "transaction exhausted its {} reprocessing attempts",
                    self.max_retries
                ),
            )]));
        }
        self.validate(transaction).await
    }
}
