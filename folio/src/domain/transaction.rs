use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::{ErrorCode, ValidationError};
use crate::types::{
    valid_entity_id, valid_source_id, within_precision, TransactionId, TransactionStatus,
    TransactionType, Version,
};

/// A single accounting transaction. `id` is assigned by the store on
/// creation, `source_id` is the caller-provided idempotency key.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Transaction {
    pub id: Option<TransactionId>,
    pub portfolio_id: String,
    pub security_id: Option<String>,
    pub source_id: String,
    pub status: TransactionStatus,
    pub transaction_type: TransactionType,
    pub quantity: Decimal,
    pub price: Decimal,
    pub transaction_date: Date,
    pub reprocessing_attempts: i32,
    pub version: Version,
    pub error_message: Option<String>,
}

impl Transaction {
    pub fn builder() -> TransactionBuilder {
        TransactionBuilder::default()
    }

    /// Quantity times price, exact in fixed point.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Field and business-rule checks over the entity itself. Reference
    /// existence and source-id uniqueness need a store and live in the
    /// validator.
    pub fn validate_shape(&self) -> Vec<ValidationError> {
        shape_errors(
            &self.portfolio_id,
            self.security_id.as_deref(),
            &self.source_id,
            self.transaction_type,
            &self.quantity,
            &self.price,
        )
    }
}

/// Shared field and business-rule checks, used by the builder and by the
/// validator when it re-checks stored rows before processing.
pub fn shape_errors(
    portfolio_id: &str,
    security_id: Option<&str>,
    source_id: &str,
    transaction_type: TransactionType,
    quantity: &Decimal,
    price: &Decimal,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if portfolio_id.is_empty() {
        errors.push(ValidationError::new(
            "portfolio_id",
            portfolio_id,
            ErrorCode::Required,
            "portfolio_id is required",
        ));
    } else if !valid_entity_id(portfolio_id) {
        errors.push(ValidationError::new(
            "portfolio_id",
            portfolio_id,
            ErrorCode::InvalidValue,
            "portfolio_id must be a 24-character alphanumeric identifier",
        ));
    }

    if source_id.is_empty() {
        errors.push(ValidationError::new(
            "source_id",
            source_id,
            ErrorCode::Required,
            "source_id is required",
        ));
    } else if !valid_source_id(source_id) {
        errors.push(ValidationError::new(
            "source_id",
            source_id,
            ErrorCode::InvalidValue,
            "source_id must be at most 50 characters",
        ));
    }

    if quantity.is_zero() {
        errors.push(ValidationError::new(
            "quantity",
            quantity.to_string(),
            ErrorCode::InvalidValue,
            "quantity must not be zero",
        ));
    } else if !within_precision(quantity) {
        errors.push(ValidationError::new(
            "quantity",
            quantity.to_string(),
            ErrorCode::InvalidValue,
            "quantity exceeds 18.8 fixed-point precision",
        ));
    }

    if price.is_sign_negative() && !price.is_zero() {
        errors.push(ValidationError::new(
            "price",
            price.to_string(),
            ErrorCode::InvalidValue,
            "price must not be negative",
        ));
    } else if !within_precision(price) {
        errors.push(ValidationError::new(
            "price",
            price.to_string(),
            ErrorCode::InvalidValue,
            "price exceeds 18.8 fixed-point precision",
        ));
    }

    if transaction_type.is_cash() {
        if security_id.is_some_and(|s| !s.is_empty()) {
            errors.push(ValidationError::new(
                "security_id",
                security_id.unwrap_or_default(),
                ErrorCode::InvalidCashTransaction,
                "cash transactions must not reference a security",
            ));
        }
        if *price != Decimal::ONE {
            errors.push(ValidationError::new(
                "price",
                price.to_string(),
                ErrorCode::InvalidCashPrice,
                "cash transactions must have a price of 1.0",
            ));
        }
    } else {
        match security_id {
            None | Some("") => {
                errors.push(ValidationError::new(
                    "security_id",
                    "",
                    ErrorCode::InvalidSecurityTransaction,
                    "security transactions require a security_id",
                ));
            }
            Some(security) if !valid_entity_id(security) => {
                errors.push(ValidationError::new(
                    "security_id",
                    security,
                    ErrorCode::InvalidValue,
                    "security_id must be a 24-character alphanumeric identifier",
                ));
            }
            _ => {}
        }
        if price.is_zero() {
            errors.push(ValidationError::new(
                "price",
                price.to_string(),
                ErrorCode::InvalidValue,
                "security transactions require a positive price",
            ));
        }
    }

    errors
}

#[derive(Default)]
pub struct TransactionBuilder {
    portfolio_id: String,
    security_id: Option<String>,
    source_id: String,
    transaction_type: Option<TransactionType>,
    quantity: Option<Decimal>,
    price: Option<Decimal>,
    transaction_date: Option<Date>,
}

impl TransactionBuilder {
    pub fn portfolio_id(mut self, portfolio_id: impl Into<String>) -> Self {
        self.portfolio_id = portfolio_id.into();
        self
    }

    pub fn security_id(mut self, security_id: impl Into<String>) -> Self {
        let security_id = security_id.into();
        self.security_id = if security_id.is_empty() {
            None
        } else {
            Some(security_id)
        };
        self
    }

    pub fn source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }

    pub fn transaction_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }

    pub fn quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn transaction_date(mut self, transaction_date: Date) -> Self {
        self.transaction_date = Some(transaction_date);
        self
    }

    /// Builds a NEW transaction at version 1, or the accumulated list of
    /// everything wrong with the inputs.
    pub fn build(self) -> Result<Transaction, Vec<ValidationError>> {
        let mut errors = Vec::new();

        let Some(transaction_type) = self.transaction_type else {
            errors.push(ValidationError::new(
                "transaction_type",
                "",
                ErrorCode::Required,
                "transaction_type is required",
            ));
            return Err(errors);
        };

        if self.transaction_date.is_none() {
            errors.push(ValidationError::new(
                "transaction_date",
                "",
                ErrorCode::Required,
                "transaction_date is required",
            ));
        }

        // Cash transactions default to the unit price the invariant demands.
        let price = self.price.unwrap_or(if transaction_type.is_cash() {
            Decimal::ONE
        } else {
            Decimal::ZERO
        });
        let quantity = self.quantity.unwrap_or(Decimal::ZERO);

        errors.extend(shape_errors(
            &self.portfolio_id,
            self.security_id.as_deref(),
            &self.source_id,
            transaction_type,
            &quantity,
            &price,
        ));

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Transaction {
            id: None,
            portfolio_id: self.portfolio_id,
            security_id: self.security_id,
            source_id: self.source_id,
            status: TransactionStatus::New,
            transaction_type,
            quantity,
            price,
            // Checked above.
            transaction_date: self.transaction_date.unwrap(),
            reprocessing_attempts: 0,
            version: 1,
            error_message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use time::macros::date;

    use super::Transaction;
    use crate::error::ErrorCode;
    use crate::types::{TransactionStatus, TransactionType};

    fn portfolio() -> String {
        "P".repeat(24)
    }

    fn security() -> String {
        "S".repeat(24)
    }

    #[test]
    fn test_that_builder_produces_new_transaction_at_version_one() {
        let tx = Transaction::builder()
            .portfolio_id(portfolio())
            .security_id(security())
            .source_id("s-001")
            .transaction_type(TransactionType::Buy)
            .quantity(Decimal::from(100))
            .price(Decimal::from(50))
            .transaction_date(date!(2024 - 01 - 30))
            .build()
            .unwrap();

        assert_eq!(tx.status, TransactionStatus::New);
        assert_eq!(tx.version, 1);
        assert_eq!(tx.reprocessing_attempts, 0);
        assert_eq!(tx.notional(), Decimal::from(5000));
    }

    #[test]
    fn test_that_cash_transaction_defaults_to_unit_price() {
        let tx = Transaction::builder()
            .portfolio_id(portfolio())
            .source_id("s-002")
            .transaction_type(TransactionType::Dep)
            .quantity(Decimal::from(1000))
            .transaction_date(date!(2024 - 01 - 30))
            .build()
            .unwrap();

        assert_eq!(tx.price, Decimal::ONE);
        assert!(tx.security_id.is_none());
    }

    #[test]
    fn test_that_cash_transaction_rejects_security_and_non_unit_price() {
        let errors = Transaction::builder()
            .portfolio_id(portfolio())
            .security_id(security())
            .source_id("s-003")
            .transaction_type(TransactionType::Wd)
            .quantity(Decimal::from(300))
            .price(Decimal::from(2))
            .transaction_date(date!(2024 - 01 - 30))
            .build()
            .unwrap_err();

        let codes: Vec<_> = errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&ErrorCode::InvalidCashTransaction));
        assert!(codes.contains(&ErrorCode::InvalidCashPrice));
    }

    #[test]
    fn test_that_security_transaction_requires_security_and_positive_price() {
        let errors = Transaction::builder()
            .portfolio_id(portfolio())
            .source_id("s-004")
            .transaction_type(TransactionType::Buy)
            .quantity(Decimal::from(10))
            .transaction_date(date!(2024 - 01 - 30))
            .build()
            .unwrap_err();

        let codes: Vec<_> = errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&ErrorCode::InvalidSecurityTransaction));
        assert!(codes.contains(&ErrorCode::InvalidValue));
    }

    #[test]
    fn test_that_zero_quantity_and_malformed_ids_accumulate() {
        let errors = Transaction::builder()
            .portfolio_id("bad")
            .security_id("also-bad")
            .source_id("x".repeat(51))
            .transaction_type(TransactionType::Sell)
            .quantity(Decimal::ZERO)
            .price(Decimal::from(10))
            .transaction_date(date!(2024 - 01 - 30))
            .build()
            .unwrap_err();

        assert!(errors.len() >= 4);
        assert!(errors.iter().all(|e| e.code == ErrorCode::InvalidValue));
    }
}
