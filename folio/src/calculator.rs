//! Balance calculation: applies a validated transaction's impact row to the
//! current security and cash balances, producing the post-state rows without
//! persisting anything. Missing balances are treated as zero-initialised and
//! come back as insert writes.

use rust_decimal::Decimal;

use crate::domain::balance::Balance;
use crate::domain::transaction::Transaction;
use crate::error::{Error, Result};
use crate::repository::BalanceWrite;
use crate::types::{within_magnitude, BalanceId, Impact, Version};

/// Pre and post state for one affected balance row.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceDelta {
    pub portfolio_id: String,
    pub security_id: Option<String>,
    pub balance_id: Option<BalanceId>,
    pub expected_version: Option<Version>,
    pub before_long: Decimal,
    pub before_short: Decimal,
    pub after_long: Decimal,
    pub after_short: Decimal,
}

impl BalanceDelta {
    pub fn to_write(&self) -> BalanceWrite {
        BalanceWrite {
            id: self.balance_id,
            portfolio_id: self.portfolio_id.clone(),
            security_id: self.security_id.clone(),
            quantity_long: self.after_long,
            quantity_short: self.after_short,
            expected_version: self.expected_version,
        }
    }
}

/// The up-to-two balance rows a transaction touches.
#[derive(Clone, Debug, Default)]
pub struct BalanceCalculation {
    pub security: Option<BalanceDelta>,
    pub cash: Option<BalanceDelta>,
}

impl BalanceCalculation {
    pub fn writes(&self) -> Vec<BalanceWrite> {
        self.security
            .iter()
            .chain(self.cash.iter())
            .map(BalanceDelta::to_write)
            .collect()
    }

    pub fn balance_ids(&self) -> Vec<BalanceId> {
        self.security
            .iter()
            .chain(self.cash.iter())
            .filter_map(|delta| delta.balance_id)
            .collect()
    }
}

pub struct BalanceCalculator;

impl BalanceCalculator {
    /// Computes the post-state for the security balance (when the type
    /// touches one) and the cash balance (when the impact row says so).
    /// Constraint violations are final: a cash row can never carry a short
    /// quantity and no balance may outgrow the fixed-point range.
    pub fn calculate(
        transaction: &Transaction,
        security_balance: Option<&Balance>,
        cash_balance: Option<&Balance>,
    ) -> Result<BalanceCalculation> {
        let transaction_type = transaction.transaction_type;
        let mut calculation = BalanceCalculation::default();

        if transaction_type.is_security() {
            let security_id = transaction.security_id.as_deref().ok_or_else(|| {
                Error::Internal(format!(
                    "{} transaction without a security reached the calculator",
                    transaction_type
                ))
            })?;

            let (before_long, before_short, balance_id, expected_version) = match security_balance
            {
                Some(balance) => (
                    balance.quantity_long,
                    balance.quantity_short,
                    balance.id,
                    Some(balance.version),
                ),
                None => (Decimal::ZERO, Decimal::ZERO, None, None),
            };

            let after_long = transaction_type
                .long_impact()
                .apply(before_long, transaction.quantity);
            let after_short = transaction_type
                .short_impact()
                .apply(before_short, transaction.quantity);
            check_range(&transaction.portfolio_id, after_long)?;
            check_range(&transaction.portfolio_id, after_short)?;

            calculation.security = Some(BalanceDelta {
                portfolio_id: transaction.portfolio_id.clone(),
                security_id: Some(security_id.to_string()),
                balance_id,
                expected_version,
                before_long,
                before_short,
                after_long,
                after_short,
            });
        }

        let cash_impact = transaction_type.cash_impact();
        if cash_impact != Impact::NoChange {
            let (before_long, before_short, balance_id, expected_version) = match cash_balance {
                Some(balance) => (
                    balance.quantity_long,
                    balance.quantity_short,
                    balance.id,
                    Some(balance.version),
                ),
                None => (Decimal::ZERO, Decimal::ZERO, None, None),
            };

            if !before_short.is_zero() {
                return Err(Error::Constraint(format!(
                    "cash balance for portfolio {} carries a short quantity of {}",
                    transaction.portfolio_id, before_short
                )));
            }

            let magnitude = if transaction_type.is_cash() {
                transaction.quantity
            } else {
                transaction.notional()
            };
            let after_long = cash_impact.apply(before_long, magnitude);
            check_range(&transaction.portfolio_id, after_long)?;

            calculation.cash = Some(BalanceDelta {
                portfolio_id: transaction.portfolio_id.clone(),
                security_id: None,
                balance_id,
                expected_version,
                before_long,
                before_short,
                after_long,
                after_short: Decimal::ZERO,
            });
        }

        Ok(calculation)
    }
}

fn check_range(portfolio_id: &str, value: Decimal) -> Result<()> {
    if within_magnitude(&value) {
        Ok(())
    } else {
        Err(Error::Constraint(format!(
            "balance for portfolio {portfolio_id} left the 18-digit fixed-point range: {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use time::macros::date;

    use super::BalanceCalculator;
    use crate::domain::balance::Balance;
    use crate::domain::transaction::Transaction;
    use crate::error::Error;
    use crate::types::TransactionType;

    fn portfolio() -> String {
        "P".repeat(24)
    }

    fn security() -> String {
        "S".repeat(24)
    }

    fn transaction(transaction_type: TransactionType, quantity: i64, price: i64) -> Transaction {
        let builder = Transaction::builder()
            .portfolio_id(portfolio())
            .source_id("s-001")
            .transaction_type(transaction_type)
            .quantity(Decimal::from(quantity))
            .transaction_date(date!(2024 - 01 - 30));
        let builder = if transaction_type.is_cash() {
            builder
        } else {
            builder.security_id(security()).price(Decimal::from(price))
        };
        builder.build().unwrap()
    }

    #[test]
    fn test_that_buy_adds_long_and_spends_cash() {
        let tx = transaction(TransactionType::Buy, 100, 50);
        let calc = BalanceCalculator::calculate(&tx, None, None).unwrap();

        let security = calc.security.unwrap();
        assert_eq!(security.after_long, Decimal::from(100));
        assert_eq!(security.after_short, Decimal::ZERO);
        let cash = calc.cash.unwrap();
        assert_eq!(cash.after_long, Decimal::from(-5000));
        assert_eq!(cash.after_short, Decimal::ZERO);
    }

    #[test]
    fn test_that_sell_reduces_long_and_raises_cash() {
        let tx = transaction(TransactionType::Sell, 40, 55);
        let mut security_balance = Balance::security(portfolio(), security());
        security_balance.quantity_long = Decimal::from(100);
        security_balance.id = Some(1);
        let mut cash_balance = Balance::cash(portfolio());
        cash_balance.quantity_long = Decimal::from(-5000);
        cash_balance.id = Some(2);

        let calc =
            BalanceCalculator::calculate(&tx, Some(&security_balance), Some(&cash_balance))
                .unwrap();
        assert_eq!(calc.security.as_ref().unwrap().after_long, Decimal::from(60));
        assert_eq!(calc.cash.as_ref().unwrap().after_long, Decimal::from(-2800));
        assert_eq!(calc.balance_ids(), vec![1, 2]);
    }

    #[test]
    fn test_that_short_and_cover_use_the_short_side() {
        let short = transaction(TransactionType::Short, 10, 20);
        let calc = BalanceCalculator::calculate(&short, None, None).unwrap();
        let security_delta = calc.security.unwrap();
        assert_eq!(security_delta.after_long, Decimal::ZERO);
        assert_eq!(security_delta.after_short, Decimal::from(10));
        assert_eq!(calc.cash.unwrap().after_long, Decimal::from(200));

        let cover = transaction(TransactionType::Cover, 10, 18);
        let mut security_balance = Balance::security(portfolio(), security());
        security_balance.quantity_short = Decimal::from(10);
        let mut cash_balance = Balance::cash(portfolio());
        cash_balance.quantity_long = Decimal::from(200);
        let calc =
            BalanceCalculator::calculate(&cover, Some(&security_balance), Some(&cash_balance))
                .unwrap();
        assert_eq!(calc.security.unwrap().after_short, Decimal::ZERO);
        assert_eq!(calc.cash.unwrap().after_long, Decimal::from(20));
    }

    #[test]
    fn test_that_cash_types_move_cash_only() {
        let dep = transaction(TransactionType::Dep, 1000, 1);
        let calc = BalanceCalculator::calculate(&dep, None, None).unwrap();
        assert!(calc.security.is_none());
        assert_eq!(calc.cash.unwrap().after_long, Decimal::from(1000));

        let wd = transaction(TransactionType::Wd, 300, 1);
        let mut cash_balance = Balance::cash(portfolio());
        cash_balance.quantity_long = Decimal::from(1000);
        let calc = BalanceCalculator::calculate(&wd, None, Some(&cash_balance)).unwrap();
        assert_eq!(calc.cash.unwrap().after_long, Decimal::from(700));
    }

    #[test]
    fn test_that_in_and_out_leave_cash_untouched() {
        let transfer_in = transaction(TransactionType::In, 25, 10);
        let calc = BalanceCalculator::calculate(&transfer_in, None, None).unwrap();
        assert!(calc.cash.is_none());
        assert_eq!(calc.security.unwrap().after_long, Decimal::from(25));

        let transfer_out = transaction(TransactionType::Out, 25, 10);
        let calc = BalanceCalculator::calculate(&transfer_out, None, None).unwrap();
        assert!(calc.cash.is_none());
        assert_eq!(calc.security.unwrap().after_long, Decimal::from(-25));
    }

    #[test]
    fn test_that_corrupt_cash_short_is_a_constraint_violation() {
        let tx = transaction(TransactionType::Dep, 100, 1);
        let mut cash_balance = Balance::cash(portfolio());
        cash_balance.quantity_short = Decimal::from(5);
        let err = BalanceCalculator::calculate(&tx, None, Some(&cash_balance)).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }

    #[test]
    fn test_that_notional_is_exact_in_fixed_point() {
        let tx = Transaction::builder()
            .portfolio_id(portfolio())
            .security_id(security())
            .source_id("s-001")
            .transaction_type(TransactionType::Buy)
            .quantity(Decimal::from_str("0.00000003").unwrap())
            .price(Decimal::from_str("0.1").unwrap())
            .transaction_date(date!(2024 - 01 - 30))
            .build()
            .unwrap();
        let calc = BalanceCalculator::calculate(&tx, None, None).unwrap();
        // The product needs more than 8 decimal places and must not round.
        assert_eq!(
            calc.cash.unwrap().after_long,
            Decimal::from_str("-0.000000003").unwrap()
        );
    }

    #[test]
    fn test_that_balances_cannot_outgrow_the_fixed_point_range() {
        let tx = transaction(TransactionType::Buy, 2, 1);
        let mut security_balance = Balance::security(portfolio(), security());
        security_balance.quantity_long =
            Decimal::from_str("999999999999999999").unwrap();
        let err =
            BalanceCalculator::calculate(&tx, Some(&security_balance), None).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }
}
