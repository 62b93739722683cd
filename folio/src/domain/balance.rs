use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::types::{BalanceId, Version};

/// One position row: the long and short quantity a portfolio holds in a
/// security, or the portfolio's cash when `security_id` is empty. Exactly one
/// cash row may exist per portfolio and its short quantity is always zero.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Balance {
    pub id: Option<BalanceId>,
    pub portfolio_id: String,
    pub security_id: Option<String>,
    pub quantity_long: Decimal,
    pub quantity_short: Decimal,
    pub version: Version,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl Balance {
    /// Zero-initialised security position for a portfolio.
    pub fn security(portfolio_id: impl Into<String>, security_id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: None,
            portfolio_id: portfolio_id.into(),
            security_id: Some(security_id.into()),
            quantity_long: Decimal::ZERO,
            quantity_short: Decimal::ZERO,
            version: 1,
            created_at: now,
            last_updated: now,
        }
    }

    /// Zero-initialised cash row for a portfolio.
    pub fn cash(portfolio_id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: None,
            portfolio_id: portfolio_id.into(),
            security_id: None,
            quantity_long: Decimal::ZERO,
            quantity_short: Decimal::ZERO,
            version: 1,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn is_cash(&self) -> bool {
        self.security_id.as_deref().map_or(true, str::is_empty)
    }

    /// Returns the balance with the given quantities, a bumped version and a
    /// fresh `last_updated`. The store reconciles the bump through its
    /// compare-and-set on the previous version. Rejects a cash row with a
    /// non-zero short quantity.
    pub fn with_quantities(&self, quantity_long: Decimal, quantity_short: Decimal) -> Result<Self> {
        if self.is_cash() && !quantity_short.is_zero() {
            return Err(Error::Constraint(format!(
                "cash balance for portfolio {} cannot carry a short quantity of {}",
                self.portfolio_id, quantity_short
            )));
        }
        let mut next = self.clone();
        next.quantity_long = quantity_long;
        next.quantity_short = quantity_short;
        next.version = self.version + 1;
        next.last_updated = OffsetDateTime::now_utc();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::Balance;
    use crate::error::Error;

    #[test]
    fn test_that_new_balances_start_at_zero_and_version_one() {
        let balance = Balance::security("P".repeat(24), "S".repeat(24));
        assert_eq!(balance.quantity_long, Decimal::ZERO);
        assert_eq!(balance.quantity_short, Decimal::ZERO);
        assert_eq!(balance.version, 1);
        assert!(!balance.is_cash());
        assert!(Balance::cash("P".repeat(24)).is_cash());
    }

    #[test]
    fn test_that_with_quantities_bumps_version() {
        let balance = Balance::security("P".repeat(24), "S".repeat(24));
        let next = balance
            .with_quantities(Decimal::from(100), Decimal::ZERO)
            .unwrap();
        assert_eq!(next.quantity_long, Decimal::from(100));
        assert_eq!(next.version, 2);
    }

    #[test]
    fn test_that_cash_balance_rejects_short_quantity() {
        let cash = Balance::cash("P".repeat(24));
        let err = cash
            .with_quantities(Decimal::from(100), Decimal::from(1))
            .unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }
}
