//! Base identifier and value types shared by every component: fixed-point
//! quantity helpers, transaction type and status enums, and the impact table
//! that maps a transaction type onto signed balance deltas.
//!
//! All accounting arithmetic runs on [`Decimal`] at 18 integer and 8
//! fractional digits. Floating point never enters the accounting path.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;

pub type TransactionId = i64;
pub type BalanceId = i64;
pub type Version = i32;

/// Portfolio and security identifiers are opaque 24-character strings.
pub const ENTITY_ID_LENGTH: usize = 24;
/// Source ids are the idempotency key and capped at 50 characters.
pub const SOURCE_ID_MAX_LENGTH: usize = 50;
/// Fractional digits carried by every quantity, price and amount.
pub const FRACTIONAL_DIGITS: u32 = 8;

/// Wire format for transaction dates on input: `YYYYMMDD`.
pub const COMPACT_DATE: &[FormatItem<'static>] = format_description!("[year][month][day]");

pub fn parse_compact_date(value: &str) -> Option<Date> {
    Date::parse(value, COMPACT_DATE).ok()
}

pub fn valid_entity_id(id: &str) -> bool {
    id.len() == ENTITY_ID_LENGTH && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

pub fn valid_source_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= SOURCE_ID_MAX_LENGTH
}

fn integer_digit_limit() -> Decimal {
    // 10^18, the first value with more than 18 integer digits.
    Decimal::new(1_000_000_000_000_000_000, 0)
}

/// True when `value` fits 18 integer digits and at most 8 fractional digits.
pub fn within_precision(value: &Decimal) -> bool {
    value.normalize().scale() <= FRACTIONAL_DIGITS && value.abs() < integer_digit_limit()
}

/// True when `value` fits 18 integer digits. Computed balances are allowed
/// a finer scale than their inputs: a notional is the exact, unrounded
/// product of two 18.8 values.
pub fn within_magnitude(value: &Decimal) -> bool {
    value.abs() < integer_digit_limit()
}

/// Direction of a balance mutation from the impact table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Impact {
    Increase,
    Decrease,
    NoChange,
}

impl Impact {
    /// Applies the impact to `current`, adding or subtracting `magnitude`.
    pub fn apply(&self, current: Decimal, magnitude: Decimal) -> Decimal {
        match self {
            Impact::Increase => current + magnitude,
            Impact::Decrease => current - magnitude,
            Impact::NoChange => current,
        }
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord,
    derive_more::Display,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    #[display("BUY")]
    Buy,
    #[display("SELL")]
    Sell,
    #[display("SHORT")]
    Short,
    #[display("COVER")]
    Cover,
    #[display("DEP")]
    Dep,
    #[display("WD")]
    Wd,
    #[display("IN")]
    In,
    #[display("OUT")]
    Out,
}

impl TransactionType {
    pub const ALL: [TransactionType; 8] = [
        TransactionType::Buy,
        TransactionType::Sell,
        TransactionType::Short,
        TransactionType::Cover,
        TransactionType::Dep,
        TransactionType::Wd,
        TransactionType::In,
        TransactionType::Out,
    ];

    /// Cash transactions move money without touching a security position.
    pub fn is_cash(&self) -> bool {
        matches!(self, TransactionType::Dep | TransactionType::Wd)
    }

    pub fn is_security(&self) -> bool {
        !self.is_cash()
    }

    /// Impact on the security balance long quantity.
    pub fn long_impact(&self) -> Impact {
        match self {
            TransactionType::Buy | TransactionType::In => Impact::Increase,
            TransactionType::Sell | TransactionType::Out => Impact::Decrease,
            _ => Impact::NoChange,
        }
    }

    /// Impact on the security balance short quantity.
    pub fn short_impact(&self) -> Impact {
        match self {
            TransactionType::Short => Impact::Increase,
            TransactionType::Cover => Impact::Decrease,
            _ => Impact::NoChange,
        }
    }

    /// Impact on the portfolio cash balance. The magnitude is the raw
    /// quantity for DEP/WD and the notional for the trading types.
    pub fn cash_impact(&self) -> Impact {
        match self {
            TransactionType::Sell | TransactionType::Short | TransactionType::Dep => {
                Impact::Increase
            }
            TransactionType::Buy | TransactionType::Cover | TransactionType::Wd => Impact::Decrease,
            TransactionType::In | TransactionType::Out => Impact::NoChange,
        }
    }
}

impl FromStr for TransactionType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "BUY" => Ok(TransactionType::Buy),
            "SELL" => Ok(TransactionType::Sell),
            "SHORT" => Ok(TransactionType::Short),
            "COVER" => Ok(TransactionType::Cover),
            "DEP" => Ok(TransactionType::Dep),
            "WD" => Ok(TransactionType::Wd),
            "IN" => Ok(TransactionType::In),
            "OUT" => Ok(TransactionType::Out),
            _ => Err(()),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord,
    derive_more::Display,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    #[display("NEW")]
    New,
    #[display("PROC")]
    Proc,
    #[display("FATAL")]
    Fatal,
    #[display("ERROR")]
    Error,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 4] = [
        TransactionStatus::New,
        TransactionStatus::Proc,
        TransactionStatus::Fatal,
        TransactionStatus::Error,
    ];

    /// Only NEW and ERROR transactions are eligible for processing.
    pub fn can_process(&self) -> bool {
        matches!(self, TransactionStatus::New | TransactionStatus::Error)
    }

    /// PROC and FATAL are terminal.
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionStatus::Proc | TransactionStatus::Fatal)
    }
}

impl FromStr for TransactionStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NEW" => Ok(TransactionStatus::New),
            "PROC" => Ok(TransactionStatus::Proc),
            "FATAL" => Ok(TransactionStatus::Fatal),
            "ERROR" => Ok(TransactionStatus::Error),
            _ => Err(()),
        }
    }
}
