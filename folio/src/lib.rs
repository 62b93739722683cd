//! Portfolio accounting engine. Transactions (BUY/SELL/SHORT/COVER/DEP/WD/
//! IN/OUT) are validated, applied to double-entry style long/short and cash
//! balances under optimistic locking, and queryable through the application
//! services. The batch pipeline bulk-imports CSV files with per-record error
//! isolation.

pub mod batch;
pub mod cache;
pub mod calculator;
pub mod config;
pub mod domain;
pub mod error;
pub mod external;
pub mod processor;
pub mod repository;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;
