//! Store backends. `postgres` is the durable adapter the service runs on;
//! `memory` keeps the same contracts and locking semantics in process and
//! backs the test suites and embedded use.

pub mod memory;
pub mod postgres;
