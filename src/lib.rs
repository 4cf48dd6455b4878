//! Tradebot Sync
//!
//! Keeps a trading-robot order ledger consistent with exchange truth: shared
//! exchange sessions, multiplexed private streams, incremental and periodic
//! reconciliation, and the per-robot engines that act on the reconciled state.

pub mod application;
pub mod cache;
pub mod config;
pub mod context;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod secrets;
pub mod task_runner;
