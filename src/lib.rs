//! fxbot trading system library
//!
//! Candle ingestion, feature and signal computation, risk sizing, paper and
//! OANDA execution, and the session engine and backtester driving them.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod secrets;
