pub mod backtester;
pub mod engine;
pub mod event_bus;
