pub mod features;
pub mod indicators;
pub mod ledger;
pub mod metrics;
pub mod news_filter;
pub mod pipeline;
pub mod risk_manager;
pub mod strategies;
