pub mod account;
pub mod candle;
pub mod order;
pub mod position;
pub mod run;
pub mod signal;
