pub mod broker;
pub mod candle_source;
