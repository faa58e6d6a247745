pub mod broker_factory;
pub mod candle_feed;
pub mod oanda_broker;
pub mod oanda_candles;
pub mod oanda_client;
pub mod paper_broker;
