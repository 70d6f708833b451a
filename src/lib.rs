pub mod aggregation;
pub mod binance;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod expiring;
pub mod gap_recovery;
pub mod model;
pub mod pattern;
pub mod signal;
pub mod source;
pub mod store;
pub mod timeframe;
