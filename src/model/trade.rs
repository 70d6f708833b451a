use serde::{Deserialize, Serialize};

/// One aggregated trade print, as used by volume-profile consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub trade_id: u64,
    pub price: f64,
    pub qty: f64,
    pub timestamp_ms: u64,
    /// Seller was the aggressor.
    pub is_buyer_maker: bool,
}
