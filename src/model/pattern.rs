use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    BuyReversal,
    SellReversal,
}

impl PatternType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuyReversal => "buy_reversal",
            Self::SellReversal => "sell_reversal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy_reversal" => Some(Self::BuyReversal),
            "sell_reversal" => Some(Self::SellReversal),
            _ => None,
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reversal geometry detected on a single bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_type: PatternType,
    pub body_percent: f64,
    pub upper_wick_percent: f64,
    pub lower_wick_percent: f64,
    pub body_position_percent: f64,
    /// 0..=100
    pub confidence: f64,
    pub stop_loss_price: f64,
    pub stop_loss_risk_percent: f64,
}
