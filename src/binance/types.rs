use serde::{Deserialize, Serialize};

use crate::model::bar::{Bar, Provenance};
use crate::model::trade::Trade;

/// Deserialize Binance string-encoded numbers to f64.
pub fn string_to_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

/// Kline stream event (`<symbol>@kline_<interval>`).
#[derive(Debug, Deserialize)]
pub struct BinanceKlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: BinanceKline,
}

#[derive(Debug, Deserialize)]
pub struct BinanceKline {
    #[serde(rename = "t")]
    pub open_time: u64,
    /// Inclusive: `open_time + interval - 1`.
    #[serde(rename = "T")]
    pub close_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o", deserialize_with = "string_to_f64")]
    pub open: f64,
    #[serde(rename = "c", deserialize_with = "string_to_f64")]
    pub close: f64,
    #[serde(rename = "h", deserialize_with = "string_to_f64")]
    pub high: f64,
    #[serde(rename = "l", deserialize_with = "string_to_f64")]
    pub low: f64,
    #[serde(rename = "v", deserialize_with = "string_to_f64")]
    pub volume: f64,
    #[serde(rename = "n")]
    pub trade_count: u64,
    /// Closed (final) kline.
    #[serde(rename = "x")]
    pub is_closed: bool,
    #[serde(rename = "q", deserialize_with = "string_to_f64")]
    pub quote_volume: f64,
    #[serde(rename = "V", deserialize_with = "string_to_f64")]
    pub taker_buy_base_volume: f64,
    #[serde(rename = "Q", deserialize_with = "string_to_f64")]
    pub taker_buy_quote_volume: f64,
}

impl BinanceKline {
    pub fn to_bar(&self, interval_ms: u64, provenance: Provenance) -> Bar {
        Bar {
            symbol: self.symbol.to_ascii_uppercase(),
            interval_ms,
            open_time: self.open_time,
            close_time: self.open_time + interval_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
            trade_count: self.trade_count,
            taker_buy_base_volume: self.taker_buy_base_volume,
            taker_buy_quote_volume: self.taker_buy_quote_volume,
            provenance,
            derived: None,
        }
    }
}

/// Any text frame the stream may send.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BinanceStreamMessage {
    /// Combined-stream envelope.
    Wrapped { stream: String, data: BinanceKlineEvent },
    Kline(BinanceKlineEvent),
    /// Reply to SUBSCRIBE / UNSUBSCRIBE.
    Ack {
        result: Option<serde_json::Value>,
        id: u64,
    },
    Error { code: i64, msg: String },
}

/// Live subscription control frame.
#[derive(Debug, Serialize)]
pub struct BinanceStreamRequest {
    pub method: &'static str,
    pub params: Vec<String>,
    pub id: u64,
}

impl BinanceStreamRequest {
    pub fn subscribe(symbols: &[String], interval: &str, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE",
            params: kline_streams(symbols, interval),
            id,
        }
    }

    pub fn unsubscribe(symbols: &[String], interval: &str, id: u64) -> Self {
        Self {
            method: "UNSUBSCRIBE",
            params: kline_streams(symbols, interval),
            id,
        }
    }
}

pub fn kline_stream_name(symbol: &str, interval: &str) -> String {
    format!("{}@kline_{}", symbol.to_ascii_lowercase(), interval)
}

fn kline_streams(symbols: &[String], interval: &str) -> Vec<String> {
    symbols
        .iter()
        .map(|s| kline_stream_name(s, interval))
        .collect()
}

/// One row of `GET /api/v3/klines`.
#[derive(Debug, Deserialize)]
pub struct BinanceRestKline(
    pub u64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub u64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub serde_json::Value,
);

impl BinanceRestKline {
    pub fn to_bar(&self, symbol: &str, interval_ms: u64) -> Result<Bar, std::num::ParseFloatError> {
        Ok(Bar {
            symbol: symbol.to_ascii_uppercase(),
            interval_ms,
            open_time: self.0,
            close_time: self.0 + interval_ms,
            open: self.1.parse()?,
            high: self.2.parse()?,
            low: self.3.parse()?,
            close: self.4.parse()?,
            volume: self.5.parse()?,
            quote_volume: self.7.parse()?,
            trade_count: self.8,
            taker_buy_base_volume: self.9.parse()?,
            taker_buy_quote_volume: self.10.parse()?,
            provenance: Provenance::HistoricalApi,
            derived: None,
        })
    }
}

/// One row of `GET /api/v3/aggTrades`.
#[derive(Debug, Deserialize)]
pub struct BinanceAggTrade {
    #[serde(rename = "a")]
    pub agg_trade_id: u64,
    #[serde(rename = "p", deserialize_with = "string_to_f64")]
    pub price: f64,
    #[serde(rename = "q", deserialize_with = "string_to_f64")]
    pub qty: f64,
    #[serde(rename = "T")]
    pub timestamp_ms: u64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl BinanceAggTrade {
    pub fn to_trade(&self, symbol: &str) -> Trade {
        Trade {
            symbol: symbol.to_ascii_uppercase(),
            trade_id: self.agg_trade_id,
            price: self.price,
            qty: self.qty,
            timestamp_ms: self.timestamp_ms,
            is_buyer_maker: self.is_buyer_maker,
        }
    }
}

/// Binance API error response.
#[derive(Debug, Deserialize)]
pub struct BinanceApiErrorResponse {
    pub code: i64,
    pub msg: String,
}

/// Binance server time response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimeResponse {
    pub server_time: u64,
}
