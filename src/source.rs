use async_trait::async_trait;

use crate::error::AppError;
use crate::model::bar::Bar;
use crate::model::trade::Trade;

/// REST history of base bars.
#[async_trait]
pub trait HistoricalBarSource: Send + Sync {
    /// Base bars with `start_ms <= open_time < end_ms`, ordered by open time.
    ///
    /// A rate-limit refusal surfaces as [`AppError::RateLimited`] and should be
    /// retried later, never treated as fatal.
    async fn fetch_bars(&self, symbol: &str, start_ms: u64, end_ms: u64)
        -> Result<Vec<Bar>, AppError>;

    /// The newest `limit` closed base bars.
    async fn fetch_recent_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>, AppError>;
}

/// REST history of individual trades.
#[async_trait]
pub trait TradeTickSource: Send + Sync {
    async fn fetch_trades(
        &self,
        symbol: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<Trade>, AppError>;
}

/// Fallback list of symbols to stream when nothing has been subscribed yet.
pub trait SymbolSource: Send + Sync {
    fn current_symbols(&self) -> Vec<String>;
}

/// Fixed symbol list, normalized to upper case without duplicates.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbols {
    symbols: Vec<String>,
}

impl StaticSymbols {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for sym in symbols {
            let s = normalize_symbol(sym.as_ref());
            if !s.is_empty() && !out.contains(&s) {
                out.push(s);
            }
        }
        Self { symbols: out }
    }
}

impl SymbolSource for StaticSymbols {
    fn current_symbols(&self) -> Vec<String> {
        self.symbols.clone()
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_symbols_dedup_and_normalize() {
        let src = StaticSymbols::new(["btcusdt", " ETHUSDT ", "BTCUSDT", "  "]);
        assert_eq!(
            src.current_symbols(),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
    }
}
