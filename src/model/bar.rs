use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a stored bar came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Stream,
    HistoricalApi,
    GapRecovery,
    Derived,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::HistoricalApi => "historical-api",
            Self::GapRecovery => "gap-recovery",
            Self::Derived => "derived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stream" => Some(Self::Stream),
            "historical-api" => Some(Self::HistoricalApi),
            "gap-recovery" => Some(Self::GapRecovery),
            "derived" => Some(Self::Derived),
            _ => None,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a stored bar. Exactly one bar exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BarKey {
    pub symbol: String,
    pub interval_ms: u64,
    pub open_time: u64,
}

impl BarKey {
    pub fn new(symbol: &str, interval_ms: u64, open_time: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval_ms,
            open_time,
        }
    }
}

impl fmt::Display for BarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}ms@{}",
            self.symbol, self.interval_ms, self.open_time
        )
    }
}

/// Lineage of a derived bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFrom {
    pub source_bar_count: u32,
    pub source_interval_ms: u64,
}

/// One OHLCV interval `[open_time, close_time)` for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub interval_ms: u64,
    pub open_time: u64,
    /// Exclusive end of the interval.
    pub close_time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub taker_buy_base_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub provenance: Provenance,
    pub derived: Option<DerivedFrom>,
}

impl Bar {
    pub fn key(&self) -> BarKey {
        BarKey::new(&self.symbol, self.interval_ms, self.open_time)
    }

    /// Same OHLC geometry, ignoring volume and provenance.
    pub fn same_prices(&self, other: &Bar) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
    }

    /// Closed at least `grace_ms` before `now_ms`.
    pub fn is_settled(&self, now_ms: u64, grace_ms: u64) -> bool {
        self.close_time.saturating_add(grace_ms) <= now_ms
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

/// Fold ordered base bars into one derived bar. Returns `None` for an empty slice.
pub fn aggregate_bars(
    symbol: &str,
    interval_ms: u64,
    open_time: u64,
    close_time: u64,
    bars: &[Bar],
) -> Option<Bar> {
    let first = bars.first()?;
    let last = bars.last()?;
    let mut out = Bar {
        symbol: symbol.to_string(),
        interval_ms,
        open_time,
        close_time,
        open: first.open,
        high: first.high,
        low: first.low,
        close: last.close,
        volume: 0.0,
        quote_volume: 0.0,
        trade_count: 0,
        taker_buy_base_volume: 0.0,
        taker_buy_quote_volume: 0.0,
        provenance: Provenance::Derived,
        derived: Some(DerivedFrom {
            source_bar_count: bars.len() as u32,
            source_interval_ms: first.interval_ms,
        }),
    };
    for b in bars {
        out.high = out.high.max(b.high);
        out.low = out.low.min(b.low);
        out.volume += b.volume;
        out.quote_volume += b.quote_volume;
        out.trade_count += b.trade_count;
        out.taker_buy_base_volume += b.taker_buy_base_volume;
        out.taker_buy_quote_volume += b.taker_buy_quote_volume;
    }
    Some(out)
}
