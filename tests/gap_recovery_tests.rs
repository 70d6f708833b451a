use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use kline_ledger::aggregation::AggregationEngine;
use kline_ledger::config::{AggregationConfig, RecoveryConfig};
use kline_ledger::error::AppError;
use kline_ledger::event::GapWindow;
use kline_ledger::gap_recovery::GapRecovery;
use kline_ledger::model::bar::{Bar, Provenance};
use kline_ledger::source::HistoricalBarSource;
use kline_ledger::store::{BarStore, MemoryStore};

const MIN: u64 = 60_000;

fn t0() -> u64 {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
        .timestamp_millis() as u64
}

fn bar_at(symbol: &str, open_time: u64) -> Bar {
    let p = 100.0 + ((open_time / MIN) % 10) as f64;
    Bar {
        symbol: symbol.to_string(),
        interval_ms: MIN,
        open_time,
        close_time: open_time + MIN,
        open: p,
        high: p + 1.0,
        low: p - 1.0,
        close: p + 0.5,
        volume: 2.0,
        quote_volume: 2.0 * p,
        trade_count: 4,
        taker_buy_base_volume: 1.0,
        taker_buy_quote_volume: p,
        provenance: Provenance::HistoricalApi,
        derived: None,
    }
}

/// Serves one synthetic bar per minute, optionally failing first.
#[derive(Default)]
struct FakeHistory {
    calls: Mutex<Vec<(String, u64, u64)>>,
    failures: Mutex<VecDeque<AppError>>,
    jitter_ms: u64,
    delay_ms: u64,
}

impl FakeHistory {
    fn failing(errors: Vec<AppError>) -> Self {
        Self {
            failures: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(String, u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoricalBarSource for FakeHistory {
    async fn fetch_bars(
        &self,
        symbol: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<Bar>, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((symbol.to_string(), start_ms, end_ms));
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let mut out = Vec::new();
        let mut t = start_ms;
        while t < end_ms {
            let mut bar = bar_at(symbol, t);
            bar.open_time += self.jitter_ms;
            bar.close_time += self.jitter_ms;
            out.push(bar);
            t += MIN;
        }
        Ok(out)
    }

    async fn fetch_recent_bars(&self, _symbol: &str, _limit: usize) -> Result<Vec<Bar>, AppError> {
        Ok(Vec::new())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    history: Arc<FakeHistory>,
    recovery: GapRecovery,
}

fn harness(history: FakeHistory, timeframes: &[&str]) -> Harness {
    harness_with(
        history,
        timeframes,
        RecoveryConfig {
            retry_delay_ms: 10,
            ..RecoveryConfig::default()
        },
    )
}

fn harness_with(history: FakeHistory, timeframes: &[&str], cfg: RecoveryConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let history = Arc::new(history);
    let agg_cfg = AggregationConfig {
        timeframes: timeframes.iter().map(|s| s.to_string()).collect(),
        settle_grace_ms: 0,
        ..AggregationConfig::default()
    };
    let aggregation = Arc::new(AggregationEngine::new(
        store.clone(),
        store.clone(),
        agg_cfg.parsed_timeframes().unwrap(),
        &agg_cfg,
    ));
    let recovery = GapRecovery::new(
        store.clone(),
        store.clone(),
        history.clone(),
        aggregation,
        cfg,
    );
    Harness {
        store,
        history,
        recovery,
    }
}

fn window(symbols: &[&str], from: u64, to: u64) -> GapWindow {
    GapWindow {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        disconnected_at_ms: from,
        reconnected_at_ms: to,
    }
}

#[tokio::test]
async fn twelve_minute_outage_recovers_twelve_bars() {
    let h = harness(FakeHistory::default(), &["5m"]);
    let t0 = t0();
    h.recovery.note_bar_end("BTCUSDT", t0);

    let report = h
        .recovery
        .recover(&window(&["BTCUSDT"], t0, t0 + 12 * MIN), t0 + 13 * MIN)
        .await;

    assert!(!report.skipped);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.bars_missing, 12);
    assert_eq!(report.bars_recovered, 12);
    assert_eq!(h.history.calls(), vec![("BTCUSDT".to_string(), t0, t0 + 12 * MIN)]);

    let stored = h.store.bars_for("BTCUSDT", MIN);
    assert_eq!(stored.len(), 12);
    assert!(stored.iter().all(|b| b.provenance == Provenance::GapRecovery));
    assert_eq!(stored[0].open_time, t0);
    assert_eq!(stored[11].close_time, t0 + 12 * MIN);
    assert_eq!(h.recovery.last_known_end("BTCUSDT"), Some(t0 + 12 * MIN));

    // [12:00, 12:05) and [12:05, 12:10) are now complete
    assert_eq!(report.derived_built, 2);
    assert_eq!(h.store.bars_for("BTCUSDT", 5 * MIN).len(), 2);
}

#[tokio::test]
async fn short_outage_is_skipped() {
    let h = harness(FakeHistory::default(), &["5m"]);
    let t0 = t0();
    h.recovery.note_bar_end("BTCUSDT", t0);

    let report = h
        .recovery
        .recover(&window(&["BTCUSDT"], t0 + 5_000, t0 + 35_000), t0 + 40_000)
        .await;
    assert!(report.skipped);
    assert!(h.history.calls().is_empty());
    assert_eq!(h.store.bar_count(), 0);
}

#[tokio::test]
async fn only_missing_boundaries_are_fetched() {
    let h = harness(FakeHistory::default(), &[]);
    let t0 = t0();
    h.recovery.note_bar_end("ETHUSDT", t0);
    for m in 3..6 {
        h.store.upsert(&bar_at("ETHUSDT", t0 + m * MIN)).await.unwrap();
    }

    let report = h
        .recovery
        .recover(&window(&["ETHUSDT"], t0, t0 + 10 * MIN), t0 + 11 * MIN)
        .await;

    assert_eq!(report.bars_missing, 7);
    assert_eq!(report.bars_recovered, 7);
    assert_eq!(
        h.history.calls(),
        vec![
            ("ETHUSDT".to_string(), t0, t0 + 3 * MIN),
            ("ETHUSDT".to_string(), t0 + 6 * MIN, t0 + 10 * MIN),
        ]
    );
    assert_eq!(h.store.bars_for("ETHUSDT", MIN).len(), 10);
}

#[tokio::test]
async fn falls_back_to_newest_stored_bar() {
    let h = harness(FakeHistory::default(), &[]);
    let t0 = t0();
    for m in 0..2 {
        h.store.upsert(&bar_at("BTCUSDT", t0 + m * MIN)).await.unwrap();
    }

    let report = h
        .recovery
        .recover(&window(&["BTCUSDT"], t0 + 5 * MIN, t0 + 10 * MIN), t0 + 10 * MIN)
        .await;

    assert_eq!(report.bars_recovered, 8);
    assert_eq!(h.history.calls()[0].1, t0 + 2 * MIN);
    assert_eq!(h.store.bars_for("BTCUSDT", MIN).len(), 10);
}

#[tokio::test]
async fn returned_bars_snap_to_boundaries_within_tolerance() {
    let history = FakeHistory {
        jitter_ms: 400,
        ..FakeHistory::default()
    };
    let h = harness(history, &[]);
    let t0 = t0();
    h.recovery.note_bar_end("BTCUSDT", t0);

    let report = h
        .recovery
        .recover(&window(&["BTCUSDT"], t0, t0 + 3 * MIN), t0 + 3 * MIN)
        .await;
    assert_eq!(report.bars_recovered, 3);
    let opens: Vec<u64> = h
        .store
        .bars_for("BTCUSDT", MIN)
        .iter()
        .map(|b| b.open_time)
        .collect();
    assert_eq!(opens, vec![t0, t0 + MIN, t0 + 2 * MIN]);
}

#[tokio::test]
async fn rate_limited_fetch_is_not_retried() {
    let history = FakeHistory::failing(vec![AppError::RateLimited {
        status: 429,
        retry_after_secs: Some(30),
    }]);
    let h = harness(history, &[]);
    let t0 = t0();
    h.recovery.note_bar_end("BTCUSDT", t0);

    let report = h
        .recovery
        .recover(&window(&["BTCUSDT"], t0, t0 + 4 * MIN), t0 + 4 * MIN)
        .await;

    assert_eq!(h.history.calls().len(), 1);
    assert_eq!(report.bars_missing, 4);
    assert_eq!(report.bars_recovered, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(h.store.bar_count(), 0);
}

#[tokio::test]
async fn transient_failure_is_retried_once() {
    let history = FakeHistory::failing(vec![AppError::Transport("connection reset".into())]);
    let h = harness(history, &[]);
    let t0 = t0();
    h.recovery.note_bar_end("BTCUSDT", t0);

    let report = h
        .recovery
        .recover(&window(&["BTCUSDT"], t0, t0 + 4 * MIN), t0 + 4 * MIN)
        .await;

    assert_eq!(h.history.calls().len(), 2);
    assert_eq!(report.bars_recovered, 4);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn one_failing_symbol_does_not_block_others() {
    let history = FakeHistory::failing(vec![AppError::BinanceApi {
        code: -1121,
        msg: "Invalid symbol.".into(),
    }]);
    let h = harness_with(
        history,
        &[],
        RecoveryConfig {
            max_concurrent_fetches: 1,
            retry_delay_ms: 10,
            ..RecoveryConfig::default()
        },
    );
    let t0 = t0();
    h.recovery.note_bar_end("BADUSDT", t0);
    h.recovery.note_bar_end("BTCUSDT", t0);

    // one fetch at a time so the first symbol takes the failure
    let report = h
        .recovery
        .recover(&window(&["BADUSDT", "BTCUSDT"], t0, t0 + 2 * MIN), t0 + 2 * MIN)
        .await;

    assert_eq!(h.history.calls().len(), 2);
    assert_eq!(report.bars_missing, 4);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.bars_recovered, 2);
    assert_eq!(h.store.bars_for("BTCUSDT", MIN).len(), 2);
    assert!(h.store.bars_for("BADUSDT", MIN).is_empty());
}

#[tokio::test]
async fn permanent_api_error_is_not_retried() {
    let history = FakeHistory::failing(vec![AppError::BinanceApi {
        code: -1100,
        msg: "Illegal characters found in parameter 'symbol'.".into(),
    }]);
    let h = harness(history, &[]);
    let t0 = t0();
    h.recovery.note_bar_end("BTCUSDT", t0);

    let report = h
        .recovery
        .recover(&window(&["BTCUSDT"], t0, t0 + 3 * MIN), t0 + 3 * MIN)
        .await;

    assert_eq!(h.history.calls().len(), 1);
    assert_eq!(report.bars_recovered, 0);
    assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn live_bar_during_recovery_does_not_shrink_the_gap() {
    let history = FakeHistory {
        delay_ms: 50,
        ..FakeHistory::default()
    };
    let h = harness_with(
        history,
        &[],
        RecoveryConfig {
            max_concurrent_fetches: 1,
            retry_delay_ms: 10,
            ..RecoveryConfig::default()
        },
    );
    let t0 = t0();
    h.recovery.note_bar_end("BTCUSDT", t0);
    h.recovery.note_bar_end("ETHUSDT", t0);

    // ETHUSDT's first post-reconnect bar arrives while BTCUSDT is still fetching
    let w = window(&["BTCUSDT", "ETHUSDT"], t0, t0 + 12 * MIN);
    let (report, ()) = tokio::join!(
        h.recovery.recover(&w, t0 + 13 * MIN),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.recovery.note_bar_end("ETHUSDT", t0 + 13 * MIN);
        }
    );

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.bars_missing, 24);
    assert_eq!(report.bars_recovered, 24);
    assert_eq!(h.store.bars_for("BTCUSDT", MIN).len(), 12);
    assert_eq!(h.store.bars_for("ETHUSDT", MIN).len(), 12);
    assert_eq!(h.recovery.last_known_end("ETHUSDT"), Some(t0 + 13 * MIN));
}
