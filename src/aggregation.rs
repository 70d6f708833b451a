//! Derived-bar builder.
//!
//! Every configured timeframe is checked when a base bar closes on one of
//! its boundaries. A derived bar is built only from settled base bars, only
//! when enough of them exist, and at most once per key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::AggregationConfig;
use crate::expiring::ExpiringKeys;
use crate::model::bar::{aggregate_bars, Bar, BarKey};
use crate::model::pattern::Pattern;
use crate::store::{record_bar, BarStore, PatternStore};
use crate::timeframe::{fmt_ms, Interval, Timeframe, BASE_INTERVAL_MS};

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Built { bar: Bar, pattern: Option<Pattern> },
    /// A bar already exists in the store at this key.
    AlreadyBuilt,
    /// Another caller holds the generation lock.
    InFlight,
    /// Built by this engine within the retention window.
    RecentlyCompleted,
    /// Not enough settled base bars yet. Retried on the next trigger.
    Deferred { have: u64, need: u64 },
    /// Store read or write failed for this key only.
    Failed { error: String },
}

impl BuildOutcome {
    pub fn is_built(&self) -> bool {
        matches!(self, Self::Built { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationStats {
    pub built: u64,
    pub deferred: u64,
    pub duplicates_skipped: u64,
    pub detector_runs: u64,
    pub storage_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    built: AtomicU64,
    deferred: AtomicU64,
    duplicates_skipped: AtomicU64,
    detector_runs: AtomicU64,
    storage_failures: AtomicU64,
}

pub struct AggregationEngine {
    bars: Arc<dyn BarStore>,
    patterns: Arc<dyn PatternStore>,
    timeframes: Vec<Timeframe>,
    sufficiency_percent: u64,
    settle_grace_ms: u64,
    in_flight: ExpiringKeys<BarKey>,
    completed: ExpiringKeys<BarKey>,
    counters: Counters,
}

impl AggregationEngine {
    pub fn new(
        bars: Arc<dyn BarStore>,
        patterns: Arc<dyn PatternStore>,
        timeframes: Vec<Timeframe>,
        cfg: &AggregationConfig,
    ) -> Self {
        let retention_ms = cfg.lock_retention_secs.saturating_mul(1_000);
        Self {
            bars,
            patterns,
            timeframes,
            sufficiency_percent: cfg.sufficiency_percent.clamp(1, 100),
            settle_grace_ms: cfg.settle_grace_ms,
            in_flight: ExpiringKeys::new(retention_ms),
            completed: ExpiringKeys::new(retention_ms),
            counters: Counters::default(),
        }
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    pub fn stats(&self) -> AggregationStats {
        AggregationStats {
            built: self.counters.built.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            duplicates_skipped: self.counters.duplicates_skipped.load(Ordering::Relaxed),
            detector_runs: self.counters.detector_runs.load(Ordering::Relaxed),
            storage_failures: self.counters.storage_failures.load(Ordering::Relaxed),
        }
    }

    /// Boundary check for one finalized base bar: build every timeframe whose
    /// interval ends where this bar ends.
    pub async fn on_base_bar_finalized(
        &self,
        bar: &Bar,
        now_ms: u64,
    ) -> Vec<(Timeframe, BuildOutcome)> {
        if bar.interval_ms != BASE_INTERVAL_MS {
            return Vec::new();
        }
        let mut out = Vec::new();
        for &tf in &self.timeframes {
            if let Some(interval) = tf.completed_at(bar.close_time) {
                let outcome = self.try_build(&bar.symbol, tf, interval, now_ms).await;
                out.push((tf, outcome));
            }
        }
        out
    }

    /// Re-run the boundary check for every interval overlapping
    /// `[start_ms, end_ms)` that has ended by `end_ms`.
    pub async fn recheck_range(
        &self,
        symbol: &str,
        start_ms: u64,
        end_ms: u64,
        now_ms: u64,
    ) -> Vec<(Timeframe, Interval, BuildOutcome)> {
        let mut out = Vec::new();
        for &tf in &self.timeframes {
            for interval in tf.intervals_between(start_ms, end_ms) {
                let outcome = self.try_build(symbol, tf, interval, now_ms).await;
                out.push((tf, interval, outcome));
            }
        }
        let built = out.iter().filter(|(_, _, o)| o.is_built()).count();
        tracing::debug!(
            symbol,
            from = %fmt_ms(start_ms),
            to = %fmt_ms(end_ms),
            checked = out.len(),
            built,
            "Derived bar re-check"
        );
        out
    }

    pub async fn try_build(
        &self,
        symbol: &str,
        tf: Timeframe,
        interval: Interval,
        now_ms: u64,
    ) -> BuildOutcome {
        let key = BarKey::new(symbol, tf.interval_ms(), interval.start_ms);

        if let Some(outcome) = self.existing(&key, now_ms).await {
            return outcome;
        }

        if !self.in_flight.try_insert(key.clone(), now_ms) {
            self.counters.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            return BuildOutcome::InFlight;
        }

        // A build of the same key may have finished between the check and the lock.
        let outcome = match self.existing(&key, now_ms).await {
            Some(outcome) => outcome,
            None => self.build_locked(&key, tf, interval, now_ms).await,
        };
        self.in_flight.remove(&key);
        if outcome.is_built() {
            self.completed.insert(key, now_ms);
        }
        outcome
    }

    /// `Some` when `key` was built recently or is already stored.
    async fn existing(&self, key: &BarKey, now_ms: u64) -> Option<BuildOutcome> {
        if self.completed.contains(key, now_ms) {
            self.counters.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            return Some(BuildOutcome::RecentlyCompleted);
        }
        match self.bars.find(key).await {
            Ok(Some(_)) => {
                self.counters.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                self.completed.insert(key.clone(), now_ms);
                Some(BuildOutcome::AlreadyBuilt)
            }
            Ok(None) => None,
            Err(e) => Some(self.storage_failure(key, e.to_string())),
        }
    }

    async fn build_locked(
        &self,
        key: &BarKey,
        tf: Timeframe,
        interval: Interval,
        now_ms: u64,
    ) -> BuildOutcome {
        let base = match self
            .bars
            .range(&key.symbol, BASE_INTERVAL_MS, interval.start_ms, interval.end_ms)
            .await
        {
            Ok(bars) => bars,
            Err(e) => return self.storage_failure(key, e.to_string()),
        };
        let settled: Vec<Bar> = base
            .into_iter()
            .filter(|b| b.is_settled(now_ms, self.settle_grace_ms))
            .collect();

        let expected = interval.expected_base_bars();
        let have = settled.len() as u64;
        if have * 100 < expected * self.sufficiency_percent {
            let need = (expected * self.sufficiency_percent).div_ceil(100);
            self.counters.deferred.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                symbol = %key.symbol,
                timeframe = %tf,
                interval = %interval,
                have,
                need,
                "Insufficient base bars, deferring"
            );
            return BuildOutcome::Deferred { have, need };
        }

        let Some(bar) = aggregate_bars(
            &key.symbol,
            tf.interval_ms(),
            interval.start_ms,
            interval.end_ms,
            &settled,
        ) else {
            return BuildOutcome::Deferred { have, need: 1 };
        };

        match record_bar(self.bars.as_ref(), self.patterns.as_ref(), &bar).await {
            Ok(recorded) => {
                self.counters.built.fetch_add(1, Ordering::Relaxed);
                if recorded.detected {
                    self.counters.detector_runs.fetch_add(1, Ordering::Relaxed);
                }
                tracing::info!(
                    symbol = %key.symbol,
                    timeframe = %tf,
                    interval = %interval,
                    source_bars = have,
                    pattern = recorded.pattern.as_ref().map(|p| p.pattern_type.as_str()),
                    "Derived bar built"
                );
                BuildOutcome::Built {
                    bar,
                    pattern: recorded.pattern,
                }
            }
            Err(e) => self.storage_failure(key, e.to_string()),
        }
    }

    fn storage_failure(&self, key: &BarKey, error: String) -> BuildOutcome {
        self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(key = %key, error = %error, "Derived bar storage failed");
        BuildOutcome::Failed { error }
    }
}
