//! Backfill of base bars missed while the stream was down.

use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::aggregation::AggregationEngine;
use crate::config::RecoveryConfig;
use crate::error::AppError;
use crate::event::GapWindow;
use crate::model::bar::{Bar, Provenance};
use crate::source::HistoricalBarSource;
use crate::store::{record_bar, BarStore, PatternStore, UpsertOutcome};
use crate::timeframe::{floor_to_base, fmt_ms, BASE_INTERVAL_MS};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub symbols: Vec<String>,
    pub disconnected_at_ms: u64,
    pub reconnected_at_ms: u64,
    /// Boundaries found missing across all symbols.
    pub bars_missing: u64,
    pub bars_recovered: u64,
    pub patterns_detected: u64,
    pub derived_built: u64,
    pub errors: Vec<String>,
    /// Downtime was shorter than one base interval.
    pub skipped: bool,
}

#[derive(Debug, Default)]
struct SymbolRecovery {
    missing: u64,
    recovered: u64,
    patterns: u64,
    errors: Vec<String>,
    /// `[first missing open, last missing close)`.
    span: Option<(u64, u64)>,
}

/// Base-interval open times in `[from_ms, until_ms)` that are not in `present`.
///
/// `from_ms` is floored to the base interval; a boundary counts only if its
/// whole bar ended by `until_ms`.
pub fn missing_boundaries(from_ms: u64, until_ms: u64, present: &BTreeSet<u64>) -> Vec<u64> {
    let mut out = Vec::new();
    let mut t = floor_to_base(from_ms);
    while t + BASE_INTERVAL_MS <= until_ms {
        if !present.contains(&t) {
            out.push(t);
        }
        t += BASE_INTERVAL_MS;
    }
    out
}

/// Group sorted boundaries into contiguous `[start, end)` ranges of at most
/// `max_bars` bars each.
pub fn group_ranges(boundaries: &[u64], max_bars: usize) -> Vec<(u64, u64)> {
    let max_bars = max_bars.max(1);
    let mut out: Vec<(u64, u64)> = Vec::new();
    let mut len = 0usize;
    for &t in boundaries {
        match out.last_mut() {
            Some((_, end)) if *end == t && len < max_bars => {
                *end = t + BASE_INTERVAL_MS;
                len += 1;
            }
            _ => {
                out.push((t, t + BASE_INTERVAL_MS));
                len = 1;
            }
        }
    }
    out
}

pub struct GapRecovery {
    bars: Arc<dyn BarStore>,
    patterns: Arc<dyn PatternStore>,
    history: Arc<dyn HistoricalBarSource>,
    aggregation: Arc<AggregationEngine>,
    cfg: RecoveryConfig,
    last_known: Mutex<HashMap<String, u64>>,
}

impl GapRecovery {
    pub fn new(
        bars: Arc<dyn BarStore>,
        patterns: Arc<dyn PatternStore>,
        history: Arc<dyn HistoricalBarSource>,
        aggregation: Arc<AggregationEngine>,
        cfg: RecoveryConfig,
    ) -> Self {
        Self {
            bars,
            patterns,
            history,
            aggregation,
            cfg,
            last_known: Mutex::new(HashMap::new()),
        }
    }

    /// Remember the newest base-bar end seen for `symbol`.
    pub fn note_bar_end(&self, symbol: &str, close_time: u64) {
        let mut map = self.last_known.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(symbol.to_string()).or_insert(close_time);
        if close_time > *entry {
            *entry = close_time;
        }
    }

    pub fn last_known_end(&self, symbol: &str) -> Option<u64> {
        self.last_known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .copied()
    }

    /// Last known base-bar ends of `symbols`, read together.
    pub fn last_known_ends(&self, symbols: &[String]) -> HashMap<String, u64> {
        let map = self.last_known.lock().unwrap_or_else(|e| e.into_inner());
        symbols
            .iter()
            .filter_map(|s| map.get(s).map(|end| (s.clone(), *end)))
            .collect()
    }

    /// Recover `window`, starting each symbol from its last known end as of
    /// this call.
    pub async fn recover(&self, window: &GapWindow, now_ms: u64) -> RecoveryReport {
        let starts = self.last_known_ends(&window.symbols);
        self.recover_from(window, &starts, now_ms).await
    }

    /// Recover `window` from `starts`, captured when the reconnect was seen.
    /// Live bars noted after that point do not move the scan start.
    pub async fn recover_from(
        &self,
        window: &GapWindow,
        starts: &HashMap<String, u64>,
        now_ms: u64,
    ) -> RecoveryReport {
        let mut report = RecoveryReport {
            symbols: window.symbols.clone(),
            disconnected_at_ms: window.disconnected_at_ms,
            reconnected_at_ms: window.reconnected_at_ms,
            ..RecoveryReport::default()
        };
        if window.downtime_ms() < BASE_INTERVAL_MS {
            tracing::debug!(downtime_ms = window.downtime_ms(), "Downtime below one bar, no recovery");
            report.skipped = true;
            return report;
        }

        tracing::info!(
            symbols = window.symbols.len(),
            from = %fmt_ms(window.disconnected_at_ms),
            to = %fmt_ms(window.reconnected_at_ms),
            "Gap recovery started"
        );

        let results: Vec<(String, SymbolRecovery)> = stream::iter(window.symbols.iter().cloned())
            .map(|symbol| async move {
                let known = starts.get(&symbol).copied();
                let result = self.recover_symbol(&symbol, window, known).await;
                (symbol, result)
            })
            .buffer_unordered(self.cfg.max_concurrent_fetches.max(1))
            .collect()
            .await;

        let mut spans = Vec::new();
        for (symbol, result) in results {
            report.bars_missing += result.missing;
            report.bars_recovered += result.recovered;
            report.patterns_detected += result.patterns;
            report.errors.extend(result.errors);
            if let Some(span) = result.span {
                spans.push((symbol, span));
            }
        }

        // Derived intervals over a recovered span may have been deferred.
        let recheck_until = floor_to_base(now_ms);
        for (symbol, (start, end)) in spans {
            let outcomes = self
                .aggregation
                .recheck_range(&symbol, start, recheck_until.max(end), now_ms)
                .await;
            report.derived_built += outcomes.iter().filter(|(_, _, o)| o.is_built()).count() as u64;
        }

        tracing::info!(
            missing = report.bars_missing,
            recovered = report.bars_recovered,
            patterns = report.patterns_detected,
            derived = report.derived_built,
            errors = report.errors.len(),
            "Gap recovery finished"
        );
        report
    }

    async fn recover_symbol(
        &self,
        symbol: &str,
        window: &GapWindow,
        known_end: Option<u64>,
    ) -> SymbolRecovery {
        let mut out = SymbolRecovery::default();

        let from = match known_end {
            Some(end) => end,
            None => match self.bars.latest_close_time(symbol, BASE_INTERVAL_MS).await {
                Ok(Some(end)) => end,
                Ok(None) => floor_to_base(window.disconnected_at_ms),
                Err(e) => {
                    out.errors.push(format!("{}: last known bar lookup failed: {}", symbol, e));
                    floor_to_base(window.disconnected_at_ms)
                }
            },
        };
        let until = window.reconnected_at_ms;
        if from >= until {
            return out;
        }

        let present: BTreeSet<u64> = match self
            .bars
            .range(symbol, BASE_INTERVAL_MS, floor_to_base(from), until)
            .await
        {
            Ok(bars) => bars.iter().map(|b| b.open_time).collect(),
            Err(e) => {
                out.errors.push(format!("{}: stored bar scan failed: {}", symbol, e));
                BTreeSet::new()
            }
        };
        let missing = missing_boundaries(from, until, &present);
        let (Some(&first), Some(&last)) = (missing.first(), missing.last()) else {
            return out;
        };
        out.missing = missing.len() as u64;
        out.span = Some((first, last + BASE_INTERVAL_MS));

        let ranges = group_ranges(&missing, self.cfg.bars_per_request);
        tracing::info!(
            symbol,
            missing = missing.len(),
            ranges = ranges.len(),
            "Fetching missing base bars"
        );

        for (start, end) in ranges {
            let fetched = match self.fetch_with_retry(symbol, start, end).await {
                Ok(bars) => bars,
                Err(e) => {
                    tracing::warn!(symbol, from = %fmt_ms(start), to = %fmt_ms(end), error = %e, "Gap fetch failed");
                    out.errors.push(format!(
                        "{} {}..{}: {}",
                        symbol,
                        fmt_ms(start),
                        fmt_ms(end),
                        e
                    ));
                    continue;
                }
            };
            if fetched.is_empty() {
                tracing::warn!(symbol, from = %fmt_ms(start), to = %fmt_ms(end), "No historical data for gap range");
                continue;
            }

            let mut wanted: BTreeSet<u64> = missing
                .iter()
                .copied()
                .filter(|t| *t >= start && *t < end)
                .collect();
            for bar in fetched {
                let Some(slot) = self.match_boundary(&wanted, bar.open_time) else {
                    continue;
                };
                wanted.remove(&slot);
                let bar = Bar {
                    symbol: symbol.to_string(),
                    open_time: slot,
                    close_time: slot + BASE_INTERVAL_MS,
                    interval_ms: BASE_INTERVAL_MS,
                    ..bar
                }
                .with_provenance(Provenance::GapRecovery);

                match record_bar(self.bars.as_ref(), self.patterns.as_ref(), &bar).await {
                    Ok(recorded) => {
                        if recorded.outcome != UpsertOutcome::Unchanged {
                            out.recovered += 1;
                        }
                        if recorded.pattern.is_some() {
                            out.patterns += 1;
                        }
                        self.note_bar_end(symbol, bar.close_time);
                    }
                    Err(e) => {
                        tracing::error!(key = %bar.key(), error = %e, "Failed to store recovered bar");
                        out.errors.push(format!("{}: store failed: {}", bar.key(), e));
                    }
                }
            }
            if !wanted.is_empty() {
                tracing::warn!(symbol, unfilled = wanted.len(), "Gap range partially filled");
            }
        }
        out
    }

    fn match_boundary(&self, wanted: &BTreeSet<u64>, open_time: u64) -> Option<u64> {
        let tol = self.cfg.match_tolerance_ms;
        wanted
            .range(open_time.saturating_sub(tol)..=open_time.saturating_add(tol))
            .min_by_key(|t| t.abs_diff(open_time))
            .copied()
    }

    /// One retry after a delay for transient failures. Rate-limit bans and
    /// permanent API errors are not retried.
    async fn fetch_with_retry(
        &self,
        symbol: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<Bar>, AppError> {
        match self.history.fetch_bars(symbol, start, end).await {
            Ok(bars) => Ok(bars),
            Err(e) if e.is_rate_limited() || !e.is_retryable() => Err(e),
            Err(e) => {
                tracing::warn!(symbol, error = %e, "Gap fetch failed, retrying once");
                tokio::time::sleep(Duration::from_millis(self.cfg.retry_delay_ms)).await;
                self.history.fetch_bars(symbol, start, end).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_699_999_980_000;

    #[test]
    fn missing_skips_present_and_partial_tail() {
        let present: BTreeSet<u64> = [T0 + 60_000].into_iter().collect();
        let missing = missing_boundaries(T0, T0 + 3 * 60_000 + 30_000, &present);
        assert_eq!(missing, vec![T0, T0 + 120_000]);
    }

    #[test]
    fn ranges_split_on_holes_and_page_size() {
        let b: Vec<u64> = [0, 1, 2, 4, 5].iter().map(|m| T0 + m * 60_000).collect();
        assert_eq!(
            group_ranges(&b, 1_000),
            vec![(T0, T0 + 180_000), (T0 + 240_000, T0 + 360_000)]
        );
        assert_eq!(
            group_ranges(&b, 2),
            vec![
                (T0, T0 + 120_000),
                (T0 + 120_000, T0 + 180_000),
                (T0 + 240_000, T0 + 360_000)
            ]
        );
    }
}
