use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BarStore, PatternStore, UpsertOutcome};
use crate::error::AppError;
use crate::model::bar::{Bar, BarKey};
use crate::model::pattern::Pattern;

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bars: Mutex<BTreeMap<BarKey, Bar>>,
    patterns: Mutex<BTreeMap<BarKey, Pattern>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bar_count(&self) -> usize {
        self.bars_guard().len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns_guard().len()
    }

    /// Every stored bar of one symbol and interval, ordered by open time.
    pub fn bars_for(&self, symbol: &str, interval_ms: u64) -> Vec<Bar> {
        self.bars_guard()
            .values()
            .filter(|b| b.symbol == symbol && b.interval_ms == interval_ms)
            .cloned()
            .collect()
    }

    fn bars_guard(&self) -> std::sync::MutexGuard<'_, BTreeMap<BarKey, Bar>> {
        self.bars.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn patterns_guard(&self) -> std::sync::MutexGuard<'_, BTreeMap<BarKey, Pattern>> {
        self.patterns.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BarStore for MemoryStore {
    async fn upsert(&self, bar: &Bar) -> Result<UpsertOutcome, AppError> {
        let mut bars = self.bars_guard();
        let outcome = match bars.get(&bar.key()) {
            None => UpsertOutcome::Inserted,
            Some(prev) if prev.same_prices(bar) => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Replaced,
        };
        bars.insert(bar.key(), bar.clone());
        Ok(outcome)
    }

    async fn find(&self, key: &BarKey) -> Result<Option<Bar>, AppError> {
        Ok(self.bars_guard().get(key).cloned())
    }

    async fn range(
        &self,
        symbol: &str,
        interval_ms: u64,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<Bar>, AppError> {
        if end_ms <= start_ms {
            return Ok(Vec::new());
        }
        let lo = BarKey::new(symbol, interval_ms, start_ms);
        let hi = BarKey::new(symbol, interval_ms, end_ms);
        Ok(self.bars_guard().range(lo..hi).map(|(_, b)| b.clone()).collect())
    }

    async fn latest_close_time(
        &self,
        symbol: &str,
        interval_ms: u64,
    ) -> Result<Option<u64>, AppError> {
        let lo = BarKey::new(symbol, interval_ms, 0);
        let hi = BarKey::new(symbol, interval_ms, u64::MAX);
        Ok(self
            .bars_guard()
            .range(lo..=hi)
            .next_back()
            .map(|(_, b)| b.close_time))
    }
}

#[async_trait]
impl PatternStore for MemoryStore {
    async fn upsert_if_absent(&self, key: &BarKey, pattern: &Pattern) -> Result<bool, AppError> {
        let mut patterns = self.patterns_guard();
        if patterns.contains_key(key) {
            return Ok(false);
        }
        patterns.insert(key.clone(), pattern.clone());
        Ok(true)
    }

    async fn replace(&self, key: &BarKey, pattern: Option<&Pattern>) -> Result<(), AppError> {
        let mut patterns = self.patterns_guard();
        match pattern {
            Some(p) => {
                patterns.insert(key.clone(), p.clone());
            }
            None => {
                patterns.remove(key);
            }
        }
        Ok(())
    }

    async fn find(&self, key: &BarKey) -> Result<Option<Pattern>, AppError> {
        Ok(self.patterns_guard().get(key).cloned())
    }
}
