//! Bar and pattern persistence.
//!
//! Writes are idempotent upserts keyed on `(symbol, interval, open_time)`;
//! the core never deletes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::AppError;
use crate::model::bar::{Bar, BarKey};
use crate::model::pattern::Pattern;
use crate::pattern;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No bar existed at this key.
    Inserted,
    /// A bar existed with identical OHLC; remaining fields were refreshed.
    Unchanged,
    /// A bar existed with different OHLC and was overwritten.
    Replaced,
}

#[async_trait]
pub trait BarStore: Send + Sync {
    async fn upsert(&self, bar: &Bar) -> Result<UpsertOutcome, AppError>;

    async fn find(&self, key: &BarKey) -> Result<Option<Bar>, AppError>;

    /// Bars with `start_ms <= open_time < end_ms`, ordered by open time.
    async fn range(
        &self,
        symbol: &str,
        interval_ms: u64,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<Bar>, AppError>;

    async fn count(
        &self,
        symbol: &str,
        interval_ms: u64,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<u64, AppError> {
        Ok(self.range(symbol, interval_ms, start_ms, end_ms).await?.len() as u64)
    }

    /// Exclusive end time of the newest stored bar.
    async fn latest_close_time(
        &self,
        symbol: &str,
        interval_ms: u64,
    ) -> Result<Option<u64>, AppError>;
}

#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Store `pattern` unless one already exists. Returns `true` when stored.
    async fn upsert_if_absent(&self, key: &BarKey, pattern: &Pattern) -> Result<bool, AppError>;

    /// Overwrite (or clear) the pattern of a re-priced bar.
    async fn replace(&self, key: &BarKey, pattern: Option<&Pattern>) -> Result<(), AppError>;

    async fn find(&self, key: &BarKey) -> Result<Option<Pattern>, AppError>;
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub outcome: UpsertOutcome,
    /// Pattern stored as a result of this write.
    pub pattern: Option<Pattern>,
    /// Whether the detector ran.
    pub detected: bool,
}

/// Upsert `bar`, then run the detector when its geometry is new.
pub async fn record_bar(
    bars: &dyn BarStore,
    patterns: &dyn PatternStore,
    bar: &Bar,
) -> Result<Recorded, AppError> {
    let outcome = bars.upsert(bar).await?;
    match outcome {
        UpsertOutcome::Unchanged => Ok(Recorded {
            outcome,
            pattern: None,
            detected: false,
        }),
        UpsertOutcome::Inserted => {
            let found = pattern::detect(bar);
            let stored = match &found {
                Some(p) => patterns.upsert_if_absent(&bar.key(), p).await?,
                None => false,
            };
            Ok(Recorded {
                outcome,
                pattern: found.filter(|_| stored),
                detected: true,
            })
        }
        UpsertOutcome::Replaced => {
            let found = pattern::detect(bar);
            patterns.replace(&bar.key(), found.as_ref()).await?;
            Ok(Recorded {
                outcome,
                pattern: found,
                detected: true,
            })
        }
    }
}
