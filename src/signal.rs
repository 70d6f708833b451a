//! Scoring of detected patterns into trade signals.
//!
//! Volume profiling and scoring are supplied by the caller. A missing or
//! failed volume profile lowers the score; it never drops the signal.

use std::sync::Arc;

use serde::Serialize;

use crate::error::AppError;
use crate::model::bar::Bar;
use crate::model::pattern::{Pattern, PatternType};
use crate::model::trade::Trade;
use crate::source::TradeTickSource;

/// Volume-at-price summary of one bar's trades.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeProfile {
    /// Point of control.
    pub poc: f64,
    /// Value-area high.
    pub vah: f64,
    /// Value-area low.
    pub val: f64,
    pub total_volume: f64,
    pub value_area_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalAssessment {
    pub is_valid: bool,
    pub signal_type: PatternType,
    pub score: f64,
    pub reason: String,
}

pub trait VolumeProfiler: Send + Sync {
    fn compute(&self, trades: &[Trade]) -> Result<VolumeProfile, AppError>;
}

pub trait SignalScorer: Send + Sync {
    fn score(
        &self,
        bar: &Bar,
        profile: Option<&VolumeProfile>,
        pattern_type: PatternType,
    ) -> SignalAssessment;
}

pub struct SignalStage {
    trades: Arc<dyn TradeTickSource>,
    profiler: Arc<dyn VolumeProfiler>,
    scorer: Arc<dyn SignalScorer>,
}

impl SignalStage {
    pub fn new(
        trades: Arc<dyn TradeTickSource>,
        profiler: Arc<dyn VolumeProfiler>,
        scorer: Arc<dyn SignalScorer>,
    ) -> Self {
        Self {
            trades,
            profiler,
            scorer,
        }
    }

    pub async fn evaluate(&self, bar: &Bar, pattern: &Pattern) -> SignalAssessment {
        let profile = self.profile_for(bar).await;
        let assessment = self
            .scorer
            .score(bar, profile.as_ref(), pattern.pattern_type);
        tracing::info!(
            key = %bar.key(),
            signal = %assessment.signal_type,
            valid = assessment.is_valid,
            score = assessment.score,
            with_profile = profile.is_some(),
            "Pattern scored"
        );
        assessment
    }

    async fn profile_for(&self, bar: &Bar) -> Option<VolumeProfile> {
        let trades = match self
            .trades
            .fetch_trades(&bar.symbol, bar.open_time, bar.close_time)
            .await
        {
            Ok(trades) => trades,
            Err(e) if e.is_rate_limited() => {
                tracing::warn!(key = %bar.key(), error = %e, "Trade fetch rate limited, scoring without volume profile");
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %bar.key(), error = %e, "Trade fetch failed, scoring without volume profile");
                return None;
            }
        };
        if trades.is_empty() {
            tracing::debug!(key = %bar.key(), "No trades for bar, scoring without volume profile");
            return None;
        }
        match self.profiler.compute(&trades) {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(key = %bar.key(), error = %e, "Volume profile failed");
                None
            }
        }
    }
}
