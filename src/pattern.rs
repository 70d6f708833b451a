//! Single-bar reversal detection.
//!
//! A reversal is a small body pushed to one end of the range with a long
//! wick on the other side and almost no wick on the body side. Buy
//! reversals have the long wick below (rejection of lower prices), sell
//! reversals above.

use crate::model::bar::Bar;
use crate::model::pattern::{Pattern, PatternType};

/// Body at or above this share of the range is not a reversal.
pub const MAX_BODY_PERCENT: f64 = 23.0;
/// Body-side wick may not exceed this share of the range.
pub const MAX_OPPOSITE_WICK_PERCENT: f64 = 5.0;
/// Rejection wick must cover at least this share of the range.
pub const MIN_REJECTION_WICK_PERCENT: f64 = 30.0;
/// Stops closer than this to the close are too tight to trade.
pub const MIN_STOP_RISK_PERCENT: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyColor {
    Bullish,
    Bearish,
    Doji,
}

/// Percent measurements of one bar's geometry.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    high: f64,
    low: f64,
    range: f64,
    body_percent: f64,
    upper_wick_percent: f64,
    lower_wick_percent: f64,
    color: BodyColor,
}

impl Geometry {
    fn of(bar: &Bar) -> Option<Self> {
        let (open, close) = (bar.open, bar.close);
        // Upstream data occasionally reports a close outside [low, high].
        let high = bar.high.max(open).max(close);
        let low = bar.low.min(open).min(close);
        let range = high - low;
        if !range.is_finite() || range <= 0.0 {
            return None;
        }

        let body = (close - open).abs();
        let upper_wick = (high - open.max(close)).max(0.0);
        let lower_wick = (open.min(close) - low).max(0.0);
        let color = if close > open {
            BodyColor::Bullish
        } else if close < open {
            BodyColor::Bearish
        } else {
            BodyColor::Doji
        };

        Some(Self {
            high,
            low,
            range,
            body_percent: body / range * 100.0,
            upper_wick_percent: upper_wick / range * 100.0,
            lower_wick_percent: lower_wick / range * 100.0,
            color,
        })
    }
}

/// Classify `bar` as a buy or sell reversal, or `None`.
pub fn detect(bar: &Bar) -> Option<Pattern> {
    let g = Geometry::of(bar)?;
    if g.body_percent >= MAX_BODY_PERCENT {
        return None;
    }
    detect_buy(bar, &g).or_else(|| detect_sell(bar, &g))
}

fn detect_buy(bar: &Bar, g: &Geometry) -> Option<Pattern> {
    if g.lower_wick_percent <= g.upper_wick_percent
        || g.upper_wick_percent > MAX_OPPOSITE_WICK_PERCENT
        || g.color == BodyColor::Bearish
        || g.lower_wick_percent < MIN_REJECTION_WICK_PERCENT
    {
        return None;
    }
    let body_position = (bar.open.min(bar.close) - g.low) / g.range * 100.0;
    if body_position < 50.0 {
        return None;
    }
    let stop_loss = g.low;
    let risk = (bar.close - stop_loss) / bar.close * 100.0;
    if !risk.is_finite() || risk < MIN_STOP_RISK_PERCENT {
        return None;
    }

    Some(Pattern {
        pattern_type: PatternType::BuyReversal,
        body_percent: g.body_percent,
        upper_wick_percent: g.upper_wick_percent,
        lower_wick_percent: g.lower_wick_percent,
        body_position_percent: body_position,
        confidence: confidence(
            g.body_percent,
            g.lower_wick_percent,
            g.upper_wick_percent,
            (body_position - 50.0) / 50.0,
        ),
        stop_loss_price: stop_loss,
        stop_loss_risk_percent: risk,
    })
}

fn detect_sell(bar: &Bar, g: &Geometry) -> Option<Pattern> {
    if g.upper_wick_percent <= g.lower_wick_percent
        || g.lower_wick_percent > MAX_OPPOSITE_WICK_PERCENT
        || g.color == BodyColor::Bullish
        || g.upper_wick_percent < MIN_REJECTION_WICK_PERCENT
    {
        return None;
    }
    let body_position = (bar.open.max(bar.close) - g.low) / g.range * 100.0;
    if body_position > 50.0 {
        return None;
    }
    let stop_loss = g.high;
    let risk = (stop_loss - bar.close) / bar.close * 100.0;
    if !risk.is_finite() || risk < MIN_STOP_RISK_PERCENT {
        return None;
    }

    Some(Pattern {
        pattern_type: PatternType::SellReversal,
        body_percent: g.body_percent,
        upper_wick_percent: g.upper_wick_percent,
        lower_wick_percent: g.lower_wick_percent,
        body_position_percent: body_position,
        confidence: confidence(
            g.body_percent,
            g.upper_wick_percent,
            g.lower_wick_percent,
            (50.0 - body_position) / 50.0,
        ),
        stop_loss_price: stop_loss,
        stop_loss_risk_percent: risk,
    })
}

/// Weighted 0..=100 score. `position` is the favorable body-position share in 0..=1.
fn confidence(body_pct: f64, rejection_wick_pct: f64, opposite_wick_pct: f64, position: f64) -> f64 {
    let body = (1.0 - body_pct / MAX_BODY_PERCENT).clamp(0.0, 1.0);
    let wick = ((rejection_wick_pct - MIN_REJECTION_WICK_PERCENT)
        / (100.0 - MIN_REJECTION_WICK_PERCENT))
        .clamp(0.0, 1.0);
    let opposite = (1.0 - opposite_wick_pct / MAX_OPPOSITE_WICK_PERCENT).clamp(0.0, 1.0);
    let position = position.clamp(0.0, 1.0);

    let score = (body * 0.30 + wick * 0.35 + opposite * 0.15 + position * 0.20) * 100.0;
    (score.clamp(0.0, 100.0) * 10.0).round() / 10.0
}
