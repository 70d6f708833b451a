//! Calendar-aligned interval math for derived timeframes.
//!
//! Every timeframe tiles a fixed cycle anchored at UTC midnight. The cycle
//! length always divides a day, so boundaries repeat identically every
//! day no matter when they are computed. Timeframes that divide a day use
//! the whole day as their cycle; the rest restart every hour (or every
//! day when longer than an hour) and the last slice of each cycle is cut
//! short at the cycle end.

use std::fmt;

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};

use crate::config::parse_interval_ms;

pub const MINUTE_MS: u64 = 60_000;
pub const MINUTES_PER_DAY: u64 = 1_440;
pub const DAY_MS: u64 = MINUTES_PER_DAY * MINUTE_MS;
/// Granularity of the upstream stream.
pub const BASE_INTERVAL_MS: u64 = MINUTE_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timeframe {
    minutes: u32,
}

/// Half-open `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Interval {
    /// Base bars a complete interval holds.
    pub fn expected_base_bars(&self) -> u64 {
        (self.end_ms - self.start_ms) / BASE_INTERVAL_MS
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", fmt_ms(self.start_ms), fmt_ms(self.end_ms))
    }
}

impl Timeframe {
    pub fn from_minutes(minutes: u32) -> Result<Self> {
        if minutes < 2 {
            bail!("derived timeframe must be longer than the 1m base, got {}m", minutes);
        }
        if u64::from(minutes) > MINUTES_PER_DAY {
            bail!("derived timeframe must be at most 1d, got {}m", minutes);
        }
        Ok(Self { minutes })
    }

    /// Parse an exchange-style label such as `7m`, `4h` or `1d`.
    pub fn parse(label: &str) -> Result<Self> {
        let ms = parse_interval_ms(label.trim())?;
        if ms % MINUTE_MS != 0 {
            bail!("timeframe '{}' is not a whole number of minutes", label);
        }
        Self::from_minutes((ms / MINUTE_MS) as u32)
    }

    pub fn minutes(self) -> u32 {
        self.minutes
    }

    pub fn interval_ms(self) -> u64 {
        u64::from(self.minutes) * MINUTE_MS
    }

    pub fn label(self) -> String {
        let m = self.minutes;
        if m % 1_440 == 0 {
            format!("{}d", m / 1_440)
        } else if m % 60 == 0 {
            format!("{}h", m / 60)
        } else {
            format!("{}m", m)
        }
    }

    /// Length of the repeating cycle in minutes. Always divides a day.
    pub fn cycle_minutes(self) -> u64 {
        let g = u64::from(self.minutes);
        if MINUTES_PER_DAY % g == 0 {
            MINUTES_PER_DAY
        } else if g < 60 {
            60
        } else {
            MINUTES_PER_DAY
        }
    }

    /// The slice of this timeframe that contains `ts_ms`.
    pub fn interval_containing(self, ts_ms: u64) -> Interval {
        let g = u64::from(self.minutes);
        let cycle = self.cycle_minutes();
        let day_start = ts_ms - ts_ms % DAY_MS;
        let minute_of_day = (ts_ms - day_start) / MINUTE_MS;

        let cycle_start = minute_of_day - minute_of_day % cycle;
        let cycle_pos = minute_of_day % cycle;
        let slice_start = cycle_start + cycle_pos - cycle_pos % g;
        let slice_end = (slice_start + g).min(cycle_start + cycle);

        Interval {
            start_ms: day_start + slice_start * MINUTE_MS,
            end_ms: day_start + slice_end * MINUTE_MS,
        }
    }

    /// The interval that ends exactly at `end_ms`, if `end_ms` is one of this
    /// timeframe's boundaries.
    pub fn completed_at(self, end_ms: u64) -> Option<Interval> {
        if end_ms == 0 || end_ms % MINUTE_MS != 0 {
            return None;
        }
        let interval = self.interval_containing(end_ms - 1);
        (interval.end_ms == end_ms).then_some(interval)
    }

    /// Every interval that overlaps `[start_ms, end_ms)` and has ended by `end_ms`.
    pub fn intervals_between(self, start_ms: u64, end_ms: u64) -> Vec<Interval> {
        let mut out = Vec::new();
        if end_ms <= start_ms {
            return out;
        }
        let mut t = self.interval_containing(start_ms).start_ms;
        loop {
            let interval = self.interval_containing(t);
            if interval.end_ms > end_ms {
                break;
            }
            out.push(interval);
            t = interval.end_ms;
        }
        out
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Floor `ts_ms` to the start of its base interval.
pub fn floor_to_base(ts_ms: u64) -> u64 {
    ts_ms - ts_ms % BASE_INTERVAL_MS
}

pub fn fmt_ms(ts_ms: u64) -> String {
    match Utc.timestamp_millis_opt(ts_ms as i64).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => ts_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_use_largest_whole_unit() {
        assert_eq!(Timeframe::parse("7m").unwrap().label(), "7m");
        assert_eq!(Timeframe::parse("60m").unwrap().label(), "1h");
        assert_eq!(Timeframe::parse("4h").unwrap().label(), "4h");
        assert_eq!(Timeframe::parse("1d").unwrap().label(), "1d");
    }

    #[test]
    fn rejects_base_and_multi_day() {
        assert!(Timeframe::parse("1m").is_err());
        assert!(Timeframe::parse("2d").is_err());
        assert!(Timeframe::parse("30s").is_err());
    }

    #[test]
    fn cycle_always_divides_a_day() {
        for m in 2..=1_440u32 {
            let tf = Timeframe::from_minutes(m).unwrap();
            assert_eq!(MINUTES_PER_DAY % tf.cycle_minutes(), 0, "{}m", m);
        }
    }
}
