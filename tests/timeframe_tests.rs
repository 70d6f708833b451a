use chrono::{TimeZone, Utc};

use kline_ledger::timeframe::{floor_to_base, Interval, Timeframe};

fn at(day: u32, h: u32, m: u32, s: u32) -> u64 {
    Utc.with_ymd_and_hms(2024, 3, day, h, m, s)
        .single()
        .expect("valid timestamp")
        .timestamp_millis() as u64
}

fn tf(label: &str) -> Timeframe {
    Timeframe::parse(label).expect("valid timeframe")
}

#[test]
fn seven_minute_slice_starts_on_the_hour() {
    let iv = tf("7m").interval_containing(at(1, 15, 3, 11));
    assert_eq!(
        iv,
        Interval {
            start_ms: at(1, 15, 0, 0),
            end_ms: at(1, 15, 7, 0)
        }
    );
}

#[test]
fn alignment_does_not_depend_on_evaluation_time() {
    let seven = tf("7m");
    let live = seven.interval_containing(at(1, 15, 3, 11));

    // recomputed later over the whole afternoon
    let later = seven.intervals_between(at(1, 14, 0, 0), at(1, 16, 45, 0));
    assert!(later.contains(&live));
    let next_day = seven.interval_containing(at(2, 15, 3, 11));
    assert_eq!(next_day.start_ms - live.start_ms, 86_400_000);
    assert_eq!(next_day.end_ms - live.end_ms, 86_400_000);
}

#[test]
fn last_slice_of_cycle_is_truncated() {
    let seven = tf("7m");
    let tail = seven.interval_containing(at(1, 15, 58, 0));
    assert_eq!(tail.start_ms, at(1, 15, 56, 0));
    assert_eq!(tail.end_ms, at(1, 16, 0, 0));
    assert_eq!(tail.expected_base_bars(), 4);
    assert_eq!(seven.completed_at(at(1, 16, 0, 0)), Some(tail));
}

#[test]
fn completed_only_on_exact_boundaries() {
    let five = tf("5m");
    assert_eq!(
        five.completed_at(at(1, 10, 5, 0)),
        Some(Interval {
            start_ms: at(1, 10, 0, 0),
            end_ms: at(1, 10, 5, 0)
        })
    );
    assert_eq!(five.completed_at(at(1, 10, 6, 0)), None);
    assert_eq!(five.completed_at(at(1, 10, 5, 30)), None);
}

#[test]
fn hour_multiples_anchor_at_midnight() {
    let four_h = tf("4h");
    let iv = four_h.interval_containing(at(1, 5, 30, 0));
    assert_eq!(iv.start_ms, at(1, 4, 0, 0));
    assert_eq!(iv.end_ms, at(1, 8, 0, 0));

    let day = tf("1d");
    assert_eq!(
        day.completed_at(at(2, 0, 0, 0)),
        Some(Interval {
            start_ms: at(1, 0, 0, 0),
            end_ms: at(2, 0, 0, 0)
        })
    );
    assert_eq!(day.completed_at(at(1, 23, 59, 0)), None);
}

#[test]
fn intervals_between_lists_only_finished_slices() {
    let fifteen = tf("15m");
    let ivs = fifteen.intervals_between(at(1, 10, 7, 0), at(1, 11, 0, 0));
    let starts: Vec<u64> = ivs.iter().map(|iv| iv.start_ms).collect();
    assert_eq!(
        starts,
        vec![
            at(1, 10, 0, 0),
            at(1, 10, 15, 0),
            at(1, 10, 30, 0),
            at(1, 10, 45, 0)
        ]
    );

    // the 11:00 slice has not ended by 11:10
    let partial = fifteen.intervals_between(at(1, 10, 50, 0), at(1, 11, 10, 0));
    assert_eq!(partial.len(), 1);
}

#[test]
fn floor_to_base_drops_seconds() {
    assert_eq!(floor_to_base(at(1, 15, 3, 11)), at(1, 15, 3, 0));
    assert_eq!(floor_to_base(at(1, 15, 3, 0)), at(1, 15, 3, 0));
}
