use kline_ledger::model::bar::{Bar, Provenance};
use kline_ledger::model::pattern::PatternType;
use kline_ledger::pattern::detect;

fn candle(open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: "BTCUSDT".to_string(),
        interval_ms: 60_000,
        open_time: 1_709_305_200_000,
        close_time: 1_709_305_260_000,
        open,
        high,
        low,
        close,
        volume: 5.0,
        quote_volume: 500.0,
        trade_count: 42,
        taker_buy_base_volume: 2.0,
        taker_buy_quote_volume: 200.0,
        provenance: Provenance::Stream,
        derived: None,
    }
}

#[test]
fn long_upper_wick_bearish_bar_is_sell_reversal() {
    let p = detect(&candle(103.0, 115.0, 102.0, 100.0)).expect("sell reversal");
    assert_eq!(p.pattern_type, PatternType::SellReversal);
    assert!((p.body_percent - 20.0).abs() < 1e-9);
    assert!((p.upper_wick_percent - 80.0).abs() < 1e-9);
    assert!(p.lower_wick_percent.abs() < 1e-9);
    assert!((p.stop_loss_price - 115.0).abs() < 1e-9);
    assert!((p.stop_loss_risk_percent - 15.0).abs() < 1e-9);
    assert!(p.confidence > 0.0 && p.confidence <= 100.0);
}

#[test]
fn large_body_is_rejected() {
    assert!(detect(&candle(100.0, 110.0, 98.0, 108.0)).is_none());
}

#[test]
fn symmetric_wicks_are_rejected() {
    assert!(detect(&candle(100.0, 102.0, 98.0, 100.5)).is_none());
}

#[test]
fn upper_wick_above_five_percent_blocks_buy_reversal() {
    // lower wick 66.7%, upper wick 13.3%
    assert!(detect(&candle(100.0, 105.0, 90.0, 103.0)).is_none());
}

#[test]
fn hammer_is_buy_reversal() {
    let p = detect(&candle(100.0, 100.2, 97.0, 100.1)).expect("buy reversal");
    assert_eq!(p.pattern_type, PatternType::BuyReversal);
    assert!(p.body_percent < 23.0);
    assert!(p.upper_wick_percent <= 5.0);
    assert!(p.lower_wick_percent >= 30.0);
    assert!(p.body_position_percent >= 50.0);
    assert!((p.stop_loss_price - 97.0).abs() < 1e-9);
}

#[test]
fn stop_risk_below_floor_is_rejected() {
    // (100.0 - 99.65) / 100.0 = 0.35%
    assert!(detect(&candle(99.98, 100.0, 99.65, 100.0)).is_none());

    let p = detect(&candle(99.98, 100.0, 99.5, 100.0)).expect("risk 0.5% passes");
    assert_eq!(p.pattern_type, PatternType::BuyReversal);
    assert!((p.stop_loss_risk_percent - 0.5).abs() < 1e-9);
}

#[test]
fn flat_bar_is_none() {
    assert!(detect(&candle(100.0, 100.0, 100.0, 100.0)).is_none());
}

#[test]
fn doji_with_long_lower_wick_is_buy_reversal() {
    let p = detect(&candle(100.0, 100.1, 98.0, 100.0)).expect("doji hammer");
    assert_eq!(p.pattern_type, PatternType::BuyReversal);
    assert!(p.body_percent.abs() < 1e-9);
}

#[test]
fn confidence_is_deterministic_and_rounded() {
    let a = detect(&candle(103.0, 115.0, 102.0, 100.0)).unwrap();
    let b = detect(&candle(103.0, 115.0, 102.0, 100.0)).unwrap();
    assert_eq!(a.confidence, b.confidence);
    assert_eq!((a.confidence * 10.0).round() / 10.0, a.confidence);
}
