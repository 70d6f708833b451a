use kline_ledger::model::bar::{Bar, BarKey, Provenance};
use kline_ledger::model::pattern::PatternType;
use kline_ledger::store::{
    record_bar, BarStore, MemoryStore, PatternStore, SqliteStore, UpsertOutcome,
};

const T0: u64 = 1_709_305_200_000;

fn bar(open_time: u64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: "BTCUSDT".to_string(),
        interval_ms: 60_000,
        open_time,
        close_time: open_time + 60_000,
        open,
        high,
        low,
        close,
        volume: 3.0,
        quote_volume: 300.0,
        trade_count: 12,
        taker_buy_base_volume: 1.0,
        taker_buy_quote_volume: 100.0,
        provenance: Provenance::Stream,
        derived: None,
    }
}

async fn idempotent_upsert(store: &dyn BarStore) {
    let b = bar(T0, 100.0, 101.0, 99.0, 100.5);
    assert_eq!(store.upsert(&b).await.unwrap(), UpsertOutcome::Inserted);
    assert_eq!(store.upsert(&b).await.unwrap(), UpsertOutcome::Unchanged);
    assert_eq!(store.count("BTCUSDT", 60_000, T0, T0 + 60_000).await.unwrap(), 1);
    assert_eq!(store.find(&b.key()).await.unwrap(), Some(b));
}

async fn replace_and_range(store: &dyn BarStore) {
    for i in 0..3u64 {
        store
            .upsert(&bar(T0 + i * 60_000, 100.0, 101.0, 99.0, 100.0))
            .await
            .unwrap();
    }
    let changed = bar(T0 + 60_000, 100.0, 101.0, 99.0, 100.7);
    assert_eq!(store.upsert(&changed).await.unwrap(), UpsertOutcome::Replaced);

    let rows = store.range("BTCUSDT", 60_000, T0, T0 + 180_000).await.unwrap();
    let opens: Vec<u64> = rows.iter().map(|b| b.open_time).collect();
    assert_eq!(opens, vec![T0, T0 + 60_000, T0 + 120_000]);
    assert!((rows[1].close - 100.7).abs() < 1e-9);

    assert_eq!(
        store.latest_close_time("BTCUSDT", 60_000).await.unwrap(),
        Some(T0 + 180_000)
    );
    assert_eq!(store.latest_close_time("ETHUSDT", 60_000).await.unwrap(), None);
    assert!(store.range("BTCUSDT", 300_000, T0, T0 + 180_000).await.unwrap().is_empty());
}

#[test]
fn memory_store_upsert_is_idempotent() {
    let store = MemoryStore::new();
    tokio_test::block_on(idempotent_upsert(&store));
    assert_eq!(store.bar_count(), 1);
}

#[test]
fn sqlite_store_upsert_is_idempotent() {
    let store = SqliteStore::open_in_memory().unwrap();
    tokio_test::block_on(idempotent_upsert(&store));
}

#[test]
fn memory_store_replace_and_range() {
    let store = MemoryStore::new();
    tokio_test::block_on(replace_and_range(&store));
}

#[test]
fn sqlite_store_replace_and_range() {
    let store = SqliteStore::open_in_memory().unwrap();
    tokio_test::block_on(replace_and_range(&store));
}

#[test]
fn sqlite_store_round_trips_derived_lineage() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut derived = bar(T0, 100.0, 102.0, 98.0, 101.0);
    derived.interval_ms = 300_000;
    derived.close_time = T0 + 300_000;
    derived.provenance = Provenance::Derived;
    derived.derived = Some(kline_ledger::model::bar::DerivedFrom {
        source_bar_count: 5,
        source_interval_ms: 60_000,
    });

    tokio_test::block_on(async {
        store.upsert(&derived).await.unwrap();
        let loaded = BarStore::find(&store, &derived.key()).await.unwrap().unwrap();
        assert_eq!(loaded, derived);
    });
}

#[test]
fn sqlite_pattern_upsert_if_absent_keeps_first() {
    let store = SqliteStore::open_in_memory().unwrap();
    let b = bar(T0, 103.0, 115.0, 102.0, 100.0);
    let p = kline_ledger::pattern::detect(&b).unwrap();
    let key = b.key();

    tokio_test::block_on(async {
        assert!(store.upsert_if_absent(&key, &p).await.unwrap());
        let mut other = p.clone();
        other.confidence = 1.0;
        assert!(!store.upsert_if_absent(&key, &other).await.unwrap());
        let stored = PatternStore::find(&store, &key).await.unwrap().unwrap();
        assert_eq!(stored, p);

        store.replace(&key, None).await.unwrap();
        assert!(PatternStore::find(&store, &key).await.unwrap().is_none());
    });
}

#[tokio::test]
async fn record_bar_detects_once_and_follows_repricing() {
    let store = MemoryStore::new();
    let hammer = bar(T0, 100.0, 100.2, 97.0, 100.1);

    let first = record_bar(&store, &store, &hammer).await.unwrap();
    assert_eq!(first.outcome, UpsertOutcome::Inserted);
    assert!(first.detected);
    assert_eq!(
        first.pattern.as_ref().map(|p| p.pattern_type),
        Some(PatternType::BuyReversal)
    );

    // identical re-delivery does not re-run detection
    let again = record_bar(&store, &store, &hammer).await.unwrap();
    assert_eq!(again.outcome, UpsertOutcome::Unchanged);
    assert!(!again.detected);
    assert_eq!(store.pattern_count(), 1);

    // re-priced into a large-body bar: pattern cleared
    let repriced = bar(T0, 97.5, 100.2, 97.0, 100.1);
    let third = record_bar(&store, &store, &repriced).await.unwrap();
    assert_eq!(third.outcome, UpsertOutcome::Replaced);
    assert!(third.pattern.is_none());
    let key = BarKey::new("BTCUSDT", 60_000, T0);
    assert!(PatternStore::find(&store, &key).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_store_serves_concurrent_tasks() {
    let store = std::sync::Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut handles = Vec::new();
    for i in 0..16u64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let b = bar(T0 + i * 60_000, 100.0, 101.0, 99.0, 100.5);
            store.upsert(&b).await.unwrap()
        }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap(), UpsertOutcome::Inserted);
    }
    assert_eq!(
        store.count("BTCUSDT", 60_000, T0, T0 + 16 * 60_000).await.unwrap(),
        16
    );
    assert_eq!(
        store.latest_close_time("BTCUSDT", 60_000).await.unwrap(),
        Some(T0 + 16 * 60_000)
    );
}
