use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{BarStore, PatternStore, UpsertOutcome};
use crate::error::AppError;
use crate::model::bar::{Bar, BarKey, DerivedFrom, Provenance};
use crate::model::pattern::{Pattern, PatternType};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    interval_ms INTEGER NOT NULL,
    open_time INTEGER NOT NULL,
    close_time INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    quote_volume REAL NOT NULL,
    trade_count INTEGER NOT NULL,
    taker_buy_base_volume REAL NOT NULL,
    taker_buy_quote_volume REAL NOT NULL,
    provenance TEXT NOT NULL,
    source_bar_count INTEGER,
    source_interval_ms INTEGER,
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY(symbol, interval_ms, open_time)
);

CREATE TABLE IF NOT EXISTS patterns (
    symbol TEXT NOT NULL,
    interval_ms INTEGER NOT NULL,
    open_time INTEGER NOT NULL,
    pattern_type TEXT NOT NULL,
    body_percent REAL NOT NULL,
    upper_wick_percent REAL NOT NULL,
    lower_wick_percent REAL NOT NULL,
    body_position_percent REAL NOT NULL,
    confidence REAL NOT NULL,
    stop_loss_price REAL NOT NULL,
    stop_loss_risk_percent REAL NOT NULL,
    detected_at_ms INTEGER NOT NULL,
    PRIMARY KEY(symbol, interval_ms, open_time)
);
"#;

const BAR_COLUMNS: &str = "symbol, interval_ms, open_time, close_time, open, high, low, close, \
     volume, quote_volume, trade_count, taker_buy_base_volume, taker_buy_quote_volume, \
     provenance, source_bar_count, source_interval_ms";

const PATTERN_COLUMNS: &str = "pattern_type, body_percent, upper_wick_percent, lower_wick_percent, \
     body_position_percent, confidence, stop_loss_price, stop_loss_risk_percent";

/// SQLite-backed bar and pattern store. Statements run on the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AppError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| AppError::Storage(format!("sqlite task failed: {}", e)))?
    }
}

fn bar_from_row(row: &Row<'_>) -> rusqlite::Result<Bar> {
    let provenance: String = row.get(13)?;
    let source_bar_count: Option<i64> = row.get(14)?;
    let source_interval_ms: Option<i64> = row.get(15)?;
    let derived = match (source_bar_count, source_interval_ms) {
        (Some(count), Some(interval)) => Some(DerivedFrom {
            source_bar_count: count as u32,
            source_interval_ms: interval as u64,
        }),
        _ => None,
    };
    Ok(Bar {
        symbol: row.get(0)?,
        interval_ms: row.get::<_, i64>(1)? as u64,
        open_time: row.get::<_, i64>(2)? as u64,
        close_time: row.get::<_, i64>(3)? as u64,
        open: row.get(4)?,
        high: row.get(5)?,
        low: row.get(6)?,
        close: row.get(7)?,
        volume: row.get(8)?,
        quote_volume: row.get(9)?,
        trade_count: row.get::<_, i64>(10)? as u64,
        taker_buy_base_volume: row.get(11)?,
        taker_buy_quote_volume: row.get(12)?,
        provenance: Provenance::parse(&provenance).unwrap_or(Provenance::HistoricalApi),
        derived,
    })
}

fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<Option<Pattern>> {
    let label: String = row.get(0)?;
    let Some(pattern_type) = PatternType::parse(&label) else {
        return Ok(None);
    };
    Ok(Some(Pattern {
        pattern_type,
        body_percent: row.get(1)?,
        upper_wick_percent: row.get(2)?,
        lower_wick_percent: row.get(3)?,
        body_position_percent: row.get(4)?,
        confidence: row.get(5)?,
        stop_loss_price: row.get(6)?,
        stop_loss_risk_percent: row.get(7)?,
    }))
}

fn insert_pattern(
    conn: &Connection,
    key: &BarKey,
    p: &Pattern,
    conflict: &str,
) -> rusqlite::Result<usize> {
    let sql = format!(
        r#"
        INSERT INTO patterns (
            symbol, interval_ms, open_time, {PATTERN_COLUMNS}, detected_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        {conflict}
        "#
    );
    conn.execute(
        &sql,
        params![
            key.symbol,
            key.interval_ms as i64,
            key.open_time as i64,
            p.pattern_type.as_str(),
            p.body_percent,
            p.upper_wick_percent,
            p.lower_wick_percent,
            p.body_position_percent,
            p.confidence,
            p.stop_loss_price,
            p.stop_loss_risk_percent,
            chrono::Utc::now().timestamp_millis(),
        ],
    )
}

#[async_trait]
impl BarStore for SqliteStore {
    async fn upsert(&self, bar: &Bar) -> Result<UpsertOutcome, AppError> {
        let bar = bar.clone();
        self.with_conn(move |conn| upsert_bar(conn, &bar)).await
    }

    async fn find(&self, key: &BarKey) -> Result<Option<Bar>, AppError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let bar = conn
                .query_row(
                    &format!(
                        "SELECT {BAR_COLUMNS} FROM bars \
                         WHERE symbol = ?1 AND interval_ms = ?2 AND open_time = ?3"
                    ),
                    params![key.symbol, key.interval_ms as i64, key.open_time as i64],
                    bar_from_row,
                )
                .optional()?;
            Ok(bar)
        })
        .await
    }

    async fn range(
        &self,
        symbol: &str,
        interval_ms: u64,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<Bar>, AppError> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BAR_COLUMNS} FROM bars \
                 WHERE symbol = ?1 AND interval_ms = ?2 AND open_time >= ?3 AND open_time < ?4 \
                 ORDER BY open_time ASC"
            ))?;
            let rows = stmt.query_map(
                params![symbol, interval_ms as i64, start_ms as i64, end_ms as i64],
                bar_from_row,
            )?;
            let mut bars = Vec::new();
            for row in rows {
                bars.push(row?);
            }
            Ok(bars)
        })
        .await
    }

    async fn count(
        &self,
        symbol: &str,
        interval_ms: u64,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<u64, AppError> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM bars \
                 WHERE symbol = ?1 AND interval_ms = ?2 AND open_time >= ?3 AND open_time < ?4",
                params![symbol, interval_ms as i64, start_ms as i64, end_ms as i64],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn latest_close_time(
        &self,
        symbol: &str,
        interval_ms: u64,
    ) -> Result<Option<u64>, AppError> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(close_time) FROM bars WHERE symbol = ?1 AND interval_ms = ?2",
                params![symbol, interval_ms as i64],
                |row| row.get(0),
            )?;
            Ok(max.map(|v| v as u64))
        })
        .await
    }
}

fn upsert_bar(conn: &mut Connection, bar: &Bar) -> Result<UpsertOutcome, AppError> {
    let tx = conn.transaction()?;
    let prev: Option<(f64, f64, f64, f64)> = tx
        .query_row(
            "SELECT open, high, low, close FROM bars \
             WHERE symbol = ?1 AND interval_ms = ?2 AND open_time = ?3",
            params![bar.symbol, bar.interval_ms as i64, bar.open_time as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let outcome = match prev {
        None => UpsertOutcome::Inserted,
        Some((o, h, l, c)) if o == bar.open && h == bar.high && l == bar.low && c == bar.close => {
            UpsertOutcome::Unchanged
        }
        Some(_) => UpsertOutcome::Replaced,
    };

    tx.execute(
        &format!(
            r#"
            INSERT INTO bars ({BAR_COLUMNS}, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(symbol, interval_ms, open_time) DO UPDATE SET
                close_time = excluded.close_time,
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                quote_volume = excluded.quote_volume,
                trade_count = excluded.trade_count,
                taker_buy_base_volume = excluded.taker_buy_base_volume,
                taker_buy_quote_volume = excluded.taker_buy_quote_volume,
                provenance = excluded.provenance,
                source_bar_count = excluded.source_bar_count,
                source_interval_ms = excluded.source_interval_ms,
                updated_at_ms = excluded.updated_at_ms
            "#
        ),
        params![
            bar.symbol,
            bar.interval_ms as i64,
            bar.open_time as i64,
            bar.close_time as i64,
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.quote_volume,
            bar.trade_count as i64,
            bar.taker_buy_base_volume,
            bar.taker_buy_quote_volume,
            bar.provenance.as_str(),
            bar.derived.map(|d| d.source_bar_count as i64),
            bar.derived.map(|d| d.source_interval_ms as i64),
            chrono::Utc::now().timestamp_millis(),
        ],
    )?;
    tx.commit()?;
    Ok(outcome)
}

const REPLACE_PATTERN: &str = r#"ON CONFLICT(symbol, interval_ms, open_time) DO UPDATE SET
    pattern_type = excluded.pattern_type,
    body_percent = excluded.body_percent,
    upper_wick_percent = excluded.upper_wick_percent,
    lower_wick_percent = excluded.lower_wick_percent,
    body_position_percent = excluded.body_position_percent,
    confidence = excluded.confidence,
    stop_loss_price = excluded.stop_loss_price,
    stop_loss_risk_percent = excluded.stop_loss_risk_percent,
    detected_at_ms = excluded.detected_at_ms"#;

#[async_trait]
impl PatternStore for SqliteStore {
    async fn upsert_if_absent(&self, key: &BarKey, pattern: &Pattern) -> Result<bool, AppError> {
        let (key, pattern) = (key.clone(), pattern.clone());
        self.with_conn(move |conn| {
            let inserted = insert_pattern(
                conn,
                &key,
                &pattern,
                "ON CONFLICT(symbol, interval_ms, open_time) DO NOTHING",
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn replace(&self, key: &BarKey, pattern: Option<&Pattern>) -> Result<(), AppError> {
        let (key, pattern) = (key.clone(), pattern.cloned());
        self.with_conn(move |conn| {
            match pattern {
                Some(p) => {
                    insert_pattern(conn, &key, &p, REPLACE_PATTERN)?;
                }
                None => {
                    conn.execute(
                        "DELETE FROM patterns WHERE symbol = ?1 AND interval_ms = ?2 AND open_time = ?3",
                        params![key.symbol, key.interval_ms as i64, key.open_time as i64],
                    )?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn find(&self, key: &BarKey) -> Result<Option<Pattern>, AppError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    &format!(
                        "SELECT {PATTERN_COLUMNS} FROM patterns \
                         WHERE symbol = ?1 AND interval_ms = ?2 AND open_time = ?3"
                    ),
                    params![key.symbol, key.interval_ms as i64, key.open_time as i64],
                    pattern_from_row,
                )
                .optional()?;
            Ok(found.flatten())
        })
        .await
    }
}
