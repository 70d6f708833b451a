use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::model::bar::Bar;
use crate::model::trade::Trade;
use crate::source::{HistoricalBarSource, TradeTickSource};
use crate::timeframe::BASE_INTERVAL_MS;

use super::types::{BinanceAggTrade, BinanceApiErrorResponse, BinanceRestKline, ServerTimeResponse};

const KLINE_PAGE_LIMIT: usize = 1_000;
const AGG_TRADE_PAGE_LIMIT: usize = 1_000;
/// Binance request-weight budget per minute, warn at 80%.
const WEIGHT_WARN_PER_MINUTE: u64 = 4_800;

pub struct BinanceRestClient {
    http: reqwest::Client,
    base_url: String,
    page_limit: usize,
    // Simple weight tracker: request count in current minute window
    request_count: AtomicU64,
    window_start: std::sync::Mutex<Instant>,
}

impl BinanceRestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("kline-ledger/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_limit: KLINE_PAGE_LIMIT,
            request_count: AtomicU64::new(0),
            window_start: std::sync::Mutex::new(Instant::now()),
        })
    }

    /// Cap rows per kline request (at most 1000).
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, KLINE_PAGE_LIMIT);
        self
    }

    fn check_rate_limit(&self, weight: u64) {
        let mut start = self.window_start.lock().unwrap_or_else(|e| e.into_inner());
        if start.elapsed().as_secs() >= 60 {
            *start = Instant::now();
            self.request_count.store(0, Ordering::Relaxed);
        }
        let count = self.request_count.fetch_add(weight, Ordering::Relaxed) + weight;
        if count > WEIGHT_WARN_PER_MINUTE {
            tracing::warn!(count, "Approaching REST weight limit (80% of 6000/min)");
        }
    }

    pub async fn server_time(&self) -> Result<u64, AppError> {
        let url = format!("{}/api/v3/time", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(map_send_error)?;
        let resp: ServerTimeResponse = check_status(resp).await?.json().await?;
        Ok(resp.server_time)
    }

    /// `GET /api/v3/klines`. Rows come back ordered by open time.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        interval_ms: u64,
        start_ms: Option<u64>,
        end_ms: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Bar>, AppError> {
        self.check_rate_limit(2);
        let url = format!("{}/api/v3/klines", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_ascii_uppercase()),
            ("interval", interval.to_string()),
            ("limit", limit.clamp(1, KLINE_PAGE_LIMIT).to_string()),
        ];
        if let Some(start) = start_ms {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_ms {
            query.push(("endTime", end.to_string()));
        }

        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(map_send_error)?;
        let rows: Vec<BinanceRestKline> = check_status(resp).await?.json().await?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in &rows {
            let bar = row
                .to_bar(symbol, interval_ms)
                .map_err(|e| AppError::MalformedMessage(format!("kline row: {}", e)))?;
            bars.push(bar);
        }
        tracing::debug!(symbol, interval, count = bars.len(), "Fetched klines");
        Ok(bars)
    }

    /// `GET /api/v3/aggTrades`, first page by time then by id.
    pub async fn get_agg_trades(
        &self,
        symbol: &str,
        start_ms: Option<u64>,
        end_ms: Option<u64>,
        from_id: Option<u64>,
    ) -> Result<Vec<Trade>, AppError> {
        self.check_rate_limit(2);
        let url = format!("{}/api/v3/aggTrades", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_ascii_uppercase()),
            ("limit", AGG_TRADE_PAGE_LIMIT.to_string()),
        ];
        if let Some(id) = from_id {
            query.push(("fromId", id.to_string()));
        } else {
            if let Some(start) = start_ms {
                query.push(("startTime", start.to_string()));
            }
            if let Some(end) = end_ms {
                query.push(("endTime", end.to_string()));
            }
        }

        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(map_send_error)?;
        let rows: Vec<BinanceAggTrade> = check_status(resp).await?.json().await?;
        Ok(rows.iter().map(|t| t.to_trade(symbol)).collect())
    }
}

fn map_send_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(e.to_string())
    } else if e.is_connect() {
        AppError::Transport(e.to_string())
    } else {
        AppError::Http(e)
    }
}

/// Map non-success responses onto the error taxonomy.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    // 429 = over limit, 418 = IP banned after ignoring 429s.
    if status.as_u16() == 429 || status.as_u16() == 418 {
        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        tracing::warn!(status = status.as_u16(), ?retry_after_secs, "Binance rate limit hit");
        return Err(AppError::RateLimited {
            status: status.as_u16(),
            retry_after_secs,
        });
    }

    let body = resp.text().await.unwrap_or_default();
    if let Ok(err) = serde_json::from_str::<BinanceApiErrorResponse>(&body) {
        return Err(AppError::BinanceApi {
            code: err.code,
            msg: err.msg,
        });
    }
    if status.is_server_error() {
        return Err(AppError::Transport(format!("HTTP {}: {}", status, body)));
    }
    Err(AppError::BinanceApi {
        code: -(status.as_u16() as i64),
        msg: body,
    })
}

#[async_trait]
impl HistoricalBarSource for BinanceRestClient {
    async fn fetch_bars(
        &self,
        symbol: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<Bar>, AppError> {
        let mut out = Vec::new();
        let mut cursor = start_ms;
        while cursor < end_ms {
            let page = self
                .get_klines(
                    symbol,
                    "1m",
                    BASE_INTERVAL_MS,
                    Some(cursor),
                    Some(end_ms - 1),
                    self.page_limit,
                )
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            let next = last.open_time + BASE_INTERVAL_MS;
            let full_page = page.len() >= self.page_limit;
            out.extend(page.into_iter().filter(|b| b.open_time < end_ms));
            if !full_page || next <= cursor {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }

    async fn fetch_recent_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>, AppError> {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let bars = self
            .get_klines(symbol, "1m", BASE_INTERVAL_MS, None, None, limit.saturating_add(1))
            .await?;
        // The newest row is the still-open minute.
        let mut closed: Vec<Bar> = bars.into_iter().filter(|b| b.close_time <= now_ms).collect();
        if closed.len() > limit {
            closed.drain(..closed.len() - limit);
        }
        Ok(closed)
    }
}

#[async_trait]
impl TradeTickSource for BinanceRestClient {
    async fn fetch_trades(
        &self,
        symbol: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<Trade>, AppError> {
        let mut out: Vec<Trade> = Vec::new();
        let mut page = self
            .get_agg_trades(symbol, Some(start_ms), Some(end_ms.saturating_sub(1)), None)
            .await?;
        loop {
            let full_page = page.len() >= AGG_TRADE_PAGE_LIMIT;
            let last_id = page.last().map(|t| t.trade_id);
            let reached_end = page.last().map(|t| t.timestamp_ms >= end_ms).unwrap_or(true);
            out.extend(
                page.into_iter()
                    .filter(|t| t.timestamp_ms >= start_ms && t.timestamp_ms < end_ms),
            );
            match last_id {
                Some(id) if full_page && !reached_end => {
                    page = self.get_agg_trades(symbol, None, None, Some(id + 1)).await?;
                }
                _ => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client =
            BinanceRestClient::new("https://api.binance.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "https://api.binance.com");
    }

    #[test]
    fn page_limit_is_clamped() {
        let client = BinanceRestClient::new("https://api.binance.com", Duration::from_secs(5))
            .unwrap()
            .with_page_limit(5_000);
        assert_eq!(client.page_limit, KLINE_PAGE_LIMIT);
    }
}
