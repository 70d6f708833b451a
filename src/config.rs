use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::source::normalize_symbol;
use crate::timeframe::Timeframe;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_PATH_ENV: &str = "KLINE_LEDGER_CONFIG";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub binance: BinanceConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceConfig {
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Protocol ping cadence; must stay below the server's idle timeout.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Silence longer than this forces a reconnect.
    #[serde(default = "default_silence_threshold_secs")]
    pub silence_threshold_secs: u64,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Uptime after which the attempt counter is cleared again.
    #[serde(default = "default_stable_reset_secs")]
    pub stable_reset_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Time spent at max backoff before each retry is logged as an alert.
    #[serde(default = "default_alert_after_secs")]
    pub alert_after_secs: u64,
    /// Shorter outages are not reported as gap windows.
    #[serde(default = "default_min_gap_ms")]
    pub min_gap_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Returned bars are matched to missing boundaries within this tolerance.
    #[serde(default = "default_match_tolerance_ms")]
    pub match_tolerance_ms: u64,
    #[serde(default = "default_bars_per_request")]
    pub bars_per_request: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
    #[serde(default = "default_sufficiency_percent")]
    pub sufficiency_percent: u64,
    /// A base bar counts only once it closed this long ago.
    #[serde(default = "default_settle_grace_ms")]
    pub settle_grace_ms: u64,
    #[serde(default = "default_lock_retention_secs")]
    pub lock_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// Base bars preloaded per symbol at startup. Zero disables bootstrap.
    #[serde(default = "default_bootstrap_bars")]
    pub bars: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Log to this file instead of stdout.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}
fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_health_check_interval_secs() -> u64 {
    60
}
fn default_silence_threshold_secs() -> u64 {
    120
}
fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}
fn default_stable_reset_secs() -> u64 {
    300
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_alert_after_secs() -> u64 {
    600
}
fn default_min_gap_ms() -> u64 {
    60_000
}
fn default_max_concurrent_fetches() -> usize {
    3
}
fn default_match_tolerance_ms() -> u64 {
    1_000
}
fn default_bars_per_request() -> usize {
    1_000
}
fn default_retry_delay_ms() -> u64 {
    2_000
}
fn default_timeframes() -> Vec<String> {
    ["2m", "3m", "5m", "7m", "15m", "30m", "1h", "4h", "1d"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_sufficiency_percent() -> u64 {
    80
}
fn default_settle_grace_ms() -> u64 {
    3_000
}
fn default_lock_retention_secs() -> u64 {
    3_600
}
fn default_bootstrap_bars() -> usize {
    240
}
fn default_sqlite_path() -> String {
    "data/klines.sqlite".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            symbols: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            silence_threshold_secs: default_silence_threshold_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            stable_reset_secs: default_stable_reset_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            alert_after_secs: default_alert_after_secs(),
            min_gap_ms: default_min_gap_ms(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
            match_tolerance_ms: default_match_tolerance_ms(),
            bars_per_request: default_bars_per_request(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            timeframes: default_timeframes(),
            sufficiency_percent: default_sufficiency_percent(),
            settle_grace_ms: default_settle_grace_ms(),
            lock_retention_secs: default_lock_retention_secs(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            bars: default_bootstrap_bars(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

/// Parse a Binance kline interval string (e.g. "1s", "1m", "1h", "1d", "1w", "1M") into milliseconds.
pub fn parse_interval_ms(s: &str) -> Result<u64> {
    if s.len() < 2 {
        bail!("invalid interval '{}': expected format like '1m'", s);
    }

    let (num_str, suffix) = s.split_at(s.len() - 1);
    let n: u64 = num_str.parse().with_context(|| {
        format!(
            "invalid interval '{}': quantity must be a positive integer",
            s
        )
    })?;
    if n == 0 {
        bail!("invalid interval '{}': quantity must be > 0", s);
    }

    let unit_ms = match suffix {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "M" => 30 * 86_400_000,
        _ => bail!(
            "invalid interval '{}': unsupported suffix '{}', expected one of s/m/h/d/w/M",
            s,
            suffix
        ),
    };

    n.checked_mul(unit_ms)
        .with_context(|| format!("invalid interval '{}': value is too large", s))
}

impl BinanceConfig {
    pub fn stream_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for sym in &self.symbols {
            let s = normalize_symbol(sym);
            if !s.is_empty() && !out.iter().any(|v| v == &s) {
                out.push(s);
            }
        }
        out
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl AggregationConfig {
    /// Parsed, sorted and de-duplicated derived timeframes.
    pub fn parsed_timeframes(&self) -> Result<Vec<Timeframe>> {
        let mut out = Vec::with_capacity(self.timeframes.len());
        for label in &self.timeframes {
            let tf = Timeframe::parse(label)
                .with_context(|| format!("aggregation.timeframes entry '{}' is invalid", label))?;
            out.push(tf);
        }
        out.sort();
        out.dedup();
        Ok(out)
    }
}

impl Config {
    /// Load from `$KLINE_LEDGER_CONFIG` or `config/default.toml`.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ws = url::Url::parse(&self.binance.ws_base_url)
            .context("binance.ws_base_url is not a valid URL")?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            bail!("binance.ws_base_url must use ws:// or wss://");
        }
        let rest = url::Url::parse(&self.binance.rest_base_url)
            .context("binance.rest_base_url is not a valid URL")?;
        if !matches!(rest.scheme(), "http" | "https") {
            bail!("binance.rest_base_url must use http:// or https://");
        }
        if self.binance.request_timeout_ms == 0 {
            bail!("binance.request_timeout_ms must be > 0");
        }

        let s = &self.stream;
        if s.reconnect_base_delay_ms == 0 {
            bail!("stream.reconnect_base_delay_ms must be > 0");
        }
        if s.reconnect_max_delay_ms < s.reconnect_base_delay_ms {
            bail!("stream.reconnect_max_delay_ms must be >= reconnect_base_delay_ms");
        }
        if s.heartbeat_interval_secs == 0 || s.health_check_interval_secs == 0 {
            bail!("stream heartbeat and health check intervals must be > 0");
        }
        if s.silence_threshold_secs <= s.health_check_interval_secs {
            bail!("stream.silence_threshold_secs must exceed health_check_interval_secs");
        }
        if s.connect_timeout_secs == 0 {
            bail!("stream.connect_timeout_secs must be > 0");
        }

        let r = &self.recovery;
        if r.max_concurrent_fetches == 0 {
            bail!("recovery.max_concurrent_fetches must be > 0");
        }
        if r.bars_per_request == 0 || r.bars_per_request > 1_000 {
            bail!("recovery.bars_per_request must be within 1..=1000");
        }

        let a = &self.aggregation;
        if !(1..=100).contains(&a.sufficiency_percent) {
            bail!("aggregation.sufficiency_percent must be within 1..=100");
        }
        a.parsed_timeframes()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interval_valid() {
        assert_eq!(parse_interval_ms("1m").unwrap(), 60_000);
        assert_eq!(parse_interval_ms("2h").unwrap(), 7_200_000);
        assert_eq!(parse_interval_ms("1M").unwrap(), 2_592_000_000);
    }

    #[test]
    fn parse_interval_rejects_invalid_inputs() {
        assert!(parse_interval_ms("").is_err());
        assert!(parse_interval_ms("m").is_err());
        assert!(parse_interval_ms("0m").is_err());
        assert!(parse_interval_ms("1x").is_err());
    }

    #[test]
    fn stream_symbols_dedup_and_uppercase() {
        let cfg = BinanceConfig {
            symbols: vec![
                "btcusdt".to_string(),
                "ETHUSDT".to_string(),
                "BTCUSDT".to_string(),
                "  ".to_string(),
            ],
            ..BinanceConfig::default()
        };
        assert_eq!(
            cfg.stream_symbols(),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.stream.silence_threshold_secs, 120);
        assert_eq!(config.aggregation.sufficiency_percent, 80);
        assert_eq!(config.recovery.max_concurrent_fetches, 3);
        assert!(config.binance.symbols.is_empty());
    }
}
