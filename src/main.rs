use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;

use kline_ledger::binance::rest::BinanceRestClient;
use kline_ledger::config::{Config, LoggingConfig};
use kline_ledger::coordinator::{Collaborators, HybridManager, PipelineSnapshot};
use kline_ledger::event::PipelineEvent;
use kline_ledger::source::StaticSymbols;
use kline_ledger::store::SqliteStore;

const STATUS_INTERVAL_SECS: u64 = 60;
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::try_new(&cfg.level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &cfg.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path))?;
            let builder = builder
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false);
            if cfg.json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
        None if cfg.json => builder.json().init(),
        None => builder.init(),
    }
    Ok(())
}

fn log_snapshot(s: &PipelineSnapshot) {
    match &s.connection {
        Some(c) => tracing::info!(
            state = ?c.state,
            symbols = c.subscribed_symbols.len(),
            reconnect_attempts = c.reconnect_attempts,
            total_reconnects = c.total_reconnects,
            messages = c.messages_received,
            finalized = c.finalized_bars,
            malformed = c.malformed_messages,
            base_stored = s.base_bars_stored,
            derived_built = s.aggregation.built,
            deferred = s.aggregation.deferred,
            patterns = s.patterns_detected,
            gaps = s.gaps_recovered,
            recovered = s.bars_recovered,
            "Pipeline status"
        ),
        None => tracing::info!("Pipeline not running"),
    }
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::BaseBarStored(bar) => {
            tracing::debug!(key = %bar.key(), close = bar.close, "Base bar stored");
        }
        PipelineEvent::PatternDetected { key, pattern } => {
            tracing::info!(
                key = %key,
                pattern = %pattern.pattern_type,
                confidence = pattern.confidence,
                stop_loss = pattern.stop_loss_price,
                "Reversal pattern"
            );
        }
        PipelineEvent::DerivedBarBuilt(bar) => {
            tracing::debug!(key = %bar.key(), "Derived bar stored");
        }
        PipelineEvent::GapRecovered(report) => {
            tracing::info!(
                recovered = report.bars_recovered,
                errors = report.errors.len(),
                skipped = report.skipped,
                "Gap recovery report"
            );
        }
        PipelineEvent::Signal { key, assessment } => {
            tracing::info!(key = %key, valid = assessment.is_valid, score = assessment.score, "Signal");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required by rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging)?;

    tracing::info!(
        symbols = ?config.binance.stream_symbols(),
        rest_url = %config.binance.rest_base_url,
        ws_url = %config.binance.ws_base_url,
        timeframes = ?config.aggregation.timeframes,
        "Starting kline-ledger"
    );

    let store = Arc::new(
        SqliteStore::open(&config.storage.sqlite_path)
            .with_context(|| format!("failed to open {}", config.storage.sqlite_path))?,
    );
    let rest = Arc::new(
        BinanceRestClient::new(&config.binance.rest_base_url, config.binance.request_timeout())?
            .with_page_limit(config.recovery.bars_per_request),
    );
    match rest.server_time().await {
        Ok(server_ms) => {
            let local_ms = chrono::Utc::now().timestamp_millis();
            tracing::info!(skew_ms = local_ms - server_ms as i64, "Binance server time");
        }
        Err(e) => tracing::warn!(error = %e, "Binance server time unavailable"),
    }
    let symbols = Arc::new(StaticSymbols::new(config.binance.stream_symbols()));

    let (event_tx, mut event_rx) = mpsc::channel::<PipelineEvent>(EVENT_CHANNEL_CAPACITY);
    let manager = Arc::new(
        HybridManager::new(
            config.clone(),
            Collaborators {
                bars: store.clone(),
                patterns: store,
                history: rest,
                symbols,
                signals: None,
            },
        )?
        .with_events(event_tx),
    );
    manager.start().await?;

    let mut status = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Shutdown requested");
                break;
            }
            _ = status.tick() => log_snapshot(&manager.snapshot()),
            Some(event) = event_rx.recv() => log_event(&event),
        }
    }

    manager.stop().await;
    log_snapshot(&manager.snapshot());
    Ok(())
}
