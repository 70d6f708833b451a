//! Pipeline wiring: bootstrap, live stream, derived bars and gap recovery.

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::aggregation::{AggregationEngine, AggregationStats, BuildOutcome};
use crate::binance::ws::{ConnectionHandle, ConnectionManager, ConnectionSnapshot};
use crate::config::Config;
use crate::event::{GapWindow, PipelineEvent, StreamEvent, WsConnectionStatus};
use crate::gap_recovery::GapRecovery;
use crate::model::bar::{Bar, Provenance};
use crate::model::pattern::Pattern;
use crate::signal::SignalStage;
use crate::source::{normalize_symbol, HistoricalBarSource, SymbolSource};
use crate::store::{record_bar, BarStore, PatternStore};
use crate::timeframe::Timeframe;

const STREAM_CHANNEL_CAPACITY: usize = 1_024;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// External services the pipeline depends on.
pub struct Collaborators {
    pub bars: Arc<dyn BarStore>,
    pub patterns: Arc<dyn PatternStore>,
    pub history: Arc<dyn HistoricalBarSource>,
    pub symbols: Arc<dyn SymbolSource>,
    /// Scores detected patterns when present.
    pub signals: Option<Arc<SignalStage>>,
}

#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub connection: Option<ConnectionSnapshot>,
    pub aggregation: AggregationStats,
    pub base_bars_stored: u64,
    pub patterns_detected: u64,
    pub gaps_recovered: u64,
    pub bars_recovered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    base_bars_stored: AtomicU64,
    patterns_detected: AtomicU64,
    gaps_recovered: AtomicU64,
    bars_recovered: AtomicU64,
}

/// One per process. Owns the connection manager and routes its events.
pub struct HybridManager {
    config: Config,
    bars: Arc<dyn BarStore>,
    patterns: Arc<dyn PatternStore>,
    history: Arc<dyn HistoricalBarSource>,
    symbols: Arc<dyn SymbolSource>,
    signals: Option<Arc<SignalStage>>,
    aggregation: Arc<AggregationEngine>,
    recovery: Arc<GapRecovery>,
    events: Option<mpsc::Sender<PipelineEvent>>,
    connection: Mutex<Option<ConnectionHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Gap recoveries and signal scoring spawned while running.
    background: Mutex<JoinSet<()>>,
    counters: Counters,
}

impl HybridManager {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        let timeframes: Vec<Timeframe> = config
            .aggregation
            .parsed_timeframes()
            .context("invalid aggregation timeframes")?;
        let aggregation = Arc::new(AggregationEngine::new(
            collaborators.bars.clone(),
            collaborators.patterns.clone(),
            timeframes,
            &config.aggregation,
        ));
        let recovery = Arc::new(GapRecovery::new(
            collaborators.bars.clone(),
            collaborators.patterns.clone(),
            collaborators.history.clone(),
            aggregation.clone(),
            config.recovery.clone(),
        ));
        Ok(Self {
            config,
            bars: collaborators.bars,
            patterns: collaborators.patterns,
            history: collaborators.history,
            symbols: collaborators.symbols,
            signals: collaborators.signals,
            aggregation,
            recovery,
            events: None,
            connection: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            background: Mutex::new(JoinSet::new()),
            counters: Counters::default(),
        })
    }

    /// Publish pipeline events to `tx`. Events are dropped when it is full.
    pub fn with_events(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn aggregation(&self) -> &Arc<AggregationEngine> {
        &self.aggregation
    }

    pub fn recovery(&self) -> &Arc<GapRecovery> {
        &self.recovery
    }

    /// Bootstrap history, then start streaming.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if lock(&self.connection).is_some() {
            bail!("pipeline already started");
        }

        let symbols = self.initial_symbols();
        tracing::info!(symbols = ?symbols, "Starting pipeline");
        if self.config.bootstrap.bars > 0 {
            for symbol in &symbols {
                if let Err(e) = self.bootstrap_symbol(symbol).await {
                    tracing::warn!(symbol = %symbol, error = %format!("{:#}", e), "Bootstrap failed");
                }
            }
        }

        let manager = ConnectionManager::new(
            &self.config.binance.ws_base_url,
            self.config.stream.clone(),
            self.symbols.clone(),
        )
        .with_symbols(&symbols);
        let handle = manager.handle();

        let (stream_tx, stream_rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);
        let (agg_tx, agg_rx) = mpsc::unbounded_channel::<Bar>();

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(manager.run(stream_tx)));
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.route(stream_rx, agg_tx).await }));
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.aggregate_worker(agg_rx).await }));

        *lock(&self.connection) = Some(handle);
        lock(&self.tasks).extend(tasks);
        Ok(())
    }

    /// Stop streaming and wait for the pipeline tasks, then any recovery or
    /// scoring still running, to drain.
    pub async fn stop(&self) {
        let handle = lock(&self.connection).take();
        if let Some(handle) = handle {
            handle.stop();
            let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
            for task in tasks {
                let abort = task.abort_handle();
                if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                    tracing::warn!("Pipeline task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        let mut background = std::mem::take(&mut *lock(&self.background));
        if !background.is_empty() {
            tracing::debug!(tasks = background.len(), "Waiting for background tasks");
            let drained = tokio::time::timeout(STOP_TIMEOUT, async {
                while background.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!("Background tasks did not finish in time, aborting");
                background.abort_all();
            }
        }
        tracing::info!("Pipeline stopped");
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        lock(&self.connection).clone()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            connection: self.connection().map(|h| h.snapshot()),
            aggregation: self.aggregation.stats(),
            base_bars_stored: self.counters.base_bars_stored.load(Ordering::Relaxed),
            patterns_detected: self.counters.patterns_detected.load(Ordering::Relaxed),
            gaps_recovered: self.counters.gaps_recovered.load(Ordering::Relaxed),
            bars_recovered: self.counters.bars_recovered.load(Ordering::Relaxed),
        }
    }

    fn initial_symbols(&self) -> Vec<String> {
        let configured = self.config.binance.stream_symbols();
        if !configured.is_empty() {
            return configured;
        }
        let mut out: Vec<String> = Vec::new();
        for sym in self.symbols.current_symbols() {
            let s = normalize_symbol(&sym);
            if !s.is_empty() && !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }

    /// Preload recent base bars and build the derived bars they complete.
    pub async fn bootstrap_symbol(&self, symbol: &str) -> Result<usize> {
        let bars = self
            .history
            .fetch_recent_bars(symbol, self.config.bootstrap.bars)
            .await
            .with_context(|| format!("fetch recent bars for {}", symbol))?;

        let mut stored = 0usize;
        for bar in &bars {
            let bar = bar.clone().with_provenance(Provenance::HistoricalApi);
            match record_bar(self.bars.as_ref(), self.patterns.as_ref(), &bar).await {
                Ok(recorded) => {
                    stored += 1;
                    self.recovery.note_bar_end(&bar.symbol, bar.close_time);
                    if let Some(pattern) = recorded.pattern {
                        self.counters.patterns_detected.fetch_add(1, Ordering::Relaxed);
                        self.emit(PipelineEvent::PatternDetected {
                            key: bar.key(),
                            pattern,
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(key = %bar.key(), error = %e, "Failed to store bootstrap bar");
                }
            }
        }

        if let (Some(first), Some(last)) = (bars.first(), bars.last()) {
            let outcomes = self
                .aggregation
                .recheck_range(symbol, first.open_time, last.close_time, now_ms())
                .await;
            for (_, _, outcome) in outcomes {
                self.publish_outcome(outcome);
            }
        }
        tracing::info!(symbol, fetched = bars.len(), stored, "Bootstrap complete");
        Ok(stored)
    }

    async fn route(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<StreamEvent>,
        agg_tx: mpsc::UnboundedSender<Bar>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::FinalizedBar(bar) => {
                    if self.handle_finalized_bar(&bar).await {
                        let _ = agg_tx.send(bar);
                    }
                }
                StreamEvent::GapWindow(window) => self.handle_gap_window(window),
                StreamEvent::Status(status) => match status {
                    WsConnectionStatus::Disconnected { code } => {
                        tracing::debug!(?code, "Stream disconnected");
                    }
                    other => tracing::debug!(status = ?other, "Stream status"),
                },
            }
        }
        tracing::debug!("Stream event router finished");
    }

    /// Store one live base bar. Returns whether it was stored.
    pub async fn handle_finalized_bar(self: &Arc<Self>, bar: &Bar) -> bool {
        let recorded = match record_bar(self.bars.as_ref(), self.patterns.as_ref(), bar).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(key = %bar.key(), error = %e, "Failed to store stream bar");
                return false;
            }
        };
        self.recovery.note_bar_end(&bar.symbol, bar.close_time);
        self.counters.base_bars_stored.fetch_add(1, Ordering::Relaxed);
        self.emit(PipelineEvent::BaseBarStored(bar.clone()));

        if let Some(pattern) = recorded.pattern {
            tracing::info!(key = %bar.key(), pattern = %pattern.pattern_type, confidence = pattern.confidence, "Pattern detected");
            self.counters.patterns_detected.fetch_add(1, Ordering::Relaxed);
            self.emit(PipelineEvent::PatternDetected {
                key: bar.key(),
                pattern: pattern.clone(),
            });
            self.spawn_signal(bar.clone(), pattern);
        }
        true
    }

    /// Runs the boundary check for each bar once it has settled, in arrival order.
    async fn aggregate_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Bar>) {
        let grace = self.config.aggregation.settle_grace_ms;
        while let Some(bar) = rx.recv().await {
            let wait_ms = bar
                .close_time
                .saturating_add(grace)
                .saturating_sub(now_ms())
                .min(grace);
            if wait_ms > 0 {
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            let outcomes = self.aggregation.on_base_bar_finalized(&bar, now_ms()).await;
            for (_, outcome) in outcomes {
                self.publish_outcome_live(outcome);
            }
        }
        tracing::debug!("Aggregation worker finished");
    }

    fn publish_outcome_live(self: &Arc<Self>, outcome: BuildOutcome) {
        if let BuildOutcome::Built {
            bar,
            pattern: Some(pattern),
        } = &outcome
        {
            self.spawn_signal(bar.clone(), pattern.clone());
        }
        self.publish_outcome(outcome);
    }

    fn publish_outcome(&self, outcome: BuildOutcome) {
        if let BuildOutcome::Built { bar, pattern } = outcome {
            if let Some(pattern) = pattern {
                self.counters.patterns_detected.fetch_add(1, Ordering::Relaxed);
                self.emit(PipelineEvent::PatternDetected {
                    key: bar.key(),
                    pattern,
                });
            }
            self.emit(PipelineEvent::DerivedBarBuilt(bar));
        }
    }

    /// Start backfilling `window` in the background. [`HybridManager::stop`]
    /// waits for it.
    pub fn handle_gap_window(self: &Arc<Self>, window: GapWindow) {
        // Bars routed after this point must not shift the gap start.
        let starts = self.recovery.last_known_ends(&window.symbols);
        let this = Arc::clone(self);
        self.spawn_background(async move {
            let report = this.recovery.recover_from(&window, &starts, now_ms()).await;
            if !report.skipped {
                this.counters.gaps_recovered.fetch_add(1, Ordering::Relaxed);
                this.counters
                    .bars_recovered
                    .fetch_add(report.bars_recovered, Ordering::Relaxed);
                this.counters
                    .patterns_detected
                    .fetch_add(report.patterns_detected, Ordering::Relaxed);
            }
            this.emit(PipelineEvent::GapRecovered(report));
        });
    }

    fn spawn_signal(self: &Arc<Self>, bar: Bar, pattern: Pattern) {
        let Some(stage) = self.signals.clone() else {
            return;
        };
        let this = Arc::clone(self);
        self.spawn_background(async move {
            let assessment = stage.evaluate(&bar, &pattern).await;
            this.emit(PipelineEvent::Signal {
                key: bar.key(),
                assessment,
            });
        });
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = lock(&self.background);
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                tracing::warn!("Pipeline event channel full, dropping event");
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
