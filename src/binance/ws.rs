use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::types::{BinanceStreamMessage, BinanceStreamRequest};
use crate::config::StreamConfig;
use crate::error::AppError;
use crate::event::{GapWindow, StreamEvent, WsConnectionStatus};
use crate::model::bar::Provenance;
use crate::source::{normalize_symbol, SymbolSource};
use crate::timeframe::BASE_INTERVAL_MS;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BASE_STREAM_INTERVAL: &str = "1m";
/// Binance rejects control frames with too many params.
const MAX_STREAMS_PER_REQUEST: usize = 200;

/// Exponential backoff for reconnection: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

/// The window to backfill after a reconnect, if the outage spanned at least
/// `min_gap_ms`.
pub fn gap_window(
    disconnected_at_ms: u64,
    reconnected_at_ms: u64,
    min_gap_ms: u64,
    symbols: &[String],
) -> Option<GapWindow> {
    if reconnected_at_ms < disconnected_at_ms.saturating_add(min_gap_ms) || symbols.is_empty() {
        return None;
    }
    Some(GapWindow {
        symbols: symbols.to_vec(),
        disconnected_at_ms,
        reconnected_at_ms,
    })
}

#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub state: WsConnectionStatus,
    pub subscribed_symbols: Vec<String>,
    pub reconnect_attempts: u32,
    pub current_backoff_ms: u64,
    pub total_reconnects: u64,
    pub messages_received: u64,
    pub finalized_bars: u64,
    pub malformed_messages: u64,
    pub last_message_at_ms: Option<u64>,
}

#[derive(Debug)]
struct Shared {
    state: WsConnectionStatus,
    /// Survives reconnects; replayed in the first SUBSCRIBE of every session.
    symbols: Vec<String>,
    reconnect_attempts: u32,
    current_backoff_ms: u64,
    total_reconnects: u64,
    messages_received: u64,
    finalized_bars: u64,
    malformed_messages: u64,
    last_message_at_ms: Option<u64>,
}

#[derive(Debug)]
enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

enum SessionEnd {
    Shutdown,
    Lost { code: Option<u16>, reason: String },
}

/// Cloneable control surface of a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Mutex<Shared>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Add symbols to the persisted set. Already-subscribed symbols are a
    /// no-op; returns the symbols that were newly added.
    pub fn subscribe<S: AsRef<str>>(&self, symbols: &[S]) -> Result<Vec<String>, AppError> {
        let (added, connected) = {
            let mut shared = lock(&self.shared);
            let mut added = Vec::new();
            for sym in symbols {
                let s = normalize_symbol(sym.as_ref());
                if !s.is_empty() && !shared.symbols.contains(&s) && !added.contains(&s) {
                    added.push(s);
                }
            }
            shared.symbols.extend(added.iter().cloned());
            (added, shared.state == WsConnectionStatus::Connected)
        };
        if added.is_empty() {
            return Ok(added);
        }
        if !connected {
            tracing::warn!(
                symbols = ?added,
                "Not connected, subscription kept for the next connect"
            );
            return Ok(added);
        }
        self.cmd_tx
            .send(Command::Subscribe(added.clone()))
            .map_err(|_| AppError::Transport("connection manager stopped".to_string()))?;
        Ok(added)
    }

    /// Remove symbols from the persisted set; returns the ones that were present.
    pub fn unsubscribe<S: AsRef<str>>(&self, symbols: &[S]) -> Result<Vec<String>, AppError> {
        let (removed, connected) = {
            let mut shared = lock(&self.shared);
            let mut removed = Vec::new();
            for sym in symbols {
                let s = normalize_symbol(sym.as_ref());
                if let Some(pos) = shared.symbols.iter().position(|v| v == &s) {
                    shared.symbols.remove(pos);
                    removed.push(s);
                }
            }
            (removed, shared.state == WsConnectionStatus::Connected)
        };
        if removed.is_empty() || !connected {
            return Ok(removed);
        }
        self.cmd_tx
            .send(Command::Unsubscribe(removed.clone()))
            .map_err(|_| AppError::Transport("connection manager stopped".to_string()))?;
        Ok(removed)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let shared = lock(&self.shared);
        ConnectionSnapshot {
            state: shared.state.clone(),
            subscribed_symbols: shared.symbols.clone(),
            reconnect_attempts: shared.reconnect_attempts,
            current_backoff_ms: shared.current_backoff_ms,
            total_reconnects: shared.total_reconnects,
            messages_received: shared.messages_received,
            finalized_bars: shared.finalized_bars,
            malformed_messages: shared.malformed_messages,
            last_message_at_ms: shared.last_message_at_ms,
        }
    }

    /// Ask the run loop to close the socket and exit.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Owns the kline stream: connect, subscribe, heartbeat, detect silence,
/// reconnect with backoff and report downtime windows.
pub struct ConnectionManager {
    url: String,
    cfg: StreamConfig,
    symbol_source: Arc<dyn SymbolSource>,
    handle: ConnectionHandle,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: watch::Receiver<bool>,
    backoff: ExponentialBackoff,
    request_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(ws_base_url: &str, cfg: StreamConfig, symbol_source: Arc<dyn SymbolSource>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(cfg.reconnect_base_delay_ms),
            Duration::from_millis(cfg.reconnect_max_delay_ms),
        );
        let shared = Shared {
            state: WsConnectionStatus::Disconnected { code: None },
            symbols: Vec::new(),
            reconnect_attempts: 0,
            current_backoff_ms: 0,
            total_reconnects: 0,
            messages_received: 0,
            finalized_bars: 0,
            malformed_messages: 0,
            last_message_at_ms: None,
        };
        Self {
            url: ws_base_url.trim_end_matches('/').to_string(),
            cfg,
            symbol_source,
            handle: ConnectionHandle {
                shared: Arc::new(Mutex::new(shared)),
                cmd_tx,
                shutdown_tx: Arc::new(shutdown_tx),
            },
            cmd_rx,
            shutdown_rx,
            backoff,
            request_id: AtomicU64::new(1),
        }
    }

    /// Seed the persisted subscription set before `run`.
    pub fn with_symbols<S: AsRef<str>>(self, symbols: &[S]) -> Self {
        {
            let mut shared = lock(&self.handle.shared);
            for sym in symbols {
                let s = normalize_symbol(sym.as_ref());
                if !s.is_empty() && !shared.symbols.contains(&s) {
                    shared.symbols.push(s);
                }
            }
        }
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Connect/reconnect loop. Returns once [`ConnectionHandle::stop`] is called.
    pub async fn run(mut self, events: mpsc::Sender<StreamEvent>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut disconnected_at: Option<u64> = None;
        let mut at_max_since: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let symbols = self.resolve_symbols();
            if symbols.is_empty() {
                tracing::warn!("No symbols to subscribe, retrying later");
                if !self.wait_backoff(&events, &mut shutdown, &mut at_max_since).await {
                    break;
                }
                continue;
            }

            self.set_state(WsConnectionStatus::Connecting, &events).await;
            tracing::info!(url = %self.url, symbols = symbols.len(), "Connecting kline stream");

            match self.connect(&symbols).await {
                Ok(ws) => {
                    let now = now_ms();
                    at_max_since = None;
                    self.mark_connected(&symbols);
                    let _ = events
                        .send(StreamEvent::Status(WsConnectionStatus::Connected))
                        .await;
                    tracing::info!(symbols = symbols.len(), "Kline stream connected");

                    if let Some(since) = disconnected_at.take() {
                        if let Some(gap) = gap_window(since, now, self.cfg.min_gap_ms, &symbols) {
                            tracing::info!(
                                downtime_ms = gap.downtime_ms(),
                                symbols = gap.symbols.len(),
                                "Stream gap detected"
                            );
                            let _ = events.send(StreamEvent::GapWindow(gap)).await;
                        }
                    }

                    match self.session(ws, &events, &mut shutdown).await {
                        SessionEnd::Shutdown => {
                            self.set_state(WsConnectionStatus::Disconnected { code: None }, &events)
                                .await;
                            break;
                        }
                        SessionEnd::Lost { code, reason } => {
                            disconnected_at = Some(now_ms());
                            tracing::warn!(?code, reason = %reason, "Kline stream lost");
                            self.set_state(WsConnectionStatus::Disconnected { code }, &events)
                                .await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Kline stream connect failed");
                }
            }

            if !self.wait_backoff(&events, &mut shutdown, &mut at_max_since).await {
                break;
            }
        }
        tracing::info!("Connection manager stopped");
    }

    fn resolve_symbols(&self) -> Vec<String> {
        let mut shared = lock(&self.handle.shared);
        if shared.symbols.is_empty() {
            for sym in self.symbol_source.current_symbols() {
                let s = normalize_symbol(&sym);
                if !s.is_empty() && !shared.symbols.contains(&s) {
                    shared.symbols.push(s);
                }
            }
        }
        shared.symbols.clone()
    }

    /// Enter `Connected` and queue requests for symbols added or removed since
    /// `subscribed` was resolved. Later changes go straight to the session.
    fn mark_connected(&self, subscribed: &[String]) {
        let (added, removed) = {
            let mut shared = lock(&self.handle.shared);
            shared.state = WsConnectionStatus::Connected;
            shared.reconnect_attempts = 0;
            shared.current_backoff_ms = 0;
            let added: Vec<String> = shared
                .symbols
                .iter()
                .filter(|s| !subscribed.contains(*s))
                .cloned()
                .collect();
            let removed: Vec<String> = subscribed
                .iter()
                .filter(|s| !shared.symbols.contains(*s))
                .cloned()
                .collect();
            (added, removed)
        };
        if !added.is_empty() {
            tracing::info!(symbols = ?added, "Subscribing symbols added while connecting");
            let _ = self.handle.cmd_tx.send(Command::Subscribe(added));
        }
        if !removed.is_empty() {
            tracing::info!(symbols = ?removed, "Unsubscribing symbols removed while connecting");
            let _ = self.handle.cmd_tx.send(Command::Unsubscribe(removed));
        }
    }

    async fn set_state(&self, state: WsConnectionStatus, events: &mpsc::Sender<StreamEvent>) {
        lock(&self.handle.shared).state = state.clone();
        let _ = events.send(StreamEvent::Status(state)).await;
    }

    /// Sleep for the next backoff delay. Returns false on shutdown.
    async fn wait_backoff(
        &self,
        events: &mpsc::Sender<StreamEvent>,
        shutdown: &mut watch::Receiver<bool>,
        at_max_since: &mut Option<Instant>,
    ) -> bool {
        let (attempt, delay) = {
            let mut shared = lock(&self.handle.shared);
            let delay = self.backoff.delay(shared.reconnect_attempts);
            shared.reconnect_attempts = shared.reconnect_attempts.saturating_add(1);
            shared.total_reconnects += 1;
            shared.current_backoff_ms = delay.as_millis() as u64;
            (shared.reconnect_attempts, delay)
        };

        if delay >= self.backoff.max() {
            let since = *at_max_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= Duration::from_secs(self.cfg.alert_after_secs) {
                tracing::error!(
                    attempt,
                    stuck_secs = since.elapsed().as_secs(),
                    "Kline stream still down at max backoff"
                );
            }
        } else {
            *at_max_since = None;
        }

        let delay_ms = delay.as_millis() as u64;
        tracing::info!(attempt, delay_ms, "Reconnecting kline stream");
        self.set_state(WsConnectionStatus::Reconnecting { attempt, delay_ms }, events)
            .await;

        tokio::select! {
            _ = tokio::time::sleep(delay) => !*shutdown.borrow(),
            _ = shutdown.changed() => false,
        }
    }

    async fn connect(&self, symbols: &[String]) -> Result<WsStream, AppError> {
        let timeout = Duration::from_secs(self.cfg.connect_timeout_secs);
        let (mut ws, _resp) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(self.url.as_str()))
                .await
                .map_err(|_| AppError::Timeout(format!("connect to {}", self.url)))??;

        for chunk in symbols.chunks(MAX_STREAMS_PER_REQUEST) {
            let req = BinanceStreamRequest::subscribe(chunk, BASE_STREAM_INTERVAL, self.next_id());
            self.send_request(&mut ws, req).await?;
        }
        Ok(ws)
    }

    async fn send_request<S>(&self, sink: &mut S, req: BinanceStreamRequest) -> Result<(), AppError>
    where
        S: Sink<Message> + Unpin,
        AppError: From<S::Error>,
    {
        let text = serde_json::to_string(&req)?;
        tracing::debug!(method = req.method, streams = req.params.len(), "Sending stream request");
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn session(
        &mut self,
        ws: WsStream,
        events: &mpsc::Sender<StreamEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        let heartbeat_every = Duration::from_secs(self.cfg.heartbeat_interval_secs);
        let health_every = Duration::from_secs(self.cfg.health_check_interval_secs);
        let silence = Duration::from_secs(self.cfg.silence_threshold_secs);
        let stable_every = Duration::from_secs(self.cfg.stable_reset_secs.max(1));

        let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = tokio::time::interval_at(Instant::now() + health_every, health_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stable = tokio::time::interval_at(Instant::now() + stable_every, stable_every);
        stable.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_message = Instant::now();
                            self.handle_text(&text, events).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code));
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "closed by server".to_string());
                            return SessionEnd::Lost { code, reason };
                        }
                        Some(Ok(_)) => {
                            // ping/pong/binary; tungstenite answers pings itself
                            last_message = Instant::now();
                        }
                        Some(Err(e)) => {
                            return SessionEnd::Lost { code: None, reason: e.to_string() };
                        }
                        None => {
                            return SessionEnd::Lost { code: None, reason: "stream ended".to_string() };
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Lost { code: None, reason: format!("ping failed: {}", e) };
                    }
                }
                _ = health.tick() => {
                    let idle = last_message.elapsed();
                    if idle > silence {
                        tracing::warn!(idle_secs = idle.as_secs(), "Kline stream silent, forcing reconnect");
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Lost { code: None, reason: "silence threshold exceeded".to_string() };
                    }
                }
                _ = stable.tick() => {
                    let mut shared = lock(&self.handle.shared);
                    if shared.reconnect_attempts != 0 {
                        tracing::debug!("Connection stable, clearing reconnect attempts");
                    }
                    shared.reconnect_attempts = 0;
                    shared.current_backoff_ms = 0;
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    let req = match cmd {
                        Command::Subscribe(symbols) => {
                            BinanceStreamRequest::subscribe(&symbols, BASE_STREAM_INTERVAL, self.next_id())
                        }
                        Command::Unsubscribe(symbols) => {
                            BinanceStreamRequest::unsubscribe(&symbols, BASE_STREAM_INTERVAL, self.next_id())
                        }
                    };
                    if let Err(e) = self.send_request(&mut write, req).await {
                        return SessionEnd::Lost { code: None, reason: e.to_string() };
                    }
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    async fn handle_text(&self, text: &str, events: &mpsc::Sender<StreamEvent>) {
        {
            let mut shared = lock(&self.handle.shared);
            shared.messages_received += 1;
            shared.last_message_at_ms = Some(now_ms());
        }
        match serde_json::from_str::<BinanceStreamMessage>(text) {
            Ok(BinanceStreamMessage::Kline(event))
            | Ok(BinanceStreamMessage::Wrapped { data: event, .. }) => {
                if !event.kline.is_closed || event.kline.interval != BASE_STREAM_INTERVAL {
                    return;
                }
                let bar = event.kline.to_bar(BASE_INTERVAL_MS, Provenance::Stream);
                lock(&self.handle.shared).finalized_bars += 1;
                if events.send(StreamEvent::FinalizedBar(bar)).await.is_err() {
                    tracing::warn!("Stream event receiver dropped");
                }
            }
            Ok(BinanceStreamMessage::Ack { id, .. }) => {
                tracing::debug!(id, "Stream request acknowledged");
            }
            Ok(BinanceStreamMessage::Error { code, msg }) => {
                tracing::warn!(code, msg = %msg, "Stream request rejected");
            }
            Err(e) => {
                lock(&self.handle.shared).malformed_messages += 1;
                tracing::debug!(error = %e, "Failed to parse WS message");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let b = ExponentialBackoff::new(Duration::from_millis(1_000), Duration::from_millis(60_000));
        assert_eq!(b.delay(0), Duration::from_millis(1_000));
        assert_eq!(b.delay(1), Duration::from_millis(2_000));
        assert_eq!(b.delay(5), Duration::from_millis(32_000));
        assert_eq!(b.delay(6), Duration::from_millis(60_000));
        assert_eq!(b.delay(500), Duration::from_millis(60_000));
    }

    #[test]
    fn short_outage_is_not_a_gap() {
        let syms = vec!["BTCUSDT".to_string()];
        assert!(gap_window(1_000, 50_000, 60_000, &syms).is_none());
        let gap = gap_window(1_000, 61_000, 60_000, &syms).unwrap();
        assert_eq!(gap.downtime_ms(), 60_000);
    }
}
