//! One upstream WebSocket session.
//!
//! Owns the socket for its slot in the farm: connect, authenticate behind a
//! grace window, restore this session's subscription set, then stream until
//! the connection drops or shutdown is requested. Reconnects with jittered
//! exponential backoff bounded by an attempt budget; past the budget the
//! session reports itself dead and the farm surfaces `connected=false`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{FarmEvent, FarmStats, FeedMessage, SubscriptionTable};
use crate::models::{Quote, RawTrade};
use crate::quotes::QuoteCache;

/// Channels per subscribe/unsubscribe frame
const SUBSCRIBE_CHUNK: usize = 100;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub api_key: String,
    pub auth_grace_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub jitter_factor: f64,
}

impl SessionConfig {
    pub fn from_config(cfg: &crate::models::Config) -> Self {
        Self {
            url: cfg.upstream_url.clone(),
            api_key: cfg.api_key.clone(),
            auth_grace_ms: 1_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: cfg.reconnect_interval_ms.max(1),
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            jitter_factor: 0.3,
        }
    }
}

/// Commands a session accepts from the farm and the rebalancer
#[derive(Debug)]
pub enum SessionCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Why a single connection attempt ended
enum StreamEnd {
    Shutdown,
    AuthRejected,
    Disconnected(anyhow::Error),
}

pub struct Session {
    pub index: usize,
    cfg: SessionConfig,
    commands: mpsc::Receiver<SessionCommand>,
    trades_tx: mpsc::Sender<RawTrade>,
    quotes: Arc<QuoteCache>,
    events_tx: mpsc::Sender<FarmEvent>,
    subscriptions: Arc<SubscriptionTable>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<FarmStats>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        cfg: SessionConfig,
        commands: mpsc::Receiver<SessionCommand>,
        trades_tx: mpsc::Sender<RawTrade>,
        quotes: Arc<QuoteCache>,
        events_tx: mpsc::Sender<FarmEvent>,
        subscriptions: Arc<SubscriptionTable>,
        shutdown: watch::Receiver<bool>,
        stats: Arc<FarmStats>,
    ) -> Self {
        Self {
            index,
            cfg,
            commands,
            trades_tx,
            quotes,
            events_tx,
            subscriptions,
            shutdown,
            stats,
        }
    }

    /// Run the session until shutdown, permanent auth rejection, or an
    /// exhausted reconnect budget.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                return;
            }

            match self.connect_and_stream().await {
                StreamEnd::Shutdown => return,
                StreamEnd::AuthRejected => {
                    warn!(session = self.index, "upstream rejected auth");
                    let _ = self.events_tx.send(FarmEvent::AuthRejected(self.index)).await;
                    return;
                }
                StreamEnd::Disconnected(e) => {
                    // A connection that made it through auth earns a fresh
                    // budget; the flag drops until the next auth completes.
                    if self.stats.authed(self.index) {
                        attempt = 0;
                    }
                    self.stats.set_authed(self.index, false);
                    attempt += 1;
                    self.stats.bump_reconnects();
                    if attempt > self.cfg.max_reconnect_attempts {
                        warn!(
                            session = self.index,
                            attempts = attempt - 1,
                            "reconnect budget exhausted; session going dark"
                        );
                        let _ = self.events_tx.send(FarmEvent::SessionDead(self.index)).await;
                        return;
                    }

                    let backoff = self.backoff(attempt);
                    warn!(
                        session = self.index,
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "session disconnected; reconnecting"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.changed() => return,
                    }
                }
            }
        }
    }

    /// One full connection lifecycle.
    async fn connect_and_stream(&mut self) -> StreamEnd {
        self.stats.set_authed(self.index, false);

        let (ws, _resp) = match connect_async(&self.cfg.url).await {
            Ok(ok) => ok,
            Err(e) => return StreamEnd::Disconnected(e.into()),
        };
        debug!(session = self.index, "socket open");

        let (mut write, mut read) = ws.split();

        let auth_frame = serde_json::json!({
            "action": "auth",
            "params": self.cfg.api_key,
        });
        if let Err(e) = write.send(Message::Text(auth_frame.to_string())).await {
            return StreamEnd::Disconnected(e.into());
        }

        // Grace window: authenticated once the socket has stayed open for the
        // grace interval, as long as no auth_failed status arrived. A positive
        // status inside the window just confirms early.
        let opened = Instant::now();
        let grace = Duration::from_millis(self.cfg.auth_grace_ms);
        let mut saw_positive = false;

        while opened.elapsed() < grace {
            let remaining = grace.saturating_sub(opened.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => break,
                _ = self.shutdown.changed() => return StreamEnd::Shutdown,
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match self.scan_auth_statuses(&text) {
                                AuthScan::Failed => return StreamEnd::AuthRejected,
                                AuthScan::Positive => saw_positive = true,
                                AuthScan::Neutral => {}
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return StreamEnd::Disconnected(anyhow::anyhow!(
                                "closed during auth: {frame:?}"
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return StreamEnd::Disconnected(e.into()),
                        None => {
                            return StreamEnd::Disconnected(anyhow::anyhow!(
                                "stream ended during auth"
                            ))
                        }
                    }
                }
            }
        }

        self.stats.set_authed(self.index, true);
        info!(
            session = self.index,
            confirmed = saw_positive,
            "session authenticated"
        );
        let _ = self
            .events_tx
            .send(FarmEvent::Authenticated(self.index))
            .await;

        // Restore this session's subscription set verbatim.
        let restore = self.subscriptions.channels(self.index);
        if !restore.is_empty() {
            if let Err(e) = send_subscribe(&mut write, &restore).await {
                return StreamEnd::Disconnected(e);
            }
            info!(
                session = self.index,
                channels = restore.len(),
                "subscriptions restored"
            );
        }

        // Stream until something gives.
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return StreamEnd::Shutdown;
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return StreamEnd::Shutdown;
                    };
                    let result = match cmd {
                        SessionCommand::Subscribe(channels) => {
                            send_subscribe(&mut write, &channels).await
                        }
                        SessionCommand::Unsubscribe(channels) => {
                            send_unsubscribe(&mut write, &channels).await
                        }
                    };
                    if let Err(e) = result {
                        return StreamEnd::Disconnected(e);
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.bump_frames();
                            if let AuthScan::Failed = self.handle_frame(&text).await {
                                return StreamEnd::AuthRejected;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return StreamEnd::Disconnected(anyhow::anyhow!(
                                "server close: {frame:?}"
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return StreamEnd::Disconnected(e.into()),
                        None => {
                            return StreamEnd::Disconnected(anyhow::anyhow!("stream ended"))
                        }
                    }
                }
            }
        }
    }

    /// Decode one text frame (a JSON array of messages or a bare message)
    /// and dispatch trades/quotes. Returns Failed if an auth_failed status
    /// shows up mid-stream.
    async fn handle_frame(&self, text: &str) -> AuthScan {
        for value in parse_frame(text) {
            match serde_json::from_value::<FeedMessage>(value) {
                Ok(FeedMessage::Trade { sym, p, s, x, c, t, q }) => {
                    self.stats.bump_raw_trades();
                    if p <= 0.0 || s == 0 {
                        self.stats.bump_malformed();
                        continue;
                    }
                    let trade = RawTrade {
                        symbol: sym,
                        price: p,
                        size: s,
                        exchange_id: x,
                        conditions: c,
                        // Nanoseconds on the wire; milliseconds everywhere else.
                        executed_at_ms: t / 1_000_000,
                        sequence: q,
                    };
                    if self.trades_tx.send(trade).await.is_err() {
                        return AuthScan::Neutral;
                    }
                }
                Ok(FeedMessage::Quote { sym, bp, ap, bs, ask_size, t }) => {
                    self.stats.bump_quotes();
                    self.quotes.store(
                        &sym,
                        Quote {
                            bid: bp,
                            ask: ap,
                            bid_size: bs,
                            ask_size,
                            quoted_at_ms: t / 1_000_000,
                        },
                    );
                }
                Ok(FeedMessage::Status { status, message }) => {
                    debug!(session = self.index, status = %status, message = %message, "status frame");
                    if status == "auth_failed" {
                        return AuthScan::Failed;
                    }
                }
                Err(_) => {
                    self.stats.bump_parse_errors();
                }
            }
        }
        AuthScan::Neutral
    }

    fn scan_auth_statuses(&self, text: &str) -> AuthScan {
        let mut scan = AuthScan::Neutral;
        for value in parse_frame(text) {
            if let Ok(FeedMessage::Status { status, .. }) =
                serde_json::from_value::<FeedMessage>(value)
            {
                match status.as_str() {
                    "auth_failed" => return AuthScan::Failed,
                    "auth_success" | "connected" => scan = AuthScan::Positive,
                    _ => {}
                }
            }
        }
        scan
    }

    /// Exponential backoff with jitter, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .cfg
            .reconnect_base_ms
            .saturating_mul(1u64 << attempt.min(16).saturating_sub(1))
            .min(self.cfg.reconnect_cap_ms);
        let jitter_span = (exp as f64 * self.cfg.jitter_factor) as i64;
        let jitter = if jitter_span > 0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0
        };
        Duration::from_millis((exp as i64 + jitter).max(0) as u64)
    }
}

/// Frames arrive as arrays of messages; tolerate bare objects too.
fn parse_frame(text: &str) -> Vec<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(values)) => values,
        Ok(value) => vec![value],
        Err(_) => Vec::new(),
    }
}

async fn send_subscribe<S>(write: &mut S, channels: &[String]) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    send_action(write, "subscribe", channels).await
}

async fn send_unsubscribe<S>(write: &mut S, channels: &[String]) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    send_action(write, "unsubscribe", channels).await
}

async fn send_action<S>(write: &mut S, action: &str, channels: &[String]) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    for chunk in channels.chunks(SUBSCRIBE_CHUNK) {
        let frame = serde_json::json!({
            "action": action,
            "params": chunk.join(","),
        });
        write
            .send(Message::Text(frame.to_string()))
            .await
            .with_context(|| format!("send {action} frame"))?;
    }
    Ok(())
}

enum AuthScan {
    Positive,
    Failed,
    Neutral,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_parsing_tolerates_arrays_and_bare_objects() {
        let arr = r#"[{"ev":"status","status":"connected"},{"ev":"status","status":"auth_success"}]"#;
        assert_eq!(parse_frame(arr).len(), 2);

        let bare = r#"{"ev":"status","status":"connected"}"#;
        assert_eq!(parse_frame(bare).len(), 1);

        assert!(parse_frame("not json").is_empty());
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = SessionConfig {
            url: String::new(),
            api_key: String::new(),
            auth_grace_ms: 1_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 5_000,
            max_reconnect_attempts: 10,
            jitter_factor: 0.0,
        };
        let (_tx, commands) = mpsc::channel(1);
        let (trades_tx, _trades_rx) = mpsc::channel(1);
        let (events_tx, _events_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let session = Session::new(
            0,
            cfg,
            commands,
            trades_tx,
            Arc::new(QuoteCache::new()),
            events_tx,
            Arc::new(SubscriptionTable::new(1)),
            shutdown,
            Arc::new(FarmStats::new(1)),
        );

        assert_eq!(session.backoff(1), Duration::from_millis(1_000));
        assert_eq!(session.backoff(2), Duration::from_millis(2_000));
        assert_eq!(session.backoff(3), Duration::from_millis(4_000));
        assert_eq!(session.backoff(4), Duration::from_millis(5_000));
        assert_eq!(session.backoff(10), Duration::from_millis(5_000));
    }
}
