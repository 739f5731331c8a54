//! Multi-session WebSocket ingestion farm.
//!
//! N sessions share one upstream account: session 0 carries the global trade
//! firehose, the static range carries pinned-underlying quote subscriptions,
//! and the dynamic range carries volume-ranked quote subscriptions. Session
//! readers push raw trades onto a single dispatcher (the only writer of the
//! dedup set), which shards them by contract symbol onto single-threaded
//! aggregator workers. Workers classify and fan out to the sink queue
//! (bounded, back-pressuring) and the broadcast hub (lossy).

pub mod rebalance;
pub mod session;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregator::{AggregatorConfig, Emission, TradeAggregator};
use crate::classifier::Classifier;
use crate::contract::OptionContract;
use crate::hub::FlowHub;
use crate::models::{ClassifiedTrade, Config, RawTrade};
use crate::quotes::QuoteCache;

use rebalance::VolumeTable;
use session::{Session, SessionCommand, SessionConfig};

/// Raw trades queued from session readers to the dispatcher
const TRADE_QUEUE: usize = 8_192;
/// Per-shard-worker queue
const WORKER_QUEUE: usize = 4_096;
/// Aggregator shard workers (single writer per contract shard)
const SHARD_WORKERS: usize = 4;
/// Cadence for flushing buffered prints whose hold window elapsed
const POLL_INTERVAL_MS: u64 = 50;
/// Dedup set bulk-clears past this many `(symbol, sequence)` pairs
const DEDUP_MAX: usize = 100_000;
/// Worker-local contract cache bulk-clears past this many entries
const CONTRACT_CACHE_MAX: usize = 100_000;

/// Upstream frame payloads, discriminated on `ev`.
#[derive(Debug, Deserialize)]
#[serde(tag = "ev")]
pub enum FeedMessage {
    #[serde(rename = "T")]
    Trade {
        sym: String,
        p: f64,
        s: u32,
        #[serde(default)]
        x: i32,
        #[serde(default)]
        c: Vec<i32>,
        t: i64,
        #[serde(default)]
        q: u64,
    },
    #[serde(rename = "Q")]
    Quote {
        sym: String,
        bp: f64,
        ap: f64,
        #[serde(default)]
        bs: u32,
        #[serde(rename = "as", default)]
        ask_size: u32,
        t: i64,
    },
    #[serde(rename = "status")]
    Status {
        #[serde(default)]
        status: String,
        #[serde(default)]
        message: String,
    },
}

/// Session lifecycle notifications to the farm supervisor
#[derive(Debug)]
pub enum FarmEvent {
    Authenticated(usize),
    AuthRejected(usize),
    SessionDead(usize),
}

/// Hot-path counters; snapshotted for `/health` and the minute log line.
pub struct FarmStats {
    pub frames: AtomicU64,
    pub raw_trades: AtomicU64,
    pub quotes: AtomicU64,
    pub trades_dispatched: AtomicU64,
    pub classified: AtomicU64,
    pub parse_errors: AtomicU64,
    pub malformed: AtomicU64,
    pub dedup_dropped: AtomicU64,
    pub dedup_clears: AtomicU64,
    pub reconnects: AtomicU64,
    authed: Vec<AtomicBool>,
    dead_sessions: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmStatsSnapshot {
    pub connected: bool,
    pub sessions_authenticated: usize,
    pub frames: u64,
    pub raw_trades: u64,
    pub quotes: u64,
    pub trades_dispatched: u64,
    pub classified: u64,
    pub parse_errors: u64,
    pub malformed: u64,
    pub dedup_dropped: u64,
    pub reconnects: u64,
}

impl FarmStats {
    pub fn new(sessions: usize) -> Self {
        Self {
            frames: AtomicU64::new(0),
            raw_trades: AtomicU64::new(0),
            quotes: AtomicU64::new(0),
            trades_dispatched: AtomicU64::new(0),
            classified: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            dedup_dropped: AtomicU64::new(0),
            dedup_clears: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            authed: (0..sessions).map(|_| AtomicBool::new(false)).collect(),
            dead_sessions: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn bump_frames(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_raw_trades(&self) {
        self.raw_trades.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_quotes(&self) {
        self.quotes.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_trades_dispatched(&self) {
        self.trades_dispatched.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_classified(&self) {
        self.classified.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_parse_errors(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_dedup_dropped(&self) {
        self.dedup_dropped.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_dedup_clears(&self) {
        self.dedup_clears.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn bump_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_authed(&self, session: usize, value: bool) {
        if let Some(flag) = self.authed.get(session) {
            flag.store(value, Ordering::Relaxed);
        }
    }

    pub fn authed(&self, session: usize) -> bool {
        self.authed
            .get(session)
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn mark_dead(&self) {
        self.dead_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// False once any session has burned through its reconnect budget.
    pub fn connected(&self) -> bool {
        self.dead_sessions.load(Ordering::Relaxed) == 0
    }

    pub fn snapshot(&self) -> FarmStatsSnapshot {
        FarmStatsSnapshot {
            connected: self.connected(),
            sessions_authenticated: self
                .authed
                .iter()
                .filter(|f| f.load(Ordering::Relaxed))
                .count(),
            frames: self.frames.load(Ordering::Relaxed),
            raw_trades: self.raw_trades.load(Ordering::Relaxed),
            quotes: self.quotes.load(Ordering::Relaxed),
            trades_dispatched: self.trades_dispatched.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dedup_dropped: self.dedup_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Per-session channel sets. Rewritten only by the rebalance task (plus the
/// one-time trade-firehose insert on session 0 at startup); sessions read
/// their slot to restore subscriptions after a reconnect.
pub struct SubscriptionTable {
    slots: Mutex<Vec<HashSet<String>>>,
}

impl SubscriptionTable {
    pub fn new(sessions: usize) -> Self {
        Self {
            slots: Mutex::new(vec![HashSet::new(); sessions]),
        }
    }

    pub fn channels(&self, session: usize) -> Vec<String> {
        self.slots
            .lock()
            .get(session)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, session: usize, channel: &str) -> bool {
        self.slots
            .lock()
            .get(session)
            .map(|s| s.contains(channel))
            .unwrap_or(false)
    }

    pub fn insert(&self, session: usize, channels: &[String]) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(session) {
            slot.extend(channels.iter().cloned());
        }
    }

    pub fn remove(&self, session: usize, channels: &[String]) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(session) {
            for channel in channels {
                slot.remove(channel);
            }
        }
    }

    pub fn count(&self, session: usize) -> usize {
        self.slots.lock().get(session).map(|s| s.len()).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.slots.lock().iter().map(|s| s.len()).sum()
    }
}

/// Single-writer `(symbol, sequence)` suppression with bulk clear.
pub struct DedupSet {
    seen: HashSet<(String, u64)>,
    cap: usize,
}

impl DedupSet {
    pub fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(cap.min(1 << 17)),
            cap,
        }
    }

    /// True when the pair is fresh. Clears wholesale past the cap; the goal
    /// is only to suppress bursts, not to be a durable index.
    pub fn check_and_insert(&mut self, symbol: &str, sequence: u64) -> DedupOutcome {
        if self.seen.contains(&(symbol.to_string(), sequence)) {
            return DedupOutcome::Duplicate;
        }
        let cleared = if self.seen.len() >= self.cap {
            self.seen.clear();
            true
        } else {
            false
        };
        self.seen.insert((symbol.to_string(), sequence));
        if cleared {
            DedupOutcome::FreshAfterClear
        } else {
            DedupOutcome::Fresh
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DedupOutcome {
    Fresh,
    FreshAfterClear,
    Duplicate,
}

fn symbol_shard(symbol: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    hasher.finish() as usize % shards.max(1)
}

/// Running farm handle
pub struct IngestFarm {
    pub stats: Arc<FarmStats>,
    pub command_txs: Vec<mpsc::Sender<SessionCommand>>,
    handles: Vec<JoinHandle<()>>,
}

impl IngestFarm {
    /// Open every session, wait for the auth barrier, then put the trade
    /// firehose on session 0. Quote subscriptions arrive later via the
    /// rebalancer as contracts show up in trades.
    pub async fn start(
        cfg: &Config,
        quotes: Arc<QuoteCache>,
        volume: Arc<VolumeTable>,
        table: Arc<SubscriptionTable>,
        hub: Arc<FlowHub>,
        sink_tx: mpsc::Sender<Arc<ClassifiedTrade>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let stats = Arc::new(FarmStats::new(cfg.sessions_total));
        let session_cfg = SessionConfig::from_config(cfg);
        let static_tickers: HashSet<String> = cfg.static_tier_tickers.iter().cloned().collect();

        let (trades_tx, trades_rx) = mpsc::channel::<RawTrade>(TRADE_QUEUE);
        let (events_tx, mut events_rx) = mpsc::channel::<FarmEvent>(cfg.sessions_total * 4);

        let mut handles = Vec::new();
        let mut command_txs = Vec::with_capacity(cfg.sessions_total);

        for index in 0..cfg.sessions_total {
            let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(64);
            command_txs.push(cmd_tx);

            let session = Session::new(
                index,
                session_cfg.clone(),
                cmd_rx,
                trades_tx.clone(),
                quotes.clone(),
                events_tx.clone(),
                table.clone(),
                shutdown.clone(),
                stats.clone(),
            );
            handles.push(tokio::spawn(session.run()));
        }
        // Sessions hold the only long-lived clones.
        drop(trades_tx);
        drop(events_tx);

        // Shard workers own the aggregators; the dispatcher owns the dedup set.
        let agg_cfg = AggregatorConfig::from_config(cfg);
        let mut worker_txs = Vec::with_capacity(SHARD_WORKERS);
        for _ in 0..SHARD_WORKERS {
            let (tx, rx) = mpsc::channel::<(RawTrade, OptionContract)>(WORKER_QUEUE);
            worker_txs.push(tx);
            handles.push(tokio::spawn(run_worker(
                rx,
                TradeAggregator::new(agg_cfg.clone()),
                quotes.clone(),
                hub.clone(),
                sink_tx.clone(),
                stats.clone(),
            )));
        }
        drop(sink_tx);

        handles.push(tokio::spawn(run_dispatcher(
            trades_rx,
            worker_txs,
            volume,
            static_tickers,
            stats.clone(),
        )));

        // Startup barrier: every session authenticated before the firehose
        // subscription goes out.
        let mut authed: HashSet<usize> = HashSet::new();
        while authed.len() < cfg.sessions_total {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(FarmEvent::Authenticated(i)) => {
                            authed.insert(i);
                        }
                        Some(FarmEvent::AuthRejected(i)) => {
                            anyhow::bail!("session {i} rejected by upstream auth");
                        }
                        Some(FarmEvent::SessionDead(i)) => {
                            anyhow::bail!("session {i} exhausted reconnects during startup");
                        }
                        None => anyhow::bail!("all sessions exited during startup"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested during startup barrier");
                    return Ok(Self { stats, command_txs, handles });
                }
            }
        }
        info!(sessions = cfg.sessions_total, "all sessions authenticated");

        let firehose = vec!["T.*".to_string()];
        table.insert(0, &firehose);
        if command_txs[0]
            .send(SessionCommand::Subscribe(firehose))
            .await
            .is_err()
        {
            anyhow::bail!("session 0 went away before the trade subscription");
        }

        // Keep absorbing lifecycle events after startup; a dead session flips
        // the health flag.
        let monitor_stats = stats.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    FarmEvent::Authenticated(_) => {}
                    FarmEvent::AuthRejected(i) | FarmEvent::SessionDead(i) => {
                        warn!(session = i, "session permanently offline");
                        monitor_stats.mark_dead();
                    }
                }
            }
        }));

        Ok(Self {
            stats,
            command_txs,
            handles,
        })
    }

    /// Await every farm task; used by the supervisor during shutdown after
    /// flipping the shutdown signal.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Single-writer dispatcher: dedup, malformed filtering, volume recording,
/// then contract-symbol sharding onto the aggregator workers.
async fn run_dispatcher(
    mut trades_rx: mpsc::Receiver<RawTrade>,
    worker_txs: Vec<mpsc::Sender<(RawTrade, OptionContract)>>,
    volume: Arc<VolumeTable>,
    static_tickers: HashSet<String>,
    stats: Arc<FarmStats>,
) {
    let mut dedup = DedupSet::new(DEDUP_MAX);

    while let Some(trade) = trades_rx.recv().await {
        match dedup.check_and_insert(&trade.symbol, trade.sequence) {
            DedupOutcome::Duplicate => {
                stats.bump_dedup_dropped();
                continue;
            }
            DedupOutcome::FreshAfterClear => stats.bump_dedup_clears(),
            DedupOutcome::Fresh => {}
        }

        let contract = match OptionContract::parse(&trade.symbol) {
            Ok(c) => c,
            Err(_) => {
                stats.bump_malformed();
                continue;
            }
        };

        let is_static = static_tickers.contains(&contract.underlying);
        volume.record(&trade.symbol, trade.size, is_static);

        let shard = symbol_shard(&trade.symbol, worker_txs.len());
        if worker_txs[shard].send((trade, contract)).await.is_err() {
            return;
        }
        stats.bump_trades_dispatched();
    }
}

/// One aggregator shard: buffers prints, emits verdicts, classifies, and
/// fans out. The sink send back-pressures; the hub publish never does.
async fn run_worker(
    mut rx: mpsc::Receiver<(RawTrade, OptionContract)>,
    mut aggregator: TradeAggregator,
    quotes: Arc<QuoteCache>,
    hub: Arc<FlowHub>,
    sink_tx: mpsc::Sender<Arc<ClassifiedTrade>>,
    stats: Arc<FarmStats>,
) {
    let mut contracts: HashMap<String, OptionContract> = HashMap::with_capacity(4_096);
    let mut ticker = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            item = rx.recv() => {
                let Some((trade, contract)) = item else {
                    break;
                };
                if contracts.len() >= CONTRACT_CACHE_MAX {
                    contracts.clear();
                }
                contracts
                    .entry(trade.symbol.clone())
                    .or_insert(contract);
                let emissions = aggregator.process(trade);
                if !dispatch_emissions(emissions, &contracts, &quotes, &hub, &sink_tx, &stats).await
                {
                    return;
                }
            }
            _ = ticker.tick() => {
                let emissions = aggregator.poll();
                if !dispatch_emissions(emissions, &contracts, &quotes, &hub, &sink_tx, &stats).await
                {
                    return;
                }
            }
        }
    }

    // Shutdown drain: everything still buffered goes out once.
    let emissions = aggregator.flush();
    let _ = dispatch_emissions(emissions, &contracts, &quotes, &hub, &sink_tx, &stats).await;
}

async fn dispatch_emissions(
    emissions: Vec<Emission>,
    contracts: &HashMap<String, OptionContract>,
    quotes: &QuoteCache,
    hub: &FlowHub,
    sink_tx: &mpsc::Sender<Arc<ClassifiedTrade>>,
    stats: &FarmStats,
) -> bool {
    for emission in emissions {
        let contract = match contracts.get(&emission.trade.symbol) {
            Some(c) => c.clone(),
            // Cache got bulk-cleared under us; the symbol already parsed once.
            None => match OptionContract::parse(&emission.trade.symbol) {
                Ok(c) => c,
                Err(_) => {
                    stats.bump_malformed();
                    continue;
                }
            },
        };

        let quote = quotes.lookup(&emission.trade.symbol);
        let classified = Arc::new(Classifier::classify(&emission, &contract, quote.as_ref()));

        hub.publish(&classified);
        if sink_tx.send(classified).await.is_err() {
            return false;
        }
        stats.bump_classified();
    }
    true
}
