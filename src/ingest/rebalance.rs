//! Volume-driven quote subscription rebalancing.
//!
//! The dispatcher records traded size per contract; every rebalance tick the
//! table is frozen, contracts are partitioned into the static tier (pinned
//! underlyings) and a volume-ranked dynamic tier, and each tier is chunked
//! evenly across its session range. The planner only produces desired sets;
//! the runner diffs them against the subscription table and pushes
//! subscribe/unsubscribe commands through each session's channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::session::SessionCommand;
use super::SubscriptionTable;

/// Rolling per-contract traded-size counters, written by the dispatcher.
pub struct VolumeTable {
    inner: Mutex<HashMap<String, ContractVolume>>,
}

#[derive(Debug, Clone, Copy)]
struct ContractVolume {
    size: u64,
    static_tier: bool,
}

/// One frozen row of the volume snapshot
#[derive(Debug, Clone)]
pub struct VolumeRow {
    pub symbol: String,
    pub size: u64,
    pub static_tier: bool,
}

impl VolumeTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::with_capacity(4096)),
        }
    }

    pub fn record(&self, symbol: &str, size: u32, static_tier: bool) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(symbol.to_string()).or_insert(ContractVolume {
            size: 0,
            static_tier,
        });
        entry.size += size as u64;
        entry.static_tier |= static_tier;
    }

    /// Freeze the current counters.
    pub fn snapshot(&self) -> Vec<VolumeRow> {
        self.inner
            .lock()
            .iter()
            .map(|(symbol, v)| VolumeRow {
                symbol: symbol.clone(),
                size: v.size,
                static_tier: v.static_tier,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for VolumeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    pub sessions_total: usize,
    pub sessions_static: usize,
    pub quotes_per_session: usize,
}

impl RebalanceConfig {
    pub fn from_config(cfg: &crate::models::Config) -> Self {
        Self {
            sessions_total: cfg.sessions_total,
            sessions_static: cfg.sessions_static,
            quotes_per_session: cfg.quotes_per_session,
        }
    }

    fn sessions_dynamic(&self) -> usize {
        self.sessions_total - self.sessions_static
    }
}

/// Desired quote channels per session, `Q.<symbol>` form.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub per_session: Vec<Vec<String>>,
}

impl RebalancePlan {
    pub fn total_channels(&self) -> usize {
        self.per_session.iter().map(|s| s.len()).sum()
    }
}

/// Partition a frozen volume snapshot into per-session quote channel sets.
pub fn plan_rebalance(mut snapshot: Vec<VolumeRow>, cfg: &RebalanceConfig) -> RebalancePlan {
    // Rank once, highest traded size first; ties break on symbol so the plan
    // is deterministic for a given snapshot.
    snapshot.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.symbol.cmp(&b.symbol)));

    let static_budget = cfg.sessions_static * cfg.quotes_per_session;
    let dynamic_budget = cfg.sessions_dynamic() * cfg.quotes_per_session;

    let static_set: Vec<&VolumeRow> = snapshot
        .iter()
        .filter(|r| r.static_tier)
        .take(static_budget)
        .collect();
    let dynamic_set: Vec<&VolumeRow> = snapshot
        .iter()
        .filter(|r| !r.static_tier)
        .take(dynamic_budget)
        .collect();

    let mut per_session: Vec<Vec<String>> = vec![Vec::new(); cfg.sessions_total];
    chunk_evenly(&static_set, &mut per_session[..cfg.sessions_static]);
    chunk_evenly(&dynamic_set, &mut per_session[cfg.sessions_static..]);

    RebalancePlan { per_session }
}

/// Spread rows across the slots so no slot carries more than its even share
/// (rounded up); slot sizes never differ by more than one.
fn chunk_evenly(rows: &[&VolumeRow], slots: &mut [Vec<String>]) {
    if slots.is_empty() {
        return;
    }
    for (i, row) in rows.iter().enumerate() {
        slots[i % slots.len()].push(format!("Q.{}", row.symbol));
    }
}

/// Periodic rebalance task. The first run is offset by one full interval.
pub async fn run_rebalancer(
    interval_ms: u64,
    volume: Arc<VolumeTable>,
    table: Arc<SubscriptionTable>,
    cfg: RebalanceConfig,
    command_txs: Vec<mpsc::Sender<SessionCommand>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = std::time::Duration::from_millis(interval_ms.max(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                debug!("rebalancer shutting down");
                return;
            }
        }

        let snapshot = volume.snapshot();
        if snapshot.is_empty() {
            debug!("rebalance tick with empty volume table");
            continue;
        }

        let plan = plan_rebalance(snapshot, &cfg);
        apply_plan(&plan, &table, &command_txs).await;
    }
}

/// Diff the plan against the subscription table and push the deltas.
/// Non-quote channels (the trade firehose on session 0) are left untouched.
pub async fn apply_plan(
    plan: &RebalancePlan,
    table: &SubscriptionTable,
    command_txs: &[mpsc::Sender<SessionCommand>],
) {
    let mut subscribed_total = 0usize;
    let mut changes = 0usize;

    for (session, desired) in plan.per_session.iter().enumerate() {
        let Some(tx) = command_txs.get(session) else {
            continue;
        };

        let current = table.channels(session);
        let desired_set: HashSet<&String> = desired.iter().collect();

        let removals: Vec<String> = current
            .iter()
            .filter(|c| c.starts_with("Q.") && !desired_set.contains(c))
            .cloned()
            .collect();
        let additions: Vec<String> = desired
            .iter()
            .filter(|c| !current.contains(*c))
            .cloned()
            .collect();

        subscribed_total += desired.len();
        changes += removals.len() + additions.len();

        if !removals.is_empty() {
            table.remove(session, &removals);
            if tx
                .send(SessionCommand::Unsubscribe(removals))
                .await
                .is_err()
            {
                warn!(session, "session command channel closed during rebalance");
                continue;
            }
        }
        if !additions.is_empty() {
            table.insert(session, &additions);
            if tx.send(SessionCommand::Subscribe(additions)).await.is_err() {
                warn!(session, "session command channel closed during rebalance");
            }
        }
    }

    info!(
        channels = subscribed_total,
        changes, "rebalance applied"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RebalanceConfig {
        RebalanceConfig {
            sessions_total: 10,
            sessions_static: 3,
            quotes_per_session: 1000,
        }
    }

    fn contract(i: usize) -> String {
        format!("O:T{i:04}A251219C00100000")
    }

    #[test]
    fn skewed_volume_plan_respects_budgets() {
        // 2,000 contracts with a skewed distribution: contract i trades
        // i*3 + 1 total size, a handful pinned static.
        let mut volume = VolumeTable::new();
        for i in 0..2_000usize {
            volume.record(&contract(i), (i * 3 + 1) as u32, i % 100 == 0);
        }
        assert_eq!(volume.len(), 2_000);

        let cfg = cfg();
        let plan = plan_rebalance(volume.snapshot(), &cfg);

        // (i) aggregate count within the total budget
        assert!(plan.total_channels() <= cfg.sessions_total * cfg.quotes_per_session);

        // (iii) no session exceeds its own budget
        for session in &plan.per_session {
            assert!(session.len() <= cfg.quotes_per_session);
        }

        // (ii) the top dynamic contracts by volume are all present
        let dynamic_planned: HashSet<&String> = plan.per_session[cfg.sessions_static..]
            .iter()
            .flatten()
            .collect();
        let mut rows: Vec<VolumeRow> = volume
            .snapshot()
            .into_iter()
            .filter(|r| !r.static_tier)
            .collect();
        rows.sort_by(|a, b| b.size.cmp(&a.size));
        let budget = (cfg.sessions_total - cfg.sessions_static) * cfg.quotes_per_session;
        for row in rows.iter().take(budget) {
            let channel = format!("Q.{}", row.symbol);
            assert!(dynamic_planned.contains(&channel), "missing {channel}");
        }

        // Static contracts land only on static sessions.
        let static_planned: usize = plan.per_session[..cfg.sessions_static]
            .iter()
            .map(|s| s.len())
            .sum();
        assert_eq!(static_planned, 20);
    }

    #[test]
    fn static_overflow_is_truncated_by_volume() {
        let cfg = RebalanceConfig {
            sessions_total: 2,
            sessions_static: 1,
            quotes_per_session: 5,
        };
        let mut volume = VolumeTable::new();
        for i in 0..20usize {
            volume.record(&contract(i), (i + 1) as u32, true);
        }
        let plan = plan_rebalance(volume.snapshot(), &cfg);
        assert_eq!(plan.per_session[0].len(), 5);
        // Highest-volume static contract survives truncation.
        assert!(plan.per_session[0].contains(&format!("Q.{}", contract(19))));
        assert!(plan.per_session[1].is_empty());
    }

    #[test]
    fn chunking_balances_sessions() {
        let cfg = RebalanceConfig {
            sessions_total: 4,
            sessions_static: 1,
            quotes_per_session: 100,
        };
        let mut volume = VolumeTable::new();
        for i in 0..31usize {
            volume.record(&contract(i), 10, false);
        }
        let plan = plan_rebalance(volume.snapshot(), &cfg);
        let sizes: Vec<usize> = plan.per_session[1..].iter().map(|s| s.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 31);
        let max = sizes.iter().max().copied().unwrap_or(0);
        let min = sizes.iter().min().copied().unwrap_or(0);
        assert!(max - min <= 1, "uneven chunks: {sizes:?}");
    }

    #[test]
    fn volume_accumulates_and_pins_static_flag() {
        let volume = VolumeTable::new();
        volume.record("O:SPY251115P00580000", 10, false);
        volume.record("O:SPY251115P00580000", 15, true);
        let snapshot = volume.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].size, 25);
        assert!(snapshot[0].static_tier);
    }
}
