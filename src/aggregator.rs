//! Sliding-window sweep / block / flow detection.
//!
//! Every raw print lands in a bounded ring and buffers until one of three
//! things happens: the cluster it belongs to is admitted as a sweep (all
//! buffered members of the cluster emit together with one sweep id), its
//! hold window elapses (block predicates are evaluated with full isolation
//! visibility, otherwise it emits as flow), or capacity forces the oldest
//! entry out (it emits with whatever verdict is visible at that moment).
//! Nothing is ever reclassified after emission.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Instant;

use crate::models::{exchange_name, BlockReason, RawTrade, TradeType};

/// Condition codes the trade-type mapping binds to SWEEP (complex ISO).
/// 233 also appears in the OPRA block set; sweep precedence wins.
pub const SWEEP_CONDITION_CODES: &[i32] = &[233];

/// Sweep ids are minted per (contract, 100 ms bucket) so colliding prints
/// across one burst share an id deterministically.
const SWEEP_ID_BUCKET_MS: i64 = 100;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub buffer_max_size: usize,
    pub buffer_max_age_ms: i64,
    pub sweep_window_ms: i64,
    pub sweep_price_delta: f64,
    pub sweep_min_total: u32,
    pub sweep_min_exchanges: usize,
    pub block_min_size: u32,
    pub block_isolation_ms: i64,
    pub block_conditions: Vec<i32>,
    pub dark_venues: Vec<i32>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            buffer_max_size: 10_000,
            buffer_max_age_ms: 5_000,
            sweep_window_ms: 750,
            sweep_price_delta: 0.10,
            sweep_min_total: 100,
            sweep_min_exchanges: 2,
            block_min_size: 500,
            block_isolation_ms: 100,
            block_conditions: vec![229, 230, 233, 234, 235, 236],
            dark_venues: vec![4, 21, 66],
        }
    }
}

impl AggregatorConfig {
    pub fn from_config(cfg: &crate::models::Config) -> Self {
        Self {
            buffer_max_size: cfg.buffer_max_size,
            buffer_max_age_ms: cfg.buffer_max_age_ms,
            sweep_window_ms: cfg.sweep_window_ms,
            sweep_price_delta: cfg.sweep_price_delta,
            sweep_min_total: cfg.sweep_min_total,
            sweep_min_exchanges: cfg.sweep_min_exchanges,
            block_min_size: cfg.block_min_size,
            block_isolation_ms: cfg.block_isolation_ms,
            block_conditions: cfg.block_conditions.clone(),
            dark_venues: cfg.dark_venues.clone(),
        }
    }

    /// How long a print buffers before a terminal (non-sweep) verdict.
    fn hold_ms(&self) -> i64 {
        self.sweep_window_ms.max(self.block_isolation_ms)
    }
}

/// Aggregator verdict for a single print
#[derive(Debug, Clone)]
pub struct Verdict {
    pub trade_type: TradeType,
    pub sweep_id: Option<u64>,
    pub sweep_size: u32,
    pub sweep_exchange_count: u32,
    pub sweep_exchanges: Vec<&'static str>,
    pub is_block: bool,
    pub block_reason: Option<BlockReason>,
}

impl Verdict {
    fn flow() -> Self {
        Self {
            trade_type: TradeType::Flow,
            sweep_id: None,
            sweep_size: 0,
            sweep_exchange_count: 0,
            sweep_exchanges: Vec::new(),
            is_block: false,
            block_reason: None,
        }
    }

    fn block(reason: BlockReason) -> Self {
        Self {
            trade_type: TradeType::Block,
            is_block: true,
            block_reason: Some(reason),
            ..Self::flow()
        }
    }
}

/// One print leaving the aggregator with its verdict attached
#[derive(Debug, Clone)]
pub struct Emission {
    pub trade: RawTrade,
    pub processed_at_ms: i64,
    pub verdict: Verdict,
}

// Per-contract verdict state is derived from `emitted` plus the visible
// cluster; nothing else is stored per entry.
struct WindowEntry {
    id: u64,
    processed_at_ms: i64,
    emitted: bool,
    trade: RawTrade,
}

pub struct TradeAggregator {
    cfg: AggregatorConfig,
    /// Ring ordered by arrival; entry ids are consecutive, so the position of
    /// id `n` is `n - front.id`.
    window: VecDeque<WindowEntry>,
    /// Contract symbol -> entry ids, front-pruned in lockstep with the ring
    index: HashMap<String, VecDeque<u64>>,
    next_id: u64,
    start: Instant,
}

impl TradeAggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(cfg.buffer_max_size.min(16_384)),
            index: HashMap::with_capacity(1024),
            cfg,
            next_id: 0,
            start: Instant::now(),
        }
    }

    /// Monotonic milliseconds since aggregator construction
    pub fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Ingest one print using the internal monotonic clock.
    pub fn process(&mut self, trade: RawTrade) -> Vec<Emission> {
        let now_ms = self.now_ms();
        self.process_at(trade, now_ms)
    }

    /// Flush prints whose hold window elapsed, using the internal clock.
    pub fn poll(&mut self) -> Vec<Emission> {
        let now_ms = self.now_ms();
        self.poll_at(now_ms)
    }

    /// Ingest one print stamped at `now_ms`. Returns every emission this
    /// arrival triggers: the whole buffered cluster on sweep admission,
    /// verdicts for capacity-evicted entries, or nothing while buffering.
    pub fn process_at(&mut self, trade: RawTrade, now_ms: i64) -> Vec<Emission> {
        let mut out = Vec::new();
        self.evict_expired(now_ms, &mut out);

        // Publication order is per-contract: any older print of this contract
        // whose hold has already lapsed goes out before anything this arrival
        // may trigger.
        self.flush_expired_for(&trade.symbol, now_ms, &mut out);

        let cluster: Vec<usize> = self.cluster_positions(&trade.symbol, now_ms);

        if let Some(admitted) = self.admit_sweep(&trade, now_ms, &cluster) {
            // Emit every still-buffered member of the cluster, oldest first,
            // then the current print, all under the shared verdict.
            for &pos in &cluster {
                let entry = &mut self.window[pos];
                if !entry.emitted {
                    entry.emitted = true;
                    out.push(Emission {
                        trade: entry.trade.clone(),
                        processed_at_ms: entry.processed_at_ms,
                        verdict: admitted.clone(),
                    });
                }
            }
            self.push_entry(trade.clone(), now_ms, true);
            out.push(Emission {
                trade,
                processed_at_ms: now_ms,
                verdict: admitted,
            });
        } else {
            self.push_entry(trade, now_ms, false);
        }

        while self.window.len() > self.cfg.buffer_max_size {
            self.flush_front(&mut out);
        }
        out
    }

    /// Emit terminal verdicts for prints whose hold window elapsed.
    pub fn poll_at(&mut self, now_ms: i64) -> Vec<Emission> {
        let mut out = Vec::new();
        self.evict_expired(now_ms, &mut out);

        let hold = self.cfg.hold_ms();
        for pos in 0..self.window.len() {
            let entry = &self.window[pos];
            if entry.emitted || entry.processed_at_ms + hold > now_ms {
                continue;
            }
            let verdict = self.terminal_verdict(pos);
            let entry = &mut self.window[pos];
            entry.emitted = true;
            out.push(Emission {
                trade: entry.trade.clone(),
                processed_at_ms: entry.processed_at_ms,
                verdict,
            });
        }
        out
    }

    /// Emit everything still buffered. Used on shutdown so drained trades
    /// are never lost.
    pub fn flush(&mut self) -> Vec<Emission> {
        let mut out = Vec::new();
        while !self.window.is_empty() {
            self.flush_front(&mut out);
        }
        self.index.clear();
        out
    }

    // ---- internals ----

    fn push_entry(&mut self, trade: RawTrade, now_ms: i64, emitted: bool) {
        let id = self.next_id;
        self.next_id += 1;
        self.index
            .entry(trade.symbol.clone())
            .or_default()
            .push_back(id);
        self.window.push_back(WindowEntry {
            id,
            processed_at_ms: now_ms,
            emitted,
            trade,
        });
    }

    /// Terminal verdicts for this contract's prints whose hold window has
    /// lapsed but that the periodic poll has not reached yet.
    fn flush_expired_for(&mut self, symbol: &str, now_ms: i64, out: &mut Vec<Emission>) {
        let hold = self.cfg.hold_ms();
        let Some(ids) = self.index.get(symbol) else {
            return;
        };
        let Some(front) = self.window.front() else {
            return;
        };
        let front_id = front.id;
        let expired: Vec<usize> = ids
            .iter()
            .map(|&id| (id - front_id) as usize)
            .filter(|&pos| {
                let entry = &self.window[pos];
                !entry.emitted && entry.processed_at_ms + hold <= now_ms
            })
            .collect();

        for pos in expired {
            let verdict = self.terminal_verdict(pos);
            let entry = &mut self.window[pos];
            entry.emitted = true;
            out.push(Emission {
                trade: entry.trade.clone(),
                processed_at_ms: entry.processed_at_ms,
                verdict,
            });
        }
    }

    /// Positions of same-contract entries inside the sweep window of `now_ms`
    fn cluster_positions(&self, symbol: &str, now_ms: i64) -> Vec<usize> {
        let Some(ids) = self.index.get(symbol) else {
            return Vec::new();
        };
        let Some(front) = self.window.front() else {
            return Vec::new();
        };
        let front_id = front.id;
        let cutoff = now_ms - self.cfg.sweep_window_ms;
        ids.iter()
            .map(|&id| (id - front_id) as usize)
            .filter(|&pos| self.window[pos].processed_at_ms >= cutoff)
            .collect()
    }

    /// Sweep admission over the candidate cluster plus the current print.
    /// Returns the shared verdict when admitted.
    fn admit_sweep(&self, trade: &RawTrade, now_ms: i64, cluster: &[usize]) -> Option<Verdict> {
        let condition_sweep = trade
            .conditions
            .iter()
            .any(|c| SWEEP_CONDITION_CODES.contains(c));

        let mut min_price = trade.price;
        let mut max_price = trade.price;
        let mut price_sum = trade.price;
        let mut total_size = trade.size as u64;
        let mut anchor_ms = now_ms;
        let mut exchange_ids: Vec<i32> = vec![trade.exchange_id];
        let count = cluster.len() + 1;

        for &pos in cluster {
            let entry = &self.window[pos];
            min_price = min_price.min(entry.trade.price);
            max_price = max_price.max(entry.trade.price);
            price_sum += entry.trade.price;
            total_size += entry.trade.size as u64;
            anchor_ms = anchor_ms.min(entry.processed_at_ms);
            if !exchange_ids.contains(&entry.trade.exchange_id) {
                exchange_ids.push(entry.trade.exchange_id);
            }
        }

        let cluster_sweep = {
            let mean_price = price_sum / count as f64;
            let min_contracts = if mean_price > 5.0 {
                self.cfg.sweep_min_total
            } else {
                self.cfg.sweep_min_total / 2
            };
            let tight = max_price - min_price <= self.cfg.sweep_price_delta + 1e-9;
            let big_enough = total_size >= min_contracts as u64;
            let multi_venue = exchange_ids.len() >= self.cfg.sweep_min_exchanges
                || (exchange_ids.len() == 1 && count >= 3);
            tight && big_enough && multi_venue
        };

        if !condition_sweep && !cluster_sweep {
            return None;
        }

        let mut exchanges: Vec<&'static str> = Vec::with_capacity(exchange_ids.len());
        for id in &exchange_ids {
            let name = exchange_name(*id);
            if !exchanges.contains(&name) {
                exchanges.push(name);
            }
        }

        Some(Verdict {
            trade_type: TradeType::Sweep,
            sweep_id: Some(sweep_id(&trade.symbol, anchor_ms)),
            sweep_size: total_size.min(u32::MAX as u64) as u32,
            sweep_exchange_count: exchange_ids.len() as u32,
            sweep_exchanges: exchanges,
            is_block: false,
            block_reason: None,
        })
    }

    /// Block-or-flow verdict for a buffered print whose sweep opportunity
    /// has passed.
    fn terminal_verdict(&self, pos: usize) -> Verdict {
        let entry = &self.window[pos];
        let trade = &entry.trade;

        let isolated = !self.has_neighbor(pos);
        if trade.size >= self.cfg.block_min_size && isolated {
            return Verdict::block(BlockReason::LargeIsolated);
        }
        if trade
            .conditions
            .iter()
            .any(|c| self.cfg.block_conditions.contains(c))
        {
            return Verdict::block(BlockReason::OpraBlockCode);
        }
        if self.cfg.dark_venues.contains(&trade.exchange_id)
            && trade.size >= self.cfg.block_min_size
        {
            return Verdict::block(BlockReason::DarkVenue);
        }
        Verdict::flow()
    }

    /// Any other same-contract print within the isolation window?
    fn has_neighbor(&self, pos: usize) -> bool {
        let entry = &self.window[pos];
        let Some(ids) = self.index.get(&entry.trade.symbol) else {
            return false;
        };
        let Some(front) = self.window.front() else {
            return false;
        };
        let front_id = front.id;
        ids.iter()
            .map(|&id| (id - front_id) as usize)
            .any(|other| {
                other != pos
                    && (self.window[other].processed_at_ms - entry.processed_at_ms).abs()
                        <= self.cfg.block_isolation_ms
            })
    }

    fn evict_expired(&mut self, now_ms: i64, out: &mut Vec<Emission>) {
        let cutoff = now_ms - self.cfg.buffer_max_age_ms;
        while self
            .window
            .front()
            .map(|e| e.processed_at_ms < cutoff)
            .unwrap_or(false)
        {
            self.flush_front(out);
        }
    }

    /// Remove the oldest entry, emitting it first when still buffered.
    fn flush_front(&mut self, out: &mut Vec<Emission>) {
        let needs_emit = match self.window.front() {
            Some(front) => !front.emitted,
            None => return,
        };
        if needs_emit {
            let verdict = self.terminal_verdict(0);
            if let Some(front) = self.window.front_mut() {
                front.emitted = true;
                out.push(Emission {
                    trade: front.trade.clone(),
                    processed_at_ms: front.processed_at_ms,
                    verdict,
                });
            }
        }
        if let Some(entry) = self.window.pop_front() {
            if let Some(ids) = self.index.get_mut(&entry.trade.symbol) {
                ids.pop_front();
                if ids.is_empty() {
                    self.index.remove(&entry.trade.symbol);
                }
            }
        }
    }
}

/// Deterministic sweep id: pure function of (symbol, 100 ms bucket)
pub fn sweep_id(symbol: &str, anchor_ms: i64) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    (anchor_ms / SWEEP_ID_BUCKET_MS).hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, price: f64, size: u32, exchange: i32, seq: u64) -> RawTrade {
        RawTrade {
            symbol: symbol.to_string(),
            price,
            size,
            exchange_id: exchange,
            conditions: Vec::new(),
            executed_at_ms: 1_730_000_000_000 + seq as i64,
            sequence: seq,
        }
    }

    fn trade_with_conditions(
        symbol: &str,
        price: f64,
        size: u32,
        exchange: i32,
        seq: u64,
        conditions: Vec<i32>,
    ) -> RawTrade {
        RawTrade {
            conditions,
            ..trade(symbol, price, size, exchange, seq)
        }
    }

    fn aggregator() -> TradeAggregator {
        TradeAggregator::new(AggregatorConfig::default())
    }

    const AMD: &str = "O:AMD251219C00155000";
    const NVDA: &str = "O:NVDA251122C00145000";
    const SPY: &str = "O:SPY251115P00580000";

    #[test]
    fn multi_venue_burst_becomes_sweep() {
        let mut agg = aggregator();
        assert!(agg.process_at(trade(AMD, 5.50, 40, 65, 1), 0).is_empty());
        assert!(agg.process_at(trade(AMD, 5.50, 40, 66, 2), 150).is_empty());

        let out = agg.process_at(trade(AMD, 5.50, 40, 302, 3), 300);
        assert_eq!(out.len(), 3);

        let first_id = out[0].verdict.sweep_id.expect("sweep id set");
        for e in &out {
            assert_eq!(e.verdict.trade_type, TradeType::Sweep);
            assert_eq!(e.verdict.sweep_id, Some(first_id));
            assert_eq!(e.verdict.sweep_exchange_count, 3);
            assert_eq!(e.verdict.sweep_size, 120);
            assert!(!e.verdict.is_block);
        }
        // Arrival order preserved within the contract
        let seqs: Vec<u64> = out.iter().map(|e| e.trade.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn condition_code_admits_single_print_as_sweep() {
        let mut agg = aggregator();
        let out = agg.process_at(
            trade_with_conditions(NVDA, 12.80, 600, 303, 1, vec![233]),
            0,
        );
        assert_eq!(out.len(), 1);
        let v = &out[0].verdict;
        assert_eq!(v.trade_type, TradeType::Sweep);
        assert!(v.sweep_id.is_some());
        assert_eq!(v.sweep_exchange_count, 1);
        assert_eq!(v.sweep_size, 600);
        assert!(v.block_reason.is_none());
    }

    #[test]
    fn isolated_large_print_becomes_block() {
        let mut agg = aggregator();
        assert!(agg.process_at(trade(SPY, 8.25, 800, 303, 1), 0).is_empty());

        let out = agg.poll_at(800);
        assert_eq!(out.len(), 1);
        let v = &out[0].verdict;
        assert_eq!(v.trade_type, TradeType::Block);
        assert!(v.is_block);
        assert_eq!(v.block_reason, Some(BlockReason::LargeIsolated));
        assert!(v.sweep_id.is_none());
    }

    #[test]
    fn neighbor_defeats_isolation() {
        let mut agg = aggregator();
        // Same venue twice: two prints never satisfy the single-venue rule.
        agg.process_at(trade(SPY, 8.25, 800, 303, 1), 0);
        agg.process_at(trade(SPY, 8.30, 5, 303, 2), 60);

        let out = agg.poll_at(900);
        let big = out.iter().find(|e| e.trade.sequence == 1).unwrap();
        // Not isolated and carries no block code: plain flow.
        assert_eq!(big.verdict.trade_type, TradeType::Flow);
    }

    #[test]
    fn dark_venue_large_print_becomes_block() {
        let mut agg = aggregator();
        // A same-venue neighbor defeats isolation without admitting a sweep,
        // leaving the dark-venue rule to fire.
        agg.process_at(trade(SPY, 8.25, 600, 66, 1), 0);
        agg.process_at(trade(SPY, 8.25, 5, 66, 2), 60);

        let out = agg.poll_at(900);
        let dark = out.iter().find(|e| e.trade.sequence == 1).unwrap();
        assert_eq!(dark.verdict.trade_type, TradeType::Block);
        assert_eq!(dark.verdict.block_reason, Some(BlockReason::DarkVenue));
    }

    #[test]
    fn opra_code_becomes_block() {
        let mut agg = aggregator();
        agg.process_at(trade_with_conditions(SPY, 8.25, 50, 303, 1, vec![229]), 0);
        agg.process_at(trade(SPY, 8.25, 10, 303, 2), 50);

        let out = agg.poll_at(900);
        let coded = out.iter().find(|e| e.trade.sequence == 1).unwrap();
        assert_eq!(coded.verdict.trade_type, TradeType::Block);
        assert_eq!(coded.verdict.block_reason, Some(BlockReason::OpraBlockCode));
    }

    #[test]
    fn sweep_takes_precedence_over_block() {
        // A 500-lot satisfying LARGE_ISOLATED size on two venues inside the
        // window resolves to SWEEP.
        let mut agg = aggregator();
        assert!(agg.process_at(trade(SPY, 8.25, 500, 303, 1), 0).is_empty());
        let out = agg.process_at(trade(SPY, 8.25, 500, 301, 2), 50);
        assert_eq!(out.len(), 2);
        for e in &out {
            assert_eq!(e.verdict.trade_type, TradeType::Sweep);
            assert!(!e.verdict.is_block);
        }
    }

    #[test]
    fn single_venue_triple_print_is_sweep() {
        let mut agg = aggregator();
        agg.process_at(trade(AMD, 6.00, 50, 303, 1), 0);
        agg.process_at(trade(AMD, 6.02, 50, 303, 2), 100);
        let out = agg.process_at(trade(AMD, 6.05, 50, 303, 3), 200);
        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .all(|e| e.verdict.trade_type == TradeType::Sweep));
        assert_eq!(out[0].verdict.sweep_exchange_count, 1);
    }

    #[test]
    fn wide_price_band_rejects_sweep() {
        let mut agg = aggregator();
        agg.process_at(trade(AMD, 5.50, 60, 65, 1), 0);
        let out = agg.process_at(trade(AMD, 5.75, 60, 66, 2), 100);
        assert!(out.is_empty(), "price band 0.25 must not admit");
    }

    #[test]
    fn cheap_contracts_use_halved_size_floor() {
        let mut agg = aggregator();
        // Mean price 2.00 <= 5.00, so the floor halves to 50.
        agg.process_at(trade(AMD, 2.00, 30, 65, 1), 0);
        let out = agg.process_at(trade(AMD, 2.00, 30, 66, 2), 100);
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|e| e.verdict.trade_type == TradeType::Sweep));
    }

    #[test]
    fn sweep_id_is_idempotent_within_bucket() {
        let mut agg = aggregator();
        let a = agg.process_at(
            trade_with_conditions(AMD, 5.50, 60, 65, 1, vec![233]),
            40,
        );
        let b = agg.process_at(
            trade_with_conditions(AMD, 5.50, 60, 66, 2, vec![233]),
            90,
        );
        assert_eq!(a[0].verdict.sweep_id, b[0].verdict.sweep_id);
    }

    #[test]
    fn sweep_id_is_pure_function_of_symbol_and_bucket() {
        assert_eq!(sweep_id(AMD, 40), sweep_id(AMD, 90));
        assert_ne!(sweep_id(AMD, 40), sweep_id(AMD, 140));
        assert_ne!(sweep_id(AMD, 40), sweep_id(NVDA, 40));
    }

    #[test]
    fn window_is_bounded_by_size_and_age() {
        let cfg = AggregatorConfig {
            buffer_max_size: 100,
            ..AggregatorConfig::default()
        };
        let mut agg = TradeAggregator::new(cfg);
        for i in 0..500u64 {
            let symbol = format!("O:T{:03}X251219C00100000", i % 7);
            // Distinct symbols per print; nothing clusters.
            let _ = agg.process_at(trade(&symbol, 1.0, 1, 303, i), i as i64 * 10);
            assert!(agg.len() <= 100);
        }

        // Age eviction clears everything older than the max age.
        let out = agg.process_at(trade(AMD, 1.0, 1, 303, 1_000), 60_000);
        assert!(out.len() >= 1);
        assert!(agg.len() <= 1 + 1);
    }

    #[test]
    fn capacity_eviction_still_emits_buffered_prints() {
        let cfg = AggregatorConfig {
            buffer_max_size: 2,
            ..AggregatorConfig::default()
        };
        let mut agg = TradeAggregator::new(cfg);
        agg.process_at(trade(AMD, 1.0, 1, 303, 1), 0);
        agg.process_at(trade(NVDA, 1.0, 1, 303, 2), 1);
        let out = agg.process_at(trade(SPY, 1.0, 1, 303, 3), 2);
        // AMD was forced out and must have emitted exactly once.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].trade.sequence, 1);
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn arrival_flushes_older_expired_print_first() {
        let mut agg = aggregator();
        agg.process_at(trade(AMD, 5.50, 40, 65, 1), 0);

        // The next arrival lands after print 1's hold lapsed but before any
        // poll tick; print 1 must still publish first, as flow.
        let out = agg.process_at(trade(AMD, 5.50, 200, 66, 2), 800);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].trade.sequence, 1);
        assert_eq!(out[0].verdict.trade_type, TradeType::Flow);
    }

    #[test]
    fn emitted_prints_never_reclassify() {
        let mut agg = aggregator();
        agg.process_at(trade(AMD, 5.50, 40, 65, 1), 0);
        // The first print times out and emits as flow...
        let flow = agg.poll_at(800);
        assert_eq!(flow.len(), 1);
        assert_eq!(flow[0].verdict.trade_type, TradeType::Flow);

        // ...then a late burst admits a sweep; the flow print stays emitted.
        agg.process_at(trade(AMD, 5.50, 60, 66, 2), 900);
        let out = agg.process_at(trade(AMD, 5.50, 60, 302, 3), 950);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| e.trade.sequence != 1));
    }

    #[test]
    fn flush_drains_everything_exactly_once() {
        let mut agg = aggregator();
        agg.process_at(trade(AMD, 5.50, 40, 65, 1), 0);
        agg.process_at(trade(NVDA, 3.00, 20, 303, 2), 10);
        let out = agg.flush();
        assert_eq!(out.len(), 2);
        assert!(agg.is_empty());
        assert!(agg.flush().is_empty());
    }
}
