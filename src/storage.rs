//! SQLite persistence for classified trades and daily aggregates.
//!
//! WAL mode for concurrent reads during writes, one connection behind a
//! `parking_lot::Mutex` with our own locking (NO_MUTEX open flag). Inserts
//! are idempotent on `(contract_symbol, sequence)`; daily aggregates are
//! maintained by atomic increments in the same transaction and their ratios
//! are computed on read, never stored.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::models::{ClassifiedTrade, OptionSide, TradeType};

/// Local-time hour of the daily rollover purge
const ROLLOVER_HOUR: u32 = 3;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contract_symbol TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    underlying TEXT NOT NULL,
    expiry TEXT NOT NULL,
    side TEXT NOT NULL,
    strike REAL NOT NULL,
    dte INTEGER NOT NULL,
    price REAL NOT NULL,
    size INTEGER NOT NULL,
    premium REAL NOT NULL,
    exchange_id INTEGER NOT NULL,
    exchange_name TEXT NOT NULL,
    conditions TEXT NOT NULL,
    executed_at_ms INTEGER NOT NULL,
    trade_type TEXT NOT NULL,
    execution_level TEXT NOT NULL,
    priority INTEGER NOT NULL,
    highlight INTEGER NOT NULL,
    urgency_score INTEGER NOT NULL,
    urgency_level TEXT NOT NULL,
    flow_direction TEXT NOT NULL,
    sweep_id TEXT,
    sweep_size INTEGER NOT NULL DEFAULT 0,
    sweep_exchange_count INTEGER NOT NULL DEFAULT 0,
    sweep_exchanges TEXT NOT NULL DEFAULT '[]',
    is_block INTEGER NOT NULL DEFAULT 0,
    block_reason TEXT,
    UNIQUE(contract_symbol, sequence)
);

CREATE INDEX IF NOT EXISTS idx_trades_executed_at
    ON trades(executed_at_ms DESC);
CREATE INDEX IF NOT EXISTS idx_trades_underlying
    ON trades(underlying, executed_at_ms DESC);
CREATE INDEX IF NOT EXISTS idx_trades_priority
    ON trades(priority, executed_at_ms DESC);

CREATE TABLE IF NOT EXISTS daily_aggregates (
    date TEXT PRIMARY KEY,
    total_trades INTEGER NOT NULL DEFAULT 0,
    total_premium REAL NOT NULL DEFAULT 0,
    call_count INTEGER NOT NULL DEFAULT 0,
    call_premium REAL NOT NULL DEFAULT 0,
    put_count INTEGER NOT NULL DEFAULT 0,
    put_premium REAL NOT NULL DEFAULT 0,
    sweep_count INTEGER NOT NULL DEFAULT 0,
    sweep_premium REAL NOT NULL DEFAULT 0,
    block_count INTEGER NOT NULL DEFAULT 0,
    block_premium REAL NOT NULL DEFAULT 0,
    flow_count INTEGER NOT NULL DEFAULT 0,
    flow_premium REAL NOT NULL DEFAULT 0,
    priority1_count INTEGER NOT NULL DEFAULT 0,
    priority1_premium REAL NOT NULL DEFAULT 0,
    priority2_count INTEGER NOT NULL DEFAULT 0,
    priority2_premium REAL NOT NULL DEFAULT 0,
    priority3_count INTEGER NOT NULL DEFAULT 0,
    priority3_premium REAL NOT NULL DEFAULT 0,
    priority4_count INTEGER NOT NULL DEFAULT 0,
    priority4_premium REAL NOT NULL DEFAULT 0
) WITHOUT ROWID;
"#;

/// One aggregate row plus the ratios derived on read
#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub total_trades: i64,
    pub total_premium: f64,
    pub call_count: i64,
    pub call_premium: f64,
    pub put_count: i64,
    pub put_premium: f64,
    pub sweep_count: i64,
    pub sweep_premium: f64,
    pub block_count: i64,
    pub block_premium: f64,
    pub flow_count: i64,
    pub flow_premium: f64,
    pub priority_counts: [i64; 4],
    pub priority_premiums: [f64; 4],
    /// call premium over put premium; absent while puts are zero
    pub call_put_ratio: Option<f64>,
    /// sweep+block premium share of total; absent while the day is empty
    pub institutional_share: Option<f64>,
}

pub struct TradeStore {
    conn: Arc<Mutex<Connection>>,
    store_threshold: f64,
    rollover_tz: Tz,
}

impl TradeStore {
    pub fn new(db_path: &str, store_threshold: f64, rollover_tz: Tz) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open trade store at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize trade store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, existing_trades = count, "trade store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            store_threshold,
            rollover_tz,
        })
    }

    /// Store one classified trade when it clears the premium threshold.
    /// Idempotent on `(contract_symbol, sequence)`; the matching daily
    /// aggregate increments ride the same transaction so a replayed print
    /// can never double-count.
    pub fn insert(&self, trade: &ClassifiedTrade) -> Result<bool> {
        if trade.premium < self.store_threshold {
            return Ok(false);
        }

        let conditions = serde_json::to_string(&trade.conditions).unwrap_or_else(|_| "[]".into());
        let sweep_exchanges =
            serde_json::to_string(&trade.sweep_exchanges).unwrap_or_else(|_| "[]".into());
        let date = self.date_of(trade.executed_at_ms);

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("begin insert transaction")?;

        let inserted = tx
            .execute(
                r#"INSERT INTO trades (
                    contract_symbol, sequence, underlying, expiry, side, strike, dte,
                    price, size, premium, exchange_id, exchange_name, conditions,
                    executed_at_ms, trade_type, execution_level, priority, highlight,
                    urgency_score, urgency_level, flow_direction,
                    sweep_id, sweep_size, sweep_exchange_count, sweep_exchanges,
                    is_block, block_reason
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18,
                    ?19, ?20, ?21,
                    ?22, ?23, ?24, ?25,
                    ?26, ?27
                )
                ON CONFLICT(contract_symbol, sequence) DO NOTHING"#,
                params![
                    trade.contract_symbol,
                    trade.sequence as i64,
                    trade.underlying,
                    trade.expiry.format("%Y-%m-%d").to_string(),
                    trade.side.as_str(),
                    trade.strike,
                    trade.dte,
                    trade.price,
                    trade.size,
                    trade.premium,
                    trade.exchange_id,
                    trade.exchange_name,
                    conditions,
                    trade.executed_at_ms,
                    trade.trade_type.as_str(),
                    trade.execution_level.as_str(),
                    trade.priority,
                    trade.highlight,
                    trade.urgency.score,
                    trade.urgency.level.label(),
                    trade.flow_direction.as_str(),
                    trade.sweep_id.map(|id| id.to_string()),
                    trade.sweep_size,
                    trade.sweep_exchange_count,
                    sweep_exchanges,
                    trade.is_block,
                    trade.block_reason.map(|r| r.as_str()),
                ],
            )
            .context("insert trade")?;

        if inserted == 0 {
            tx.commit().context("commit duplicate insert")?;
            return Ok(false);
        }

        let (call_count, call_premium, put_count, put_premium) = match trade.side {
            OptionSide::Call => (1i64, trade.premium, 0i64, 0.0),
            OptionSide::Put => (0, 0.0, 1, trade.premium),
        };
        let (sweep_count, sweep_premium, block_count, block_premium, flow_count, flow_premium) =
            match trade.trade_type {
                TradeType::Sweep => (1i64, trade.premium, 0i64, 0.0, 0i64, 0.0),
                TradeType::Block => (0, 0.0, 1, trade.premium, 0, 0.0),
                TradeType::Flow => (0, 0.0, 0, 0.0, 1, trade.premium),
            };
        let mut priority_counts = [0i64; 4];
        let mut priority_premiums = [0.0f64; 4];
        let bucket = (trade.priority.clamp(1, 4) - 1) as usize;
        priority_counts[bucket] = 1;
        priority_premiums[bucket] = trade.premium;

        tx.execute(
            r#"INSERT INTO daily_aggregates (
                date, total_trades, total_premium,
                call_count, call_premium, put_count, put_premium,
                sweep_count, sweep_premium, block_count, block_premium,
                flow_count, flow_premium,
                priority1_count, priority1_premium,
                priority2_count, priority2_premium,
                priority3_count, priority3_premium,
                priority4_count, priority4_premium
            ) VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                      ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(date) DO UPDATE SET
                total_trades = total_trades + 1,
                total_premium = total_premium + excluded.total_premium,
                call_count = call_count + excluded.call_count,
                call_premium = call_premium + excluded.call_premium,
                put_count = put_count + excluded.put_count,
                put_premium = put_premium + excluded.put_premium,
                sweep_count = sweep_count + excluded.sweep_count,
                sweep_premium = sweep_premium + excluded.sweep_premium,
                block_count = block_count + excluded.block_count,
                block_premium = block_premium + excluded.block_premium,
                flow_count = flow_count + excluded.flow_count,
                flow_premium = flow_premium + excluded.flow_premium,
                priority1_count = priority1_count + excluded.priority1_count,
                priority1_premium = priority1_premium + excluded.priority1_premium,
                priority2_count = priority2_count + excluded.priority2_count,
                priority2_premium = priority2_premium + excluded.priority2_premium,
                priority3_count = priority3_count + excluded.priority3_count,
                priority3_premium = priority3_premium + excluded.priority3_premium,
                priority4_count = priority4_count + excluded.priority4_count,
                priority4_premium = priority4_premium + excluded.priority4_premium"#,
            params![
                date,
                trade.premium,
                call_count,
                call_premium,
                put_count,
                put_premium,
                sweep_count,
                sweep_premium,
                block_count,
                block_premium,
                flow_count,
                flow_premium,
                priority_counts[0],
                priority_premiums[0],
                priority_counts[1],
                priority_premiums[1],
                priority_counts[2],
                priority_premiums[2],
                priority_counts[3],
                priority_premiums[3],
            ],
        )
        .context("upsert daily aggregate")?;

        tx.commit().context("commit trade insert")?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate row for a `%Y-%m-%d` date; ratios derived here, not stored.
    pub fn daily_stats(&self, date: &str) -> Result<Option<DailyStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                r#"SELECT total_trades, total_premium,
                      call_count, call_premium, put_count, put_premium,
                      sweep_count, sweep_premium, block_count, block_premium,
                      flow_count, flow_premium,
                      priority1_count, priority1_premium,
                      priority2_count, priority2_premium,
                      priority3_count, priority3_premium,
                      priority4_count, priority4_premium
                   FROM daily_aggregates WHERE date = ?1"#,
            )
            .context("prepare daily stats query")?;

        let row = stmt
            .query_row(params![date], |row| {
                Ok(DailyStats {
                    date: date.to_string(),
                    total_trades: row.get(0)?,
                    total_premium: row.get(1)?,
                    call_count: row.get(2)?,
                    call_premium: row.get(3)?,
                    put_count: row.get(4)?,
                    put_premium: row.get(5)?,
                    sweep_count: row.get(6)?,
                    sweep_premium: row.get(7)?,
                    block_count: row.get(8)?,
                    block_premium: row.get(9)?,
                    flow_count: row.get(10)?,
                    flow_premium: row.get(11)?,
                    priority_counts: [row.get(12)?, row.get(14)?, row.get(16)?, row.get(18)?],
                    priority_premiums: [row.get(13)?, row.get(15)?, row.get(17)?, row.get(19)?],
                    call_put_ratio: None,
                    institutional_share: None,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("read daily stats")?;

        Ok(row.map(|mut stats| {
            if stats.put_premium > 0.0 {
                stats.call_put_ratio = Some(stats.call_premium / stats.put_premium);
            }
            if stats.total_premium > 0.0 {
                stats.institutional_share =
                    Some((stats.sweep_premium + stats.block_premium) / stats.total_premium);
            }
            stats
        }))
    }

    /// Current date string in the rollover timezone
    pub fn current_date(&self) -> String {
        self.date_of(Utc::now().timestamp_millis())
    }

    fn date_of(&self, executed_at_ms: i64) -> String {
        Utc.timestamp_millis_opt(executed_at_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.rollover_tz)
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Delete trade rows from before the current local date and aggregate
    /// rows keyed to older dates. Returns (trades, aggregates) removed.
    pub fn purge_stale(&self) -> Result<(usize, usize)> {
        let today = self.current_date();
        let midnight_ms = self.local_midnight_ms()?;

        let conn = self.conn.lock();
        let trades = conn
            .execute(
                "DELETE FROM trades WHERE executed_at_ms < ?1",
                params![midnight_ms],
            )
            .context("purge stale trades")?;
        let aggregates = conn
            .execute(
                "DELETE FROM daily_aggregates WHERE date < ?1",
                params![today],
            )
            .context("purge stale aggregates")?;
        Ok((trades, aggregates))
    }

    fn local_midnight_ms(&self) -> Result<i64> {
        let local_now = Utc::now().with_timezone(&self.rollover_tz);
        let midnight = self
            .rollover_tz
            .with_ymd_and_hms(local_now.year(), local_now.month(), local_now.day(), 0, 0, 0)
            .earliest()
            .context("resolve local midnight")?;
        Ok(midnight.with_timezone(&Utc).timestamp_millis())
    }
}

/// Drain the classifier queue into the store. Insert failures are logged and
/// retried briefly; the queue keeps back-pressuring ingestion while we wait.
pub async fn run_sink(mut rx: mpsc::Receiver<Arc<ClassifiedTrade>>, store: Arc<TradeStore>) {
    while let Some(trade) = rx.recv().await {
        let mut attempts = 0u32;
        loop {
            match store.insert(&trade) {
                Ok(stored) => {
                    if stored {
                        debug!(
                            symbol = %trade.contract_symbol,
                            premium = trade.premium,
                            "trade stored"
                        );
                    }
                    break;
                }
                Err(e) if attempts < 3 => {
                    attempts += 1;
                    warn!(error = %e, attempts, "trade insert failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(100 * attempts as u64))
                        .await;
                }
                Err(e) => {
                    warn!(error = %e, symbol = %trade.contract_symbol, "trade insert dropped");
                    break;
                }
            }
        }
    }
    info!("persistence sink drained");
}

/// Sleep until the next local rollover (03:00 in the configured zone) and
/// purge, forever.
pub async fn run_purge_schedule(store: Arc<TradeStore>, tz: Tz, mut shutdown: watch::Receiver<bool>) {
    loop {
        let wait = match duration_until_rollover(tz) {
            Some(wait) => wait,
            None => {
                warn!("could not resolve next rollover; purge schedule idle for an hour");
                std::time::Duration::from_secs(3_600)
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => return,
        }

        match store.purge_stale() {
            Ok((trades, aggregates)) => {
                info!(trades, aggregates, "daily purge complete");
            }
            Err(e) => warn!(error = %e, "daily purge failed"),
        }
    }
}

fn duration_until_rollover(tz: Tz) -> Option<std::time::Duration> {
    let local_now = Utc::now().with_timezone(&tz);
    let today = tz
        .with_ymd_and_hms(
            local_now.year(),
            local_now.month(),
            local_now.day(),
            ROLLOVER_HOUR,
            0,
            0,
        )
        .earliest();

    let target = match today {
        Some(t) if t > local_now => t,
        _ => {
            let tomorrow = local_now.date_naive().succ_opt()?;
            tz.with_ymd_and_hms(
                tomorrow.year(),
                tomorrow.month(),
                tomorrow.day(),
                ROLLOVER_HOUR,
                0,
                0,
            )
            .earliest()?
        }
    };

    (target.with_timezone(&Utc) - Utc::now()).to_std().ok()
}
