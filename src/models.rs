use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Option side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionSide {
    Call,
    Put,
}

impl OptionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionSide::Call => "CALL",
            OptionSide::Put => "PUT",
        }
    }
}

/// Trade classification produced by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeType {
    Sweep,
    Block,
    Flow,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Sweep => "SWEEP",
            TradeType::Block => "BLOCK",
            TradeType::Flow => "FLOW",
        }
    }
}

/// Where a print executed relative to the NBBO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionLevel {
    AboveAsk,
    AtAsk,
    Mid,
    AtBid,
    BelowBid,
    Unknown,
}

impl ExecutionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionLevel::AboveAsk => "ABOVE_ASK",
            ExecutionLevel::AtAsk => "AT_ASK",
            ExecutionLevel::Mid => "MID",
            ExecutionLevel::AtBid => "AT_BID",
            ExecutionLevel::BelowBid => "BELOW_BID",
            ExecutionLevel::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl FlowDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDirection::Bullish => "BULLISH",
            FlowDirection::Bearish => "BEARISH",
            FlowDirection::Neutral => "NEUTRAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrgencyLevel {
    Low,
    Moderate,
    High,
    Extreme,
}

impl UrgencyLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => UrgencyLevel::Extreme,
            60..=79 => UrgencyLevel::High,
            40..=59 => UrgencyLevel::Moderate,
            _ => UrgencyLevel::Low,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UrgencyLevel::Extreme => "Extreme",
            UrgencyLevel::High => "High",
            UrgencyLevel::Moderate => "Moderate",
            UrgencyLevel::Low => "Low",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            UrgencyLevel::Extreme => "#dc2626",
            UrgencyLevel::High => "#ea580c",
            UrgencyLevel::Moderate => "#d97706",
            UrgencyLevel::Low => "#6b7280",
        }
    }
}

/// Urgency payload attached to every classified trade
#[derive(Debug, Clone, Serialize)]
pub struct Urgency {
    pub score: u8,
    pub level: UrgencyLevel,
    pub label: &'static str,
    pub color: &'static str,
}

impl Urgency {
    pub fn from_score(score: u8) -> Self {
        let level = UrgencyLevel::from_score(score);
        Self {
            score,
            level,
            label: level.label(),
            color: level.color(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    LargeIsolated,
    OpraBlockCode,
    DarkVenue,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::LargeIsolated => "LARGE_ISOLATED",
            BlockReason::OpraBlockCode => "OPRA_BLOCK_CODE",
            BlockReason::DarkVenue => "DARK_VENUE",
        }
    }
}

/// A raw trade print as received from the upstream feed.
/// `executed_at_ms` is already converted from the vendor's nanosecond stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTrade {
    pub symbol: String,
    pub price: f64,
    pub size: u32,
    pub exchange_id: i32,
    pub conditions: Vec<i32>,
    pub executed_at_ms: i64,
    pub sequence: u64,
}

/// Latest known NBBO for a contract
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub bid_size: u32,
    pub ask_size: u32,
    pub quoted_at_ms: i64,
}

impl Quote {
    /// A quote is usable for execution-level placement only when both sides
    /// are positive and not crossed.
    pub fn is_valid(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.ask >= self.bid
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Fully classified trade, published once to the sink and once to the hub.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedTrade {
    pub contract_symbol: String,
    pub underlying: String,
    pub expiry: chrono::NaiveDate,
    pub side: OptionSide,
    pub strike: f64,
    pub dte: i64,

    pub price: f64,
    pub size: u32,
    pub premium: f64,
    pub exchange_id: i32,
    pub exchange_name: &'static str,
    pub conditions: Vec<i32>,
    pub executed_at_ms: i64,
    pub sequence: u64,

    pub trade_type: TradeType,
    pub execution_level: ExecutionLevel,
    pub priority: u8,
    pub highlight: bool,
    pub urgency: Urgency,
    pub flow_direction: FlowDirection,

    pub sweep_id: Option<u64>,
    pub sweep_size: u32,
    pub sweep_exchange_count: u32,
    pub sweep_exchanges: Vec<&'static str>,
    pub is_block: bool,
    pub block_reason: Option<BlockReason>,
}

/// Sentinel for venues missing from the OPRA participant table
pub const UNKNOWN_EXCHANGE: &str = "UNKNOWN";

/// OPRA participant / venue names keyed by the vendor's exchange id.
/// Unknown ids fall through to the sentinel so classification never fails.
pub fn exchange_name(id: i32) -> &'static str {
    match id {
        1 => "NYSE American",
        2 => "Nasdaq BX",
        3 => "NYSE National",
        4 => "FINRA ADF",
        21 => "FINRA TRF",
        60 => "ISE Mercury",
        65 => "MIAX Pearl",
        66 => "MIAX Sapphire",
        300 => "OPRA",
        301 => "NYSE American Options",
        302 => "BOX Options",
        303 => "Cboe Options",
        304 => "MIAX Emerald",
        305 => "Cboe EDGX Options",
        307 => "Cboe C2",
        308 => "Nasdaq GEMX",
        309 => "Nasdaq ISE",
        312 => "MIAX Options",
        313 => "Nasdaq MRX",
        316 => "Nasdaq Options Market",
        322 => "Nasdaq BX Options",
        323 => "MEMX Options",
        _ => UNKNOWN_EXCHANGE,
    }
}

/// Application configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub upstream_url: String,
    pub database_path: String,
    pub port: u16,
    pub frontend_origin: String,
    pub rollover_timezone: chrono_tz::Tz,
    pub static_tier_tickers: Vec<String>,

    pub sessions_total: usize,
    pub sessions_static: usize,
    pub quotes_per_session: usize,
    pub rebalance_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,

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

    pub store_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            upstream_url: "wss://socket.polygon.io/options".to_string(),
            database_path: "./flowsentry.db".to_string(),
            port: 8080,
            frontend_origin: "http://localhost:3000".to_string(),
            rollover_timezone: chrono_tz::America::New_York,
            static_tier_tickers: [
                "SPY", "QQQ", "IWM", "AAPL", "NVDA", "TSLA", "AMD", "MSFT", "META", "AMZN",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),

            sessions_total: 10,
            sessions_static: 3,
            quotes_per_session: 1000,
            rebalance_interval_ms: 5 * 60 * 1000,
            max_reconnect_attempts: 10,
            reconnect_interval_ms: 5_000,

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

            store_threshold: 25_000.0,
        }
    }
}

impl Config {
    /// Load from environment with defaults. The API key is the only hard
    /// requirement; everything else falls back.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        config.api_key = std::env::var("API_KEY")
            .context("API_KEY is required (upstream feed auth token)")?;

        if let Ok(v) = std::env::var("UPSTREAM_URL") {
            config.upstream_url = v;
        }
        if let Ok(v) = std::env::var("STORE_URL").or_else(|_| std::env::var("DATABASE_PATH")) {
            config.database_path = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            config.port = v.parse().unwrap_or(config.port);
        }
        if let Ok(v) = std::env::var("FRONTEND_ORIGIN") {
            config.frontend_origin = v;
        }
        if let Ok(v) = std::env::var("ROLLOVER_TIMEZONE") {
            config.rollover_timezone = v
                .parse()
                .with_context(|| format!("ROLLOVER_TIMEZONE is not an IANA zone: {v}"))?;
        }
        if let Ok(v) = std::env::var("STATIC_TIER_TICKERS") {
            config.static_tier_tickers = parse_string_list(&v);
        }

        if let Ok(v) = std::env::var("SESSIONS_TOTAL") {
            config.sessions_total = v.parse().unwrap_or(config.sessions_total);
        }
        if let Ok(v) = std::env::var("SESSIONS_STATIC") {
            config.sessions_static = v.parse().unwrap_or(config.sessions_static);
        }
        if let Ok(v) = std::env::var("QUOTES_PER_SESSION") {
            config.quotes_per_session = v.parse().unwrap_or(config.quotes_per_session);
        }
        if let Ok(v) = std::env::var("REBALANCE_INTERVAL_MS") {
            config.rebalance_interval_ms = v.parse().unwrap_or(config.rebalance_interval_ms);
        }
        if let Ok(v) = std::env::var("MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v.parse().unwrap_or(config.max_reconnect_attempts);
        }
        if let Ok(v) = std::env::var("RECONNECT_INTERVAL_MS") {
            config.reconnect_interval_ms = v.parse().unwrap_or(config.reconnect_interval_ms);
        }

        if let Ok(v) = std::env::var("BUFFER_MAX_SIZE") {
            config.buffer_max_size = v.parse().unwrap_or(config.buffer_max_size);
        }
        if let Ok(v) = std::env::var("BUFFER_MAX_AGE_MS") {
            config.buffer_max_age_ms = v.parse().unwrap_or(config.buffer_max_age_ms);
        }
        if let Ok(v) = std::env::var("SWEEP_WINDOW_MS") {
            config.sweep_window_ms = v.parse().unwrap_or(config.sweep_window_ms);
        }
        if let Ok(v) = std::env::var("SWEEP_PRICE_DELTA") {
            config.sweep_price_delta = v.parse().unwrap_or(config.sweep_price_delta);
        }
        if let Ok(v) = std::env::var("SWEEP_MIN_TOTAL") {
            config.sweep_min_total = v.parse().unwrap_or(config.sweep_min_total);
        }
        if let Ok(v) = std::env::var("SWEEP_MIN_EXCHANGES") {
            config.sweep_min_exchanges = v.parse().unwrap_or(config.sweep_min_exchanges);
        }
        if let Ok(v) = std::env::var("BLOCK_MIN_SIZE") {
            config.block_min_size = v.parse().unwrap_or(config.block_min_size);
        }
        if let Ok(v) = std::env::var("BLOCK_ISOLATION_MS") {
            config.block_isolation_ms = v.parse().unwrap_or(config.block_isolation_ms);
        }
        if let Ok(v) = std::env::var("BLOCK_CONDITIONS") {
            config.block_conditions = parse_int_list(&v).unwrap_or(config.block_conditions);
        }
        if let Ok(v) = std::env::var("DARK_VENUES") {
            config.dark_venues = parse_int_list(&v).unwrap_or(config.dark_venues);
        }

        if let Ok(v) = std::env::var("STORE_THRESHOLD") {
            config.store_threshold = v.parse().unwrap_or(config.store_threshold);
        }

        if config.sessions_static > config.sessions_total {
            anyhow::bail!(
                "SESSIONS_STATIC ({}) exceeds SESSIONS_TOTAL ({})",
                config.sessions_static,
                config.sessions_total
            );
        }

        Ok(config)
    }

    /// Aggregate quote-channel budget across every session
    pub fn quote_budget(&self) -> usize {
        self.sessions_total * self.quotes_per_session
    }
}

/// Accepts a JSON array of strings or a plain comma-separated list.
fn parse_string_list(raw: &str) -> Vec<String> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
        return list
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_int_list(raw: &str) -> Option<Vec<i32>> {
    if let Ok(list) = serde_json::from_str::<Vec<i32>>(raw) {
        return Some(list);
    }
    raw.split(',')
        .map(|s| s.trim().parse::<i32>().ok())
        .collect()
}
