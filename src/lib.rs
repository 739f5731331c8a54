//! FlowSentry Backend Library
//!
//! Real-time US options flow ingestion and classification: a multi-session
//! WebSocket farm feeds a sliding-window aggregator that labels every print
//! sweep, block, or flow; classified trades persist to SQLite and fan out to
//! live subscribers.

pub mod aggregator;
pub mod classifier;
pub mod contract;
pub mod hub;
pub mod ingest;
pub mod models;
pub mod quotes;
pub mod storage;

pub use models::{ClassifiedTrade, Config, RawTrade};
