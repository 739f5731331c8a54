//! Lossy broadcast hub for classified trades.
//!
//! Every classified trade is offered to every subscriber's bounded outbox
//! with a non-blocking send; a full outbox drops the event for that
//! subscriber only. The producer never waits, so a stalled client can never
//! back up ingestion. Subscribers are opaque connection ids and the hub
//! keeps no application state for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::ClassifiedTrade;

/// Per-subscriber outbox depth
const DEFAULT_OUTBOX_CAPACITY: usize = 256;

pub struct FlowHub {
    subscribers: RwLock<HashMap<Uuid, mpsc::Sender<Arc<ClassifiedTrade>>>>,
    outbox_capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl FlowHub {
    pub fn new() -> Self {
        Self::with_outbox_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_outbox_capacity(outbox_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            outbox_capacity: outbox_capacity.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber; returns its connection id and outbox.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<Arc<ClassifiedTrade>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        self.subscribers.write().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        self.subscribers.write().remove(id);
    }

    /// At-most-once, non-blocking delivery to every live subscriber.
    pub fn publish(&self, trade: &Arc<ClassifiedTrade>) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut gone: Vec<Uuid> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(trade.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        gone.push(*id);
                    }
                }
            }
        }
        if !gone.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in gone {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FlowHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ExecutionLevel, FlowDirection, OptionSide, TradeType, Urgency,
    };

    fn classified(sequence: u64) -> Arc<ClassifiedTrade> {
        Arc::new(ClassifiedTrade {
            contract_symbol: "O:AMD251219C00155000".to_string(),
            underlying: "AMD".to_string(),
            expiry: chrono::NaiveDate::from_ymd_opt(2025, 12, 19).unwrap(),
            side: OptionSide::Call,
            strike: 155.0,
            dte: 30,
            price: 5.5,
            size: 40,
            premium: 22_000.0,
            exchange_id: 302,
            exchange_name: "BOX Options",
            conditions: vec![],
            executed_at_ms: 1_730_000_000_000,
            sequence,
            trade_type: TradeType::Flow,
            execution_level: ExecutionLevel::AtAsk,
            priority: 3,
            highlight: false,
            urgency: Urgency::from_score(10),
            flow_direction: FlowDirection::Neutral,
            sweep_id: None,
            sweep_size: 0,
            sweep_exchange_count: 0,
            sweep_exchanges: vec![],
            is_block: false,
            block_reason: None,
        })
    }

    #[tokio::test]
    async fn delivers_to_live_subscribers() {
        let hub = FlowHub::new();
        let (_id_a, mut rx_a) = hub.subscribe();
        let (_id_b, mut rx_b) = hub.subscribe();

        hub.publish(&classified(1));

        assert_eq!(rx_a.recv().await.unwrap().sequence, 1);
        assert_eq!(rx_b.recv().await.unwrap().sequence, 1);
        assert_eq!(hub.published_count(), 1);
        assert_eq!(hub.dropped_count(), 0);
    }

    #[tokio::test]
    async fn full_outbox_drops_per_event() {
        let hub = FlowHub::with_outbox_capacity(2);
        let (_slow_id, mut slow_rx) = hub.subscribe();

        for seq in 0..5 {
            hub.publish(&classified(seq));
        }

        // Only the first two events fit; the rest were dropped for this
        // subscriber without ever blocking the publisher.
        assert_eq!(hub.published_count(), 5);
        assert_eq!(hub.dropped_count(), 3);
        assert_eq!(slow_rx.recv().await.unwrap().sequence, 0);
        assert_eq!(slow_rx.recv().await.unwrap().sequence, 1);
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let hub = FlowHub::new();
        let (_id, rx) = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(rx);
        hub.publish(&classified(1));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_outbox() {
        let hub = FlowHub::new();
        let (id, mut rx) = hub.subscribe();
        hub.unsubscribe(&id);
        hub.publish(&classified(1));
        assert!(rx.recv().await.is_none());
    }
}
