//! FlowSentry - Real-time options flow ingestion and classification
//!
//! Supervisor wiring: configuration, the SQLite trade store, the quote
//! cache, the aggregator/classifier pipeline inside the ingestion farm, the
//! volume-driven rebalancer, the daily purge, and the live flow push
//! channel. Shutdown drains in-flight trades before the process exits.

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowsentry_backend::{
    hub::FlowHub,
    ingest::{
        rebalance::{run_rebalancer, RebalanceConfig, VolumeTable},
        FarmStatsSnapshot, IngestFarm, SubscriptionTable,
    },
    models::{ClassifiedTrade, Config},
    quotes::QuoteCache,
    storage::{run_purge_schedule, run_sink, TradeStore},
};

/// Classifier-to-sink queue depth; when full, ingestion back-pressures.
const SINK_QUEUE: usize = 1_024;

/// Application state shared by the HTTP/WS handlers
#[derive(Clone)]
struct AppState {
    hub: Arc<FlowHub>,
    store: Arc<TradeStore>,
    farm_stats: Arc<flowsentry_backend::ingest::FarmStats>,
    subscriptions: Arc<SubscriptionTable>,
    quotes: Arc<QuoteCache>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("configuration error")?;
    info!(
        sessions = config.sessions_total,
        quote_budget = config.quote_budget(),
        store_threshold = config.store_threshold,
        "flowsentry starting"
    );

    let store = Arc::new(
        TradeStore::new(
            &config.database_path,
            config.store_threshold,
            config.rollover_timezone,
        )
        .context("trade store unreachable at boot")?,
    );

    let quotes = Arc::new(QuoteCache::new());
    let volume = Arc::new(VolumeTable::new());
    let subscriptions = Arc::new(SubscriptionTable::new(config.sessions_total));
    let hub = Arc::new(FlowHub::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Persistence sink behind the bounded classifier queue.
    let (sink_tx, sink_rx) = mpsc::channel::<Arc<ClassifiedTrade>>(SINK_QUEUE);
    let sink_handle = tokio::spawn(run_sink(sink_rx, store.clone()));

    // The farm opens every session and holds the startup barrier; auth
    // rejection or an unreachable upstream at boot is fatal.
    let farm = IngestFarm::start(
        &config,
        quotes.clone(),
        volume.clone(),
        subscriptions.clone(),
        hub.clone(),
        sink_tx,
        shutdown_rx.clone(),
    )
    .await
    .context("ingestion farm failed to start")?;

    tokio::spawn(run_rebalancer(
        config.rebalance_interval_ms,
        volume.clone(),
        subscriptions.clone(),
        RebalanceConfig::from_config(&config),
        farm.command_txs.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(run_purge_schedule(
        store.clone(),
        config.rollover_timezone,
        shutdown_rx.clone(),
    ));

    // Minute heartbeat with the farm counters.
    {
        let stats = farm.stats.clone();
        let hub = hub.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                let snap = stats.snapshot();
                info!(
                    connected = snap.connected,
                    sessions = snap.sessions_authenticated,
                    trades = snap.raw_trades,
                    quotes = snap.quotes,
                    classified = snap.classified,
                    dedup_dropped = snap.dedup_dropped,
                    parse_errors = snap.parse_errors,
                    subscribers = hub.subscriber_count(),
                    hub_dropped = hub.dropped_count(),
                    "farm heartbeat"
                );
            }
        });
    }

    let app_state = AppState {
        hub: hub.clone(),
        store: store.clone(),
        farm_stats: farm.stats.clone(),
        subscriptions: subscriptions.clone(),
        quotes: quotes.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .frontend_origin
                .parse::<axum::http::HeaderValue>()
                .context("FRONTEND_ORIGIN is not a valid origin")?,
        )
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws/flow", get(flow_ws_handler))
        .layer(cors)
        .with_state(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "server listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; draining");

    // Stop intake first, then let the pipeline drain front to back: sessions
    // close, the dispatcher and workers flush their buffers, the sink queue
    // empties, pending inserts complete.
    let _ = shutdown_tx.send(true);
    farm.join().await;
    let _ = sink_handle.await;
    let _ = server_handle.await;

    info!(stored_trades = store.len(), "shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    farm: FarmStatsSnapshot,
    subscriptions: usize,
    quote_cache_entries: usize,
    flow_subscribers: usize,
    flow_dropped: u64,
    stored_trades: usize,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let farm = state.farm_stats.snapshot();
    Json(HealthResponse {
        status: if farm.connected { "ok" } else { "degraded" },
        farm,
        subscriptions: state.subscriptions.total(),
        quote_cache_entries: state.quotes.len(),
        flow_subscribers: state.hub.subscriber_count(),
        flow_dropped: state.hub.dropped_count(),
        stored_trades: state.store.len(),
    })
}

/// Envelope pushed to `/ws/flow` subscribers
#[derive(Debug, Serialize)]
struct FlowEvent<'a> {
    channel: &'static str,
    data: &'a ClassifiedTrade,
}

async fn flow_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_flow_socket(socket, state))
}

async fn handle_flow_socket(mut socket: WebSocket, state: AppState) {
    let (id, mut rx) = state.hub.subscribe();
    info!(connection = %id, "flow subscriber connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(trade) = event else { break };
                let payload = serde_json::to_string(&FlowEvent {
                    channel: "flow:all",
                    data: &trade,
                })
                .unwrap_or_else(|_| "{}".to_string());
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping" {
                            let _ = socket.send(Message::Text("pong".to_string())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.hub.unsubscribe(&id);
    info!(connection = %id, "flow subscriber disconnected");
}
