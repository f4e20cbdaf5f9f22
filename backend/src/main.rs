mod analyzer;
mod broadcast;
mod broker;
mod config;
mod crypto;
mod error;
mod geo;
mod models;
mod orchestrator;
mod origin_fetch;
mod persistence;
mod processors;
mod registry;
mod state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{http::HeaderValue, Json, Router};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use analyzer::RiskAnalyzer;
use broadcast::BroadcastHub;
use broker::{BrokerClient, IncomingFrame};
use config::Settings;
use orchestrator::Orchestrator;
use persistence::PersistenceGateway;
use registry::TopicRegistry;

#[derive(Clone)]
struct AppState {
    broadcast: Arc<BroadcastHub>,
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn observe(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer(socket, state.broadcast))
}

/// One connected observer: forwards broadcast-hub events out over the socket
/// until either the hub's channel closes or the socket itself errors, at
/// which point the observer is dropped from the hub's active set.
async fn handle_observer(mut socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (id, mut rx) = hub.connect();
    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(payload) => {
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {} // observers are read-only; inbound frames are ignored
                }
            }
        }
    }
    hub.disconnect(id);
}

/// Routes each incoming frame to a per-topic worker task, lazily spawned on
/// first sight of a topic. Frames for one topic (one device) are processed
/// strictly in broker-receive order by that topic's worker; distinct topics
/// run concurrently with no ordering relative to each other, per the
/// ordering guarantee in §5.
async fn dispatch_frames(orchestrator: Arc<Orchestrator>, mut incoming: mpsc::UnboundedReceiver<IncomingFrame>) {
    let mut workers: HashMap<String, mpsc::UnboundedSender<IncomingFrame>> = HashMap::new();
    while let Some(frame) = incoming.recv().await {
        let topic = frame.topic.clone();
        let needs_spawn = match workers.get(&topic) {
            Some(tx) => tx.send(frame).is_err(),
            None => true,
        };
        if needs_spawn {
            let (tx, mut rx) = mpsc::unbounded_channel::<IncomingFrame>();
            let frame = match tx.send(frame) {
                Ok(()) => None,
                Err(err) => Some(err.0),
            };
            debug_assert!(frame.is_none(), "send on a fresh channel cannot fail");
            let worker_orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    worker_orchestrator.handle_frame(&frame.topic, &frame.payload).await;
                }
            });
            workers.insert(topic, tx);
        }
    }
}

fn build_cors() -> CorsLayer {
    let origins_env =
        std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string());

    if origins_env.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = origins_env
            .split(',')
            .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "landslide_backend=info,rumqttc=warn".into()),
        )
        .init();

    let settings = Arc::new(Settings::from_env());
    info!(version = env!("CARGO_PKG_VERSION"), "landslide telemetry backbone starting");

    let persistence = match PersistenceGateway::connect(
        &settings.auth_db_url,
        &settings.config_db_url,
        &settings.data_db_url,
    )
    .await
    {
        Ok(gateway) => Arc::new(gateway),
        Err(err) => {
            tracing::error!(error = %err, "failed to open persistence stores, aborting startup");
            std::process::exit(1);
        }
    };

    let (broker, incoming) = BrokerClient::connect(
        "landslide-backend",
        &settings.broker_host,
        settings.broker_port,
        settings.broker_user.as_deref(),
        settings.broker_password.as_deref(),
    );

    let registry = Arc::new(TopicRegistry::new(
        persistence.clone(),
        broker.clone(),
        settings.topic_reload_interval,
    ));

    let broadcast = Arc::new(BroadcastHub::new());
    let analyzer = Arc::new(RiskAnalyzer::new());
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        analyzer,
        persistence.clone(),
        broadcast.clone(),
        settings.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(registry.clone().run(shutdown_rx.clone()));

    tokio::spawn(dispatch_frames(orchestrator.clone(), incoming));

    let cors = build_cors();
    let app_state = AppState { broadcast: broadcast.clone() };
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/observe", get(observe))
        .with_state(app_state)
        .layer(cors);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "listening");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, addr = %addr, "failed to bind listener, aborting startup");
            std::process::exit(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);
        broker.shutdown().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    if let Err(err) = server.await {
        warn!(error = %err, "server exited with error");
    }
}
