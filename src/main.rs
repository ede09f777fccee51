//! Codoc Server - real-time collaborative text editing
//!
//! A collaboration server using:
//! - Operational transformation against a shared log of recent changes
//! - Sled embedded database for document snapshots
//! - Axum with WebSocket for client connections
//! - A pub/sub bus so a document's room can span several processes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

mod auth;
mod config;
mod storage;
mod sync;

use auth::{AccessPolicy, HttpAccessPolicy, JwtVerifier, StaticAccessPolicy};
use config::{OpLogBackend, ServerConfig};
use storage::{SledStore, StorageConfig};
use sync::{
    bus::LocalBus,
    coordinator::CoordinatorConfig,
    oplog::{MemoryOperationLog, OperationLog, WindowConfig},
    presence::PresenceManager,
    protocol::{CollabProtocol, ErrorCode, ServerMessage, PROTOCOL_VERSION},
    CollabServer, CollabServerConfig, DocumentCoordinator,
};

/// Shared application state
pub struct AppState {
    collab: Arc<CollabServer>,
    store: Arc<SledStore>,
    heartbeat_interval: Duration,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_documents: usize,
    active_connections: usize,
    active_sessions: usize,
    present_connections: usize,
    accepted_operations: u64,
    detected_conflicts: u64,
    stored_documents: usize,
    logged_changes: usize,
    storage_bytes: u64,
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.collab.stats();
    let storage = state.store.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: stats.uptime_seconds,
        active_documents: stats.active_documents,
        active_connections: stats.active_connections,
        active_sessions: stats.active_sessions,
        present_connections: stats.present_connections,
        accepted_operations: stats.accepted_operations,
        detected_conflicts: stats.detected_conflicts,
        stored_documents: storage.document_count,
        logged_changes: storage.change_count,
        storage_bytes: storage.total_size_bytes,
    })
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for everything addressed to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = state.collab.connect(tx.clone());
    info!("New WebSocket connection: {}", connection_id);

    // Replies follow the framing of the last client message
    let json_mode = Arc::new(AtomicBool::new(false));

    let send_json_mode = json_mode.clone();
    let send_connection = connection_id.clone();
    let heartbeat_interval = state.heartbeat_interval;

    // Task to forward messages from channel to WebSocket, with heartbeat pings
    let send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;

        loop {
            let frame = tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    match encode_reply(&msg, send_json_mode.load(Ordering::Relaxed)) {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
                _ = heartbeat.tick() => Message::Ping(Vec::new()),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        debug!("Send task ended for connection {}", send_connection);
    });

    let recv_state = state.clone();
    let recv_connection = connection_id.clone();

    // Task to handle incoming WebSocket messages
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let decoded = match msg {
                Message::Binary(data) => {
                    json_mode.store(false, Ordering::Relaxed);
                    CollabProtocol::decode_client(&data)
                }
                Message::Text(text) => {
                    json_mode.store(true, Ordering::Relaxed);
                    CollabProtocol::decode_client_json(&text)
                }
                Message::Ping(_) | Message::Pong(_) => {
                    recv_state.collab.touch(&recv_connection);
                    continue;
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", recv_connection);
                    break;
                }
            };

            let reply = match decoded {
                Ok(client_msg) => {
                    recv_state
                        .collab
                        .handle_message(&recv_connection, client_msg)
                        .await
                }
                Err(e) => {
                    warn!("Failed to decode message from {}: {}", recv_connection, e);
                    recv_state.collab.touch(&recv_connection);
                    Some(ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()))
                }
            };
            if let Some(reply) = reply {
                if tx.send(reply).is_err() {
                    break;
                }
            }
        }
        debug!("Receive task ended for connection {}", recv_connection);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.collab.disconnect(&connection_id).await;
    info!("Connection {} closed", connection_id);
}

fn encode_reply(msg: &ServerMessage, json: bool) -> Option<Message> {
    let encoded = if json {
        CollabProtocol::encode_server_json(msg).map(Message::Text)
    } else {
        CollabProtocol::encode_server(msg).map(|bytes| Message::Binary(bytes.to_vec()))
    };
    match encoded {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Failed to encode message: {}", e);
            None
        }
    }
}

fn build_server(config: &ServerConfig) -> anyhow::Result<(Arc<CollabServer>, Arc<SledStore>)> {
    let window = WindowConfig {
        max_entries: config.window_max_ops,
        ttl: config.window_ttl,
    };

    let storage_config =
        StorageConfig::new(config.storage_path.clone()).with_cache_size(config.storage_cache_bytes);
    let store = Arc::new(SledStore::open(storage_config)?.with_window(window));
    info!("Storage initialized at {}", config.storage_path);

    let log: Arc<dyn OperationLog> = match config.oplog_backend {
        OpLogBackend::Memory => Arc::new(MemoryOperationLog::new(window)),
        OpLogBackend::Sled => store.clone(),
    };

    let coordinator = Arc::new(DocumentCoordinator::new(
        CoordinatorConfig {
            max_document_chars: config.max_document_chars,
            conflict_policy: config.conflict_policy,
            ..Default::default()
        },
        store.clone(),
        log,
    ));

    let secret = config
        .jwt_secret
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("JWT_SECRET is not set"))?;
    let identity = Arc::new(JwtVerifier::new(secret)?);

    let access: Arc<dyn AccessPolicy> = match &config.access_service_url {
        Some(url) => {
            info!("Document access checked against {}", url);
            Arc::new(HttpAccessPolicy::new(url, Duration::from_secs(5))?)
        }
        None => {
            warn!("ALLOW_ALL_ACCESS is set: every verified user may open every document");
            Arc::new(StaticAccessPolicy::allow_all())
        }
    };

    let server_config = CollabServerConfig {
        save_interval: config.save_interval,
        cleanup_interval: config.cleanup_interval,
        session_timeout: config.session_timeout,
        ..Default::default()
    };
    info!("Node id: {}", server_config.node_id);

    // bus and presence handles are what other nodes in this process would share
    let bus = Arc::new(LocalBus::default());
    let presence = Arc::new(PresenceManager::new());
    let collab = CollabServer::new(server_config, coordinator, identity, access, bus)
        .with_presence(presence);
    let collab = Arc::new(collab);
    Ok((collab, store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codoc_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!(
        "Conflict policy: {:?}, oplog backend: {:?}",
        config.conflict_policy, config.oplog_backend
    );

    let (collab, store) = build_server(&config)?;
    let background = collab.clone().start_background_tasks();

    let state = Arc::new(AppState {
        collab: collab.clone(),
        store,
        heartbeat_interval: config.heartbeat_interval,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Codoc server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_server = collab.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown_server.shutdown();
        })
        .await?;

    // final save runs in the save task
    background.wait().await;
    info!("Server stopped");
    Ok(())
}
