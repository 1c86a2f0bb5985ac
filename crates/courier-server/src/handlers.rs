//! HTTP and WebSocket handlers for the Courier server.
//!
//! Every upgraded WebSocket is split into transport halves and handed to
//! the core [`Dispatcher`], which runs the connection until it ends.

use crate::auth::{AuthError, HeaderIdentity, IdentityResolver};
use crate::config::{Config, StoreBackend, StoreConfig};
use crate::sled_store::SledStore;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use courier_core::{DeliveryEngine, Dispatcher, MemoryStore, MessageStore, StoreError};
use courier_protocol::Frame;
use courier_transport::websocket;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Shared server state.
pub struct AppState {
    /// Routes frames from live connections to the delivery engine.
    pub dispatcher: Dispatcher,
    /// Maps requests to identities.
    pub resolver: Arc<dyn IdentityResolver>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state over `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity configuration is invalid.
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Result<Self> {
        let resolver = HeaderIdentity::from_config(&config.identity)?;
        let engine = Arc::new(DeliveryEngine::new(store, config.engine_config()));

        Ok(Self {
            dispatcher: Dispatcher::new(engine),
            resolver: Arc::new(resolver),
            config,
        })
    }
}

/// Errors returned by the REST endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The caller has no identity.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A required parameter is missing or invalid.
    #[error("Bad request: {0}")]
    BadRequest(&'static str),

    /// The store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(e) => e.into_response(),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()).into_response(),
            ApiError::Store(e) => {
                error!(error = %e, "Store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable").into_response()
            }
        }
    }
}

/// Open the configured message store.
///
/// # Errors
///
/// Returns an error if the sled database cannot be opened.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn MessageStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory message store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sled => {
            let path = shellexpand::tilde(&config.path).into_owned();
            let store = SledStore::open(&path)
                .with_context(|| format!("Failed to open sled store at {}", path))?;
            Ok(Arc::new(store))
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/messages", get(history_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = crate::metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let store = open_store(&config.store)?;
    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::new(config, store)?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    serve(listener, state).await
}

/// Serve requests on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O failure.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.dispatcher.engine().registry().len(),
    }))
}

#[derive(Debug, Deserialize)]
struct UpgradeParams {
    user_id: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<UpgradeParams>,
) -> Result<Response, AuthError> {
    let identity = state
        .resolver
        .resolve(&headers, params.user_id.as_deref())?;
    let ws_config = state.config.websocket_config();

    debug!(identity = %identity, remote = %remote, "WebSocket upgrade");

    Ok(ws
        .max_message_size(ws_config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (sink, source) = websocket::split(socket, &ws_config, Some(remote.to_string()));
            state
                .dispatcher
                .serve(identity, Box::new(sink), Box::new(source))
                .await;
        }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    peer_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    user_id: Option<String>,
}

/// Conversation history between the caller and `peer_id`, oldest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Frame>>, ApiError> {
    let identity = state
        .resolver
        .resolve(&headers, params.user_id.as_deref())?;
    let peer = params
        .peer_id
        .filter(|peer| !peer.is_empty())
        .ok_or(ApiError::BadRequest("peer_id is required"))?;

    let history = &state.config.history;
    let limit = params
        .limit
        .unwrap_or(history.default_limit)
        .min(history.max_limit);
    let offset = params.offset.unwrap_or(0);

    let messages = state
        .dispatcher
        .engine()
        .store()
        .history(&identity, &peer, limit, offset)
        .await?;

    Ok(Json(messages.iter().map(|m| m.to_frame()).collect()))
}
