//! `HubServer`: axum host for one hub.
//!
//! Routes: `GET /health`, `GET /metrics` (when a Prometheus handle is
//! attached) and `GET <hub path>` for the WebSocket upgrade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use hubwire_core::errors::{HubError, Result};
use hubwire_settings::HubSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::clients::HubContext;
use crate::endpoint::{HubConnectionHandler, HubConnectionHandlerBuilder};
use crate::health::{self, HealthResponse};
use crate::hub::Hub;
use crate::lifetime::DefaultHubLifetimeManager;
use crate::options::HubOptions;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket;

/// Duplex buffer between a WebSocket and its connection handler.
const BRIDGE_BUFFER: usize = 64 * 1024;

/// Shared state accessible from axum handlers.
pub struct AppState<H: Hub> {
    handler: Arc<HubConnectionHandler<H>>,
    lifetime: Arc<DefaultHubLifetimeManager>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
    max_message_size: usize,
}

impl<H: Hub> Clone for AppState<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            lifetime: Arc::clone(&self.lifetime),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            max_message_size: self.max_message_size,
        }
    }
}

/// A running listener.
#[derive(Debug)]
pub struct ServerHandle {
    /// Bound address.
    pub addr: SocketAddr,
    /// The serve task.
    pub task: JoinHandle<()>,
}

/// Hosts one hub over HTTP/WebSocket.
pub struct HubServer<H: Hub> {
    settings: HubSettings,
    state: AppState<H>,
}

impl<H: Hub> HubServer<H> {
    /// Build a server. The builder's lifetime manager and options are
    /// replaced by the server's own, derived from `settings`.
    pub fn new(settings: HubSettings, builder: HubConnectionHandlerBuilder<H>) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| HubError::InvalidArgument(e.to_string()))?;
        let lifetime = Arc::new(DefaultHubLifetimeManager::new());
        let handler = builder
            .lifetime(lifetime.clone())
            .options(HubOptions::from(&settings))
            .build()?;
        Ok(Self {
            state: AppState {
                handler: Arc::new(handler),
                lifetime,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                metrics: None,
                start_time: Instant::now(),
                max_message_size: settings.server.max_message_size,
            },
            settings,
        })
    }

    /// Serve Prometheus metrics at `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler::<H>))
            .route("/metrics", get(metrics_handler::<H>))
            .route(&self.settings.server.path, get(hub_upgrade::<H>))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind `host:port` from settings and serve until shutdown.
    pub async fn listen(&self) -> Result<ServerHandle> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        info!(%addr, path = %self.settings.server.path, "hub server listening");
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(token.cancelled_owned());
            if let Err(err) = serve.await {
                warn!(error = %err, "hub server stopped with an error");
            }
        });
        Ok(ServerHandle { addr, task })
    }

    /// Stop accepting, abort every connection and wait for handlers.
    pub async fn shutdown(&self, handle: ServerHandle, timeout: Option<Duration>) {
        let lifetime = Arc::clone(&self.state.lifetime);
        self.state
            .shutdown
            .graceful_shutdown(vec![handle.task], move || lifetime.abort_all(), timeout)
            .await;
    }

    /// Send to clients from outside hub calls.
    pub fn hub_context(&self) -> HubContext {
        self.state.handler.hub_context()
    }

    /// The lifetime manager.
    pub fn lifetime(&self) -> &Arc<DefaultHubLifetimeManager> {
        &self.state.lifetime
    }

    /// The shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Settings in effect.
    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }
}

/// GET /health
async fn health_handler<H: Hub>(State(state): State<AppState<H>>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.lifetime.connection_count(),
        state.lifetime.groups().group_count(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler<H: Hub>(State(state): State<AppState<H>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET <hub path>: upgrade and hand the socket to the connection handler.
async fn hub_upgrade<H: Hub>(State(state): State<AppState<H>>, ws: WebSocketUpgrade) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let shutdown = Arc::clone(&state.shutdown);
            let connection = shutdown.track(serve_socket(socket, state));
            if let Err(err) = connection.await {
                warn!(error = %err, "connection task failed");
            }
        })
}

async fn serve_socket<H: Hub>(socket: WebSocket, state: AppState<H>) {
    let (transport, pump) = websocket::bridge(socket, BRIDGE_BUFFER);
    if let Err(err) = state.handler.run(transport, None).await {
        info!(error = %err, "hub connection ended with an error");
    }
    if let Err(err) = pump.await {
        warn!(error = %err, "websocket pump failed");
    }
}
