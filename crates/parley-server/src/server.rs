//! `ParleyServer`: axum router, listener and hub lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use parley_core::gateway::InferenceGateway;
use parley_core::ids::SessionId;
use parley_settings::{ParleySettings, SessionScope};

use crate::connection::{Connection, ConnectionOptions};
use crate::health::{self, HealthResponse};
use crate::hub::{Hub, HubHandle};
use crate::shutdown::ShutdownCoordinator;

/// Shared state handed to every axum handler.
#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    gateway: Arc<dyn InferenceGateway>,
    options: ConnectionOptions,
    session_scope: SessionScope,
    max_message_size: usize,
    start_time: Instant,
    started_at: DateTime<Utc>,
}

impl AppState {
    fn connection(&self) -> Connection {
        let session_id = match self.session_scope {
            SessionScope::Connection => SessionId::new(),
            SessionScope::Shared => SessionId::shared(),
        };
        Connection::new(
            self.hub.clone(),
            Arc::clone(&self.gateway),
            session_id,
            self.options.clone(),
        )
    }
}

pub struct ParleyServer {
    settings: ParleySettings,
    gateway: Arc<dyn InferenceGateway>,
    hub: HubHandle,
    /// The loop itself, until `listen` spawns it.
    hub_loop: Mutex<Option<Hub>>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    started_at: DateTime<Utc>,
}

impl ParleyServer {
    pub fn new(settings: ParleySettings, gateway: Arc<dyn InferenceGateway>) -> Self {
        let (hub_loop, hub) = Hub::new();
        Self {
            settings,
            gateway,
            hub,
            hub_loop: Mutex::new(Some(hub_loop)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            gateway: Arc::clone(&self.gateway),
            options: ConnectionOptions::from_settings(
                &self.settings.server,
                self.settings.hub.delivery,
            ),
            session_scope: self.settings.hub.session_scope,
            max_message_size: self.settings.server.max_message_size,
            start_time: self.start_time,
            started_at: self.started_at,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/ping", get(ping_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address, start the hub loop and serve until shutdown.
    ///
    /// Can be called once; the hub loop is consumed by the first call.
    pub async fn listen(&self) -> std::io::Result<ServerHandle> {
        let listener = tokio::net::TcpListener::bind(self.settings.server.bind_addr()).await?;
        let addr = listener.local_addr()?;

        let hub_loop = self
            .hub_loop
            .lock()
            .take()
            .ok_or_else(|| std::io::Error::other("server already started"))?;
        let hub_task = hub_loop.spawn(self.shutdown.token());

        let router = self.router();
        let token = self.shutdown.token();
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        });

        info!(
            %addr,
            gateway = self.gateway.name(),
            delivery = ?self.settings.hub.delivery,
            session_scope = ?self.settings.hub.session_scope,
            "parley server listening"
        );
        Ok(ServerHandle {
            addr,
            server: server_task,
            hub: hub_task,
        })
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn settings(&self) -> &ParleySettings {
        &self.settings
    }
}

/// Tasks started by [`ParleyServer::listen`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    server: JoinHandle<()>,
    hub: JoinHandle<()>,
}

impl ServerHandle {
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        vec![self.server, self.hub]
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move { state.connection().serve(socket).await })
}

/// GET /ping
async fn ping_handler() -> Json<Value> {
    Json(json!({"message": "pong"}))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.started_at,
        state.gateway.name(),
        state.hub.stats(),
    ))
}
