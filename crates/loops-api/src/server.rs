//! API server implementation.
//!
//! Provides health, ready, metrics and SOS endpoints, and runs the engine's
//! background tasks for the lifetime of the server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use loops_core::Result;
use loops_sos::prelude::{DispatchQueue, NotificationChannel};

use crate::config::Config;
use crate::engine::Engine;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The wired engine.
    pub engine: Engine,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("engine", &"<Engine>")
            .finish()
    }
}

impl AppState {
    /// Creates application state.
    #[must_use]
    pub const fn new(config: Config, engine: Engine) -> Self {
        Self { config, engine }
    }
}

/// Returns 200 OK if the service is alive. Does not check dependencies.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Returns 200 OK if the dispatch queue answers.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.queue.depth().await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("dispatch queue unavailable: {e}")),
            }),
        ),
    }
}

/// The Loops API server.
pub struct Server {
    config: Config,
    engine: Engine,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish()
    }
}

impl Server {
    /// Creates a server with an in-memory engine and no external providers.
    ///
    /// Use [`Server::with_engine`] with [`Engine::from_config`] for production.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = Engine::in_memory(&config);
        Self { config, engine }
    }

    /// Creates a server around an already wired engine.
    #[must_use]
    pub const fn with_engine(config: Config, engine: Engine) -> Self {
        Self { config, engine }
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the engine behind the routes.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    fn create_router(&self) -> Router {
        let state = Arc::new(AppState::new(self.config.clone(), self.engine.clone()));

        let auth_layer =
            middleware::from_fn_with_state(Arc::clone(&state), crate::context::auth_middleware);
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        Router::new()
            // Health, ready, and metrics endpoints (no auth required)
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .nest("/api/v1", crate::routes::api_v1_routes().layer(auth_layer))
            // Metrics outermost for timing, then trace.
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state)
    }

    /// Starts the server and blocks until Ctrl-C.
    ///
    /// Dispatch workers, the resolution listener and housekeeping run
    /// alongside the HTTP listener and are stopped after it drains.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server cannot
    /// bind to the port.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;
        crate::metrics::init_metrics();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.create_router();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| loops_core::Error::internal(format!("failed to bind to {addr}: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self
            .engine
            .spawn_background(self.config.notify.workers, &shutdown_rx);

        tracing::info!(
            http_port = self.config.http_port,
            workers = self.config.notify.workers,
            debug = self.config.debug,
            "Starting Loops API server"
        );

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task failed");
            }
        }
        tracing::info!("Loops API server stopped");

        served.map_err(|e| loops_core::Error::internal(format!("server error: {e}")))
    }

    /// Creates a router without binding to a port or starting workers.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

/// Builder for constructing a server.
#[derive(Default)]
pub struct ServerBuilder {
    config: Config,
    channels: Option<Vec<Arc<dyn NotificationChannel>>>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("channels", &self.channels.as_ref().map(Vec::len))
            .finish()
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the HTTP port.
    #[must_use]
    pub const fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode.
    ///
    /// See `Config::debug` for behavior changes (header-based identity vs Authorization).
    #[must_use]
    pub const fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the JWT HS256 secret used for bearer token verification.
    ///
    /// Required when `debug` is false.
    #[must_use]
    pub fn jwt_hs256_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt.hs256_secret = Some(secret.into());
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Uses explicit notification channels instead of the local defaults.
    #[must_use]
    pub fn channels(mut self, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Builds the server with an in-memory engine.
    #[must_use]
    pub fn build(self) -> Server {
        let engine = match self.channels {
            Some(channels) => Engine::with_channels(&self.config, channels),
            None => Engine::in_memory(&self.config),
        };
        Server::with_engine(self.config, engine)
    }
}
