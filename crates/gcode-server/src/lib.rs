//! HTTP and WebSocket front end for the gcode collaborative editor.
//!
//! The server is a thin relay: it turns socket events and HTTP calls into
//! `ExecutionRequest`s for the core `Dispatcher`, keeps the presence list of
//! connected users, and streams results back.

pub mod error;
pub mod events;
pub mod session;
pub mod ws;

pub use error::{Result, ServerError};
pub use events::{ClientMessage, ServerMessage};
pub use session::SessionRegistry;

use axum::extract::{DefaultBodyLimit, Json as AxumJson, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::{middleware, Router};
use gcode_core::pipeline::{PipelineKind, PipelineRegistry};
use gcode_core::{Dispatcher, ExecutionRequest, ExecutionResult, GcodeConfig, Orchestrator, SessionId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub connected_sessions: usize,
}

/// One entry of the `/languages` listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub id: String,
    pub kind: PipelineKind,
    pub extension: String,
    pub requirements: Option<String>,
    pub available: bool,
}

/// Body of `POST /execute`.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            enable_cors: true,
            cors_origins: None,
            max_body_size: 1024 * 1024,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server settings from a validated configuration.
    pub fn from_config(config: &GcodeConfig) -> Result<Self> {
        let server = &config.server;
        Ok(Self::new()
            .with_bind_addr_str(&server.bind_addr)?
            .with_cors(server.enable_cors)
            .with_optional_cors_origins(server.cors_origins.clone())
            .with_max_body_size(server.max_body_size)
            .with_logging(config.logging.requests))
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::invalid_request(format!("Invalid bind address '{}': {}", addr, e)))?;
        Ok(self)
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_optional_cors_origins(mut self, origins: Option<Vec<String>>) -> Self {
        self.cors_origins = origins;
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub sessions: Arc<SessionRegistry>,
    pub config: ServerConfig,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_sessions: state.sessions.connected(),
    })
}

async fn languages_handler(State(state): State<AppState>) -> Json<Vec<LanguageInfo>> {
    Json(language_listing(state.dispatcher.orchestrator().registry()))
}

/// Describe every registered pipeline, probing PATH for its toolchain.
pub fn language_listing(registry: &PipelineRegistry) -> Vec<LanguageInfo> {
    registry
        .pipelines()
        .into_iter()
        .map(|spec| LanguageInfo {
            id: spec.language.to_string(),
            kind: spec.kind(),
            extension: spec.source_ext.clone(),
            requirements: spec.requirements(),
            available: PipelineRegistry::toolchain_available(spec),
        })
        .collect()
}

async fn execute_handler(
    State(state): State<AppState>,
    AxumJson(body): AxumJson<ExecuteRequest>,
) -> Result<Json<ExecutionResult>> {
    if body.language.trim().is_empty() {
        return Err(ServerError::invalid_request("language must not be empty"));
    }

    let session_id = body
        .session_id
        .filter(|id| !id.trim().is_empty())
        .map(SessionId::new)
        .unwrap_or_else(SessionId::generate);
    log::info!("HTTP execution for session {} ({})", session_id, body.language);

    let mut request = ExecutionRequest::new(session_id, body.language, body.code);
    request.stdin = body.stdin;
    Ok(Json(state.dispatcher.run(&request).await))
}

pub struct GcodeServer {
    dispatcher: Dispatcher,
    sessions: Arc<SessionRegistry>,
    config: ServerConfig,
}

impl GcodeServer {
    pub fn new(dispatcher: Dispatcher, config: ServerConfig) -> Self {
        Self {
            dispatcher,
            sessions: Arc::new(SessionRegistry::new()),
            config,
        }
    }

    /// Wire the full production stack from a loaded configuration.
    pub fn from_config(config: &GcodeConfig) -> Result<Self> {
        let orchestrator = Orchestrator::from_config(config)?;
        let dispatcher = Dispatcher::new(Arc::new(orchestrator));
        Ok(Self::new(dispatcher, ServerConfig::from_config(config)?))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
            sessions: self.sessions.clone(),
            config: self.config.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/languages", get(languages_handler))
            .route("/execute", post(execute_handler))
            .route("/ws", get(ws::ws_handler))
            .with_state(state)
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(self.config.max_body_size));

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async move {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // Health probes are frequent; keep them out of the info log.
                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::debug!(
                        "Response {} {} in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );
                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors_layer = match &self.config.cors_origins {
                Some(origins) => {
                    let parsed: std::result::Result<Vec<_>, _> =
                        origins.iter().map(|s| s.parse()).collect();
                    match parsed {
                        Ok(origins) => CorsLayer::new()
                            .allow_origin(origins)
                            .allow_methods(Any)
                            .allow_headers(Any),
                        Err(_) => {
                            log::warn!("Invalid CORS origin in {:?}, allowing any origin", origins);
                            CorsLayer::permissive()
                        }
                    }
                }
                None => CorsLayer::permissive(),
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Start the server; returns when `shutdown_signal` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            ServerError::internal(format!("Failed to bind to {}: {}", self.config.bind_addr, e))
        })?;

        log::info!("gcode server starting on {}", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);
        log::info!("Languages: http://{}/languages", self.config.bind_addr);
        log::info!("WebSocket endpoint: ws://{}/ws", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("gcode server shut down gracefully");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
