//! Routa ACP broker HTTP server — axum adapter on top of `routa-acp`.
//!
//! Boundary: a JSON-RPC POST endpoint (`/api/acp`), a per-session SSE
//! channel (`GET /api/acp?sessionId=`), and session listing / history /
//! teardown under `/api/sessions`. The browser's acp-client speaks
//! exactly this surface.

pub mod api;
pub mod rpc;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use self::state::{AppState, AppStateInner};

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3211,
        }
    }
}

/// Build the shared application state.
pub fn create_app_state() -> AppState {
    Arc::new(AppStateInner::new())
}

/// Build the full router over a given state.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .route("/api/health", axum::routing::get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the broker server. Returns the bound address; the server runs in
/// a background task until the process exits or `state.shutdown()` is
/// called.
pub async fn start_server(config: ServerConfig) -> Result<(SocketAddr, AppState), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "routa_acp=info,routa_acp_server=info,tower_http=info".into()),
        )
        .init();

    // Resolve the login-shell PATH early so every agent spawn sees it.
    let full_path = routa_acp::shell_env::full_path();
    std::env::set_var("PATH", full_path);

    let state = create_app_state();
    let addr = start_server_with_state(config, state.clone()).await?;
    Ok((addr, state))
}

/// Start the HTTP server with a pre-built state. Useful for embedding and
/// for tests that bind to port 0.
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<SocketAddr, String> {
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("Invalid address: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {addr}: {e}"))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {e}"))?;

    tracing::info!("routa-acp broker listening on {}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(local_addr)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "routa-acp-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
