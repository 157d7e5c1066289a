//! HTTP API surface.

pub mod acp;
pub mod sessions;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/api/acp", acp::router())
        .nest("/api/sessions", sessions::router())
}
