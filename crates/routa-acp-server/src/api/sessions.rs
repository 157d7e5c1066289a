//! `/api/sessions` — listing, history replay, teardown.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions))
        .route("/{session_id}", get(get_session).delete(kill_session))
        .route("/{session_id}/history", get(session_history))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.session_manager.list_sessions().await }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let record = state
        .session_manager
        .get_session(&session_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "session": record,
        "alive": state.session_manager.is_alive(&session_id).await,
    })))
}

/// The complete ordered list of normalized events emitted so far; a
/// reconnecting client replays this before the SSE stream takes over.
async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if state.session_manager.get_session(&session_id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let events = state.session_manager.history(&session_id).await;
    Ok(Json(json!({ "sessionId": session_id, "events": events })))
}

async fn kill_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    state.session_manager.kill_session(&session_id).await;
    Json(json!({ "killed": session_id }))
}
