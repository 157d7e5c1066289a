//! `/api/acp` — JSON-RPC POST endpoint and per-session SSE channel.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio::sync::broadcast;

use routa_acp::adapters::api::is_serverless;
use routa_acp::events::types::{
    session_info, session_notification, split_notification, update_kind, EventKind,
};
use routa_acp::{BrokerError, CreateSessionParams};

use crate::rpc::{JsonRpcRequest, JsonRpcResponse, INVALID_REQUEST, METHOD_NOT_FOUND};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(acp_sse).post(acp_rpc))
        .route("/warmup", get(warmup_statuses))
        .route("/warmup/{agent_id}", post(trigger_warmup))
}

// ─── JSON-RPC dispatch ──────────────────────────────────────────────────

async fn acp_rpc(State(state): State<AppState>, Json(body): Json<Value>) -> Json<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return Json(JsonRpcResponse::error(
                None,
                INVALID_REQUEST,
                format!("Invalid request: {e}"),
            ))
        }
    };

    if request.jsonrpc != "2.0" {
        return Json(JsonRpcResponse::error(
            request.id,
            INVALID_REQUEST,
            "Invalid JSON-RPC version, expected \"2.0\"",
        ));
    }

    let id = request.id.clone();
    let params = request.params.unwrap_or_else(|| json!({}));

    let result = match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": 1,
            "agentCapabilities": {
                "sessions": true,
                "prompts": true,
                "streaming": true,
            },
            "agentInfo": {
                "name": "routa-acp-server",
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),

        "_providers/list" => {
            let providers = state.catalog.list_presets(true).await;
            Ok(json!({ "providers": providers }))
        }

        "session/new" => session_new(&state, params).await,
        "session/prompt" => session_prompt(&state, params).await,
        "session/set_mode" => session_set_mode(&state, params).await,
        "session/cancel" => session_cancel(&state, params).await,

        other => {
            return Json(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ))
        }
    };

    Json(match result {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(err) => JsonRpcResponse::from_broker_error(id, err),
    })
}

async fn session_new(state: &AppState, params: Value) -> Result<Value, BrokerError> {
    let create: CreateSessionParams = serde_json::from_value(params)
        .map_err(|e| BrokerError::Internal(format!("invalid params: {e}")))?;

    // First use of a registry agent benefits from a pre-warmed package.
    if let Some(provider) = &create.provider {
        state.warmup.warmup_in_background(provider).await;
    }

    let record = state.session_manager.create_session(create).await?;
    Ok(json!({
        "sessionId": record.session_id,
        "provider": record.provider,
        "role": record.role,
        "agentId": record.agent_session_id,
    }))
}

async fn session_prompt(state: &AppState, params: Value) -> Result<Value, BrokerError> {
    let session_id = required_str(&params, "sessionId")?;
    let text = prompt_text(&params);

    // In serverless mode the browser cannot hold the SSE channel across
    // instances, so the response must embed everything the stream carried.
    let serverless = is_serverless();
    let history_mark = if serverless {
        state.session_manager.history(&session_id).await.len()
    } else {
        0
    };

    let result = state.session_manager.prompt(&session_id, &text).await?;

    let mut response = json!({ "stopReason": result.stop_reason });
    if let Some(usage) = &result.usage {
        response["usage"] = usage.clone();
    }
    if serverless {
        let content = match result.content {
            Some(content) => content,
            None => accumulated_text(state, &session_id, history_mark).await,
        };
        response["content"] = json!(content);
    }
    Ok(response)
}

/// Rebuild the turn's assistant text from the replay buffer.
async fn accumulated_text(state: &AppState, session_id: &str, from: usize) -> String {
    state
        .session_manager
        .history(session_id)
        .await
        .iter()
        .skip(from)
        .filter_map(|frame| split_notification(frame).map(|(_, update)| update.clone()))
        .filter(|update| update_kind(update) == Some(EventKind::AgentMessageChunk))
        .filter_map(|update| {
            update
                .pointer("/content/text")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

async fn session_set_mode(state: &AppState, params: Value) -> Result<Value, BrokerError> {
    let session_id = required_str(&params, "sessionId")?;
    let mode_id = required_str(&params, "modeId")?;
    state.session_manager.set_mode(&session_id, &mode_id).await?;
    Ok(json!({}))
}

async fn session_cancel(state: &AppState, params: Value) -> Result<Value, BrokerError> {
    let session_id = required_str(&params, "sessionId")?;
    state.session_manager.cancel(&session_id).await?;
    Ok(json!({}))
}

fn required_str(params: &Value, key: &str) -> Result<String, BrokerError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BrokerError::Internal(format!("missing '{key}'")))
}

/// Concatenate the text parts of a `prompt` array.
fn prompt_text(params: &Value) -> String {
    params
        .get("prompt")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

// ─── SSE channel ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SseQuery {
    session_id: Option<String>,
}

/// `GET /api/acp?sessionId=...` — live `session/update` frames.
async fn acp_sse(
    State(state): State<AppState>,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let session_id = query.session_id.ok_or(StatusCode::BAD_REQUEST)?;
    let mut rx = state
        .session_manager
        .subscribe(&session_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    yield Ok(Event::default().data(frame.to_string()));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // This subscriber fell behind and lost frames; mark the
                    // gap so the client can resync from history.
                    let gap = session_notification(
                        &session_id,
                        session_info(
                            &format!("{missed} events dropped for this subscriber"),
                            Some(json!({ "droppedEvents": missed })),
                        ),
                    );
                    yield Ok(Event::default().data(gap.to_string()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ─── Warmup ─────────────────────────────────────────────────────────────

async fn warmup_statuses(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "statuses": state.warmup.all_statuses().await }))
}

async fn trigger_warmup(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Json<Value> {
    state.warmup.warmup_in_background(&agent_id).await;
    Json(json!({ "status": state.warmup.status(&agent_id).await }))
}
