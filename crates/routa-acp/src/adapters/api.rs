//! Direct Anthropic API adapter for serverless hosts.
//!
//! Lambdas cannot keep a CLI child process alive between invocations, so
//! when the host looks serverless and an Anthropic credential is present,
//! sessions can route through the Messages API over HTTP streaming
//! instead. The adapter emits the same canonical events as the CLI
//! adapters; conversation continuity across turns comes from replaying the
//! retained message history on every request.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use super::claude::PromptOutcome;
use crate::error::BrokerError;
use crate::events::types::session_notification;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u64 = 8192;

/// Env markers set by the big serverless platforms.
pub fn is_serverless() -> bool {
    ["VERCEL", "AWS_LAMBDA_FUNCTION_NAME", "NETLIFY", "FUNCTION_NAME"]
        .iter()
        .any(|var| std::env::var(var).is_ok())
}

/// Whether a direct-API credential is configured.
pub fn has_api_credentials() -> bool {
    std::env::var("ANTHROPIC_API_KEY").is_ok() || std::env::var("ANTHROPIC_AUTH_TOKEN").is_ok()
}

// ─── Config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DirectApiConfig {
    pub api_key: Option<String>,
    pub auth_token: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: Option<u64>,
}

impl DirectApiConfig {
    pub fn from_env() -> Result<Self, BrokerError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        let auth_token = std::env::var("ANTHROPIC_AUTH_TOKEN").ok();
        if api_key.is_none() && auth_token.is_none() {
            return Err(BrokerError::Internal(
                "no ANTHROPIC_API_KEY or ANTHROPIC_AUTH_TOKEN configured".into(),
            ));
        }
        Ok(Self {
            api_key,
            auth_token,
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".into()),
            model: std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            timeout_ms: std::env::var("API_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
        })
    }
}

// ─── Turn state machine ─────────────────────────────────────────────────

/// Translates one streamed Messages API response into canonical events.
#[derive(Default)]
struct ApiTurn {
    text: String,
    stop_reason: Option<String>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    done: bool,
}

impl ApiTurn {
    /// Process one SSE event payload. Emits canonical events into `ntx`.
    fn handle_event(&mut self, event: &Value, ntx: &broadcast::Sender<Value>, sid: &str) {
        match event.get("type").and_then(Value::as_str).unwrap_or("") {
            "message_start" => {
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64);
            }
            "content_block_delta" => {
                match event.pointer("/delta/type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = event.pointer("/delta/text").and_then(Value::as_str) {
                            self.text.push_str(text);
                            let _ = ntx.send(session_notification(sid, json!({
                                "sessionUpdate": "agent_message_chunk",
                                "content": { "type": "text", "text": text },
                            })));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(thinking) =
                            event.pointer("/delta/thinking").and_then(Value::as_str)
                        {
                            let _ = ntx.send(session_notification(sid, json!({
                                "sessionUpdate": "agent_thought_chunk",
                                "content": { "type": "text", "text": thinking },
                            })));
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(stop) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(stop.to_string());
                }
                if let Some(output) = event.pointer("/usage/output_tokens").and_then(Value::as_u64)
                {
                    self.output_tokens = Some(output);
                }
            }
            "message_stop" => self.done = true,
            "error" => {
                self.stop_reason = Some("error".into());
                self.done = true;
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("API error");
                let _ = ntx.send(session_notification(sid, json!({
                    "sessionUpdate": "error",
                    "message": message,
                })));
            }
            _ => {}
        }
    }

    fn usage(&self) -> Option<Value> {
        if self.input_tokens.is_none() && self.output_tokens.is_none() {
            return None;
        }
        Some(json!({
            "inputTokens": self.input_tokens,
            "outputTokens": self.output_tokens,
        }))
    }
}

/// Split an SSE byte buffer into complete `data:` payload lines, keeping
/// the trailing incomplete fragment in `buffer`.
fn drain_sse_data(buffer: &mut String) -> VecDeque<String> {
    let mut payloads = VecDeque::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() && data != "[DONE]" {
                payloads.push_back(data.to_string());
            }
        }
    }
    payloads
}

// ─── Session ────────────────────────────────────────────────────────────

/// One API-backed conversation. Exposes the same surface as the CLI
/// adapters; there is no child process to supervise.
pub struct DirectApiSession {
    config: DirectApiConfig,
    our_session_id: String,
    /// SDK-style continuity id, stable across turns.
    api_session_id: String,
    history: Mutex<Vec<Value>>,
    notification_tx: broadcast::Sender<Value>,
    client: reqwest::Client,
    cancelled: Arc<tokio::sync::Notify>,
}

impl DirectApiSession {
    pub fn new(
        config: DirectApiConfig,
        notification_tx: broadcast::Sender<Value>,
        our_session_id: &str,
    ) -> Self {
        Self {
            config,
            our_session_id: our_session_id.to_string(),
            api_session_id: format!("api-{}", uuid::Uuid::new_v4()),
            history: Mutex::new(Vec::new()),
            notification_tx,
            client: reqwest::Client::new(),
            cancelled: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn api_session_id(&self) -> &str {
        &self.api_session_id
    }

    /// One prompt turn against the Messages API.
    pub async fn prompt(&self, text: &str) -> Result<PromptOutcome, BrokerError> {
        {
            let mut history = self.history.lock().await;
            history.push(json!({ "role": "user", "content": text }));
        }

        let body = {
            let history = self.history.lock().await;
            json!({
                "model": self.config.model,
                "max_tokens": DEFAULT_MAX_TOKENS,
                "stream": true,
                "messages": history.clone(),
            })
        };

        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-api-key", key);
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(timeout_ms) = self.config.timeout_ms {
            request = request.timeout(std::time::Duration::from_millis(timeout_ms));
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Internal(format!("Messages API request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BrokerError::Protocol {
                code: status.as_u16() as i64,
                message: format!("Messages API returned {status}: {detail}"),
            });
        }

        let mut turn = ApiTurn::default();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();
        let cancelled = self.cancelled.clone();

        loop {
            tokio::select! {
                _ = cancelled.notified() => {
                    turn.stop_reason = Some("cancelled".into());
                    break;
                }
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { break };
                    let chunk = chunk
                        .map_err(|e| BrokerError::Internal(format!("stream read: {e}")))?;
                    buffer.push_str(&String::from_utf8_lossy(&chunk));
                    for payload in drain_sse_data(&mut buffer) {
                        if let Ok(event) = serde_json::from_str::<Value>(&payload) {
                            turn.handle_event(&event, &self.notification_tx, &self.our_session_id);
                        }
                    }
                    if turn.done {
                        break;
                    }
                }
            }
        }

        let stop_reason = turn.stop_reason.clone().unwrap_or_else(|| "end_turn".into());
        let usage = turn.usage();

        {
            let mut history = self.history.lock().await;
            history.push(json!({ "role": "assistant", "content": turn.text.clone() }));
        }

        let mut complete = json!({
            "sessionUpdate": "turn_complete",
            "stopReason": stop_reason,
        });
        if let Some(usage) = usage.clone() {
            complete["usage"] = usage.clone();
        }
        let _ = self
            .notification_tx
            .send(session_notification(&self.our_session_id, complete));

        Ok(PromptOutcome {
            stop_reason,
            usage,
            result_text: Some(turn.text),
        })
    }

    /// Abort the in-flight turn, if any.
    pub fn cancel(&self) {
        self.cancelled.notify_waiters();
    }
}
