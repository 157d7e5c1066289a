//! Provider adapters.
//!
//! Conformant CLI providers already speak ACP over stdio and are driven
//! through `AgentProcess` unchanged. Claude Code and the direct-API
//! fallback have their own dialects and get translating adapters. All
//! three expose the same surface through `AgentHandle`, so the session
//! manager never branches on the wire format.

pub mod api;
pub mod claude;
pub mod partial_json;

use std::sync::Arc;

use serde_json::Value;

use crate::error::BrokerError;
use crate::process::AgentProcess;

pub use api::{DirectApiConfig, DirectApiSession};
pub use claude::{ClaudeCodeConfig, ClaudeCodeProcess, PromptOutcome};
pub use partial_json::repair_partial_json;

/// Uniform result of one prompt turn.
#[derive(Debug, Clone)]
pub struct PromptResult {
    pub stop_reason: String,
    pub usage: Option<Value>,
    /// Accumulated assistant text, for clients that cannot hold an SSE
    /// stream (serverless responses embed it).
    pub content: Option<String>,
}

/// A live provider connection, whatever its dialect.
pub enum AgentHandle {
    Acp(Arc<AgentProcess>),
    Claude(Arc<ClaudeCodeProcess>),
    Api(Arc<DirectApiSession>),
}

impl AgentHandle {
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Acp(p) => p.is_alive(),
            Self::Claude(p) => p.is_alive(),
            // No child process to die.
            Self::Api(_) => true,
        }
    }

    /// One prompt turn. Events stream through the session's channel in
    /// parallel; this resolves when the turn ends.
    pub async fn prompt(
        &self,
        agent_session_id: &str,
        text: &str,
    ) -> Result<PromptResult, BrokerError> {
        match self {
            Self::Acp(p) => {
                let result = p.prompt(agent_session_id, text).await?;
                Ok(PromptResult {
                    stop_reason: result
                        .get("stopReason")
                        .and_then(Value::as_str)
                        .unwrap_or("end_turn")
                        .to_string(),
                    usage: result.get("usage").cloned(),
                    content: None,
                })
            }
            Self::Claude(p) => {
                let outcome = p.prompt(text).await?;
                Ok(PromptResult {
                    stop_reason: outcome.stop_reason,
                    usage: outcome.usage,
                    content: outcome.result_text,
                })
            }
            Self::Api(s) => {
                let outcome = s.prompt(text).await?;
                Ok(PromptResult {
                    stop_reason: outcome.stop_reason,
                    usage: outcome.usage,
                    content: outcome.result_text,
                })
            }
        }
    }

    /// Fire-and-forget cancellation of the in-flight turn.
    pub async fn cancel(&self, agent_session_id: &str) {
        match self {
            Self::Acp(p) => p.cancel(agent_session_id).await,
            Self::Claude(p) => p.cancel().await,
            Self::Api(s) => s.cancel(),
        }
    }

    pub async fn kill(&self) {
        match self {
            Self::Acp(p) => p.kill().await,
            Self::Claude(p) => p.kill().await,
            Self::Api(_) => {}
        }
    }

    /// Child-exit signal, when there is a child to watch.
    pub fn exited(&self) -> Option<tokio::sync::watch::Receiver<bool>> {
        match self {
            Self::Acp(p) => Some(p.exited()),
            Self::Claude(p) => Some(p.exited()),
            Self::Api(_) => None,
        }
    }
}
