//! Core error type for the ACP broker.
//!
//! `BrokerError` is used throughout the core domain. The server crate maps
//! it onto JSON-RPC error objects; `AuthRequired` is the one variant that
//! carries structured payload (the UI needs the agent's auth methods to
//! prompt the user).

use serde::{Deserialize, Serialize};

/// An authentication method advertised by an agent during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethod {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Name/version pair reported by the agent during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Authentication required: {message}")]
    AuthRequired {
        message: String,
        auth_methods: Vec<AuthMethod>,
        agent_info: Option<AgentInfo>,
    },

    #[error("Agent error [{code}]: {message}")]
    Protocol { code: i64, message: String },

    #[error("Timeout waiting for {method} ({timeout_ms}ms)")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Process exited: {0}")]
    ProcessExited(String),

    #[error("A prompt is already in flight for session {0}")]
    PromptInFlight(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Preset not found: {0}")]
    PresetNotFound(String),

    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Whether this error indicates the agent wants credentials before it
    /// will open a session.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, BrokerError::AuthRequired { .. })
    }
}

/// Pattern match on an agent-side JSON-RPC error message to recognize
/// "please authenticate first" replies. Agents phrase this differently
/// (OpenCode: "authentication required", Gemini: "not logged in", Copilot:
/// "unauthorized"), so this is deliberately loose.
pub fn looks_like_auth_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("auth")
        || lower.contains("unauthorized")
        || lower.contains("logged in")
        || lower.contains("log in")
        || lower.contains("login")
        || lower.contains("api key")
        || lower.contains("credential")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_pattern_matches_common_phrasings() {
        assert!(looks_like_auth_error("Authentication required"));
        assert!(looks_like_auth_error("401 Unauthorized"));
        assert!(looks_like_auth_error("You are not logged in. Run `gemini login`."));
        assert!(looks_like_auth_error("missing API key"));
        assert!(!looks_like_auth_error("file not found"));
    }
}
