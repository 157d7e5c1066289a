//! JSON-RPC 2.0 envelope types for the `/api/acp` endpoint.
//!
//! Framework-free so the same dispatch can sit behind axum, an IPC
//! bridge, or tests. The error object carries optional `authMethods` /
//! `agentInfo` fields: the browser needs them to render a sign-in prompt
//! when an agent refuses to open a session without credentials.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use routa_acp::{AgentInfo, AuthMethod, BrokerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_methods: Option<Vec<AuthMethod>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_info: Option<AgentInfo>,
}

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application-defined codes (server range)
pub const AUTH_REQUIRED: i64 = -32001;
pub const SESSION_NOT_FOUND: i64 = -32002;
pub const PROMPT_IN_FLIGHT: i64 = -32003;
pub const TIMEOUT: i64 = -32004;

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                auth_methods: None,
                agent_info: None,
            }),
        }
    }

    /// Map a broker error onto the wire, attaching auth payload when the
    /// agent asked for credentials.
    pub fn from_broker_error(id: Option<Value>, err: BrokerError) -> Self {
        match err {
            BrokerError::AuthRequired {
                message,
                auth_methods,
                agent_info,
            } => Self {
                jsonrpc: "2.0".into(),
                id,
                result: None,
                error: Some(JsonRpcError {
                    code: AUTH_REQUIRED,
                    message,
                    auth_methods: Some(auth_methods),
                    agent_info,
                }),
            },
            BrokerError::SessionNotFound(_) => {
                Self::error(id, SESSION_NOT_FOUND, err.to_string())
            }
            BrokerError::PromptInFlight(_) => Self::error(id, PROMPT_IN_FLIGHT, err.to_string()),
            BrokerError::Timeout { .. } => Self::error(id, TIMEOUT, err.to_string()),
            BrokerError::PresetNotFound(_) => Self::error(id, INVALID_PARAMS, err.to_string()),
            other => Self::error(id, INTERNAL_ERROR, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_carries_methods_and_agent_info() {
        let err = BrokerError::AuthRequired {
            message: "please sign in".into(),
            auth_methods: vec![AuthMethod {
                id: "oauth".into(),
                name: "Sign in".into(),
                description: None,
            }],
            agent_info: Some(AgentInfo {
                name: "gemini".into(),
                version: Some("1.0".into()),
            }),
        };
        let response = JsonRpcResponse::from_broker_error(Some(serde_json::json!(1)), err);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["code"], AUTH_REQUIRED);
        assert_eq!(value["error"]["authMethods"][0]["id"], "oauth");
        assert_eq!(value["error"]["agentInfo"]["name"], "gemini");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn plain_error_omits_auth_fields() {
        let response =
            JsonRpcResponse::error(None, METHOD_NOT_FOUND, "Method not found: nope");
        let value = serde_json::to_value(&response).unwrap();
        assert!(value["error"].get("authMethods").is_none());
    }
}
