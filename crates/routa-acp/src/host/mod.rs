//! Host capability service — the agent→host RPC surface.
//!
//! Agents call back into the host for filesystem access, terminals, and
//! permission prompts. Every request gets exactly one response; failures
//! are translated to JSON-RPC errors (`-32000` + the OS message for I/O,
//! `-32601` for unknown methods) and never crash the host.
//!
//! Permissions are auto-approved: the broker is built for autonomous
//! operation, and human-in-the-loop belongs to the UI, not the protocol.

pub mod terminal;

pub use terminal::{TerminalCreateParams, TerminalManager};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::BrokerError;

/// JSON-RPC error code for host-side I/O failures.
pub const HOST_ERROR: i64 = -32000;
/// JSON-RPC error code for unsupported methods.
pub const METHOD_NOT_SUPPORTED: i64 = -32601;

/// Services the host offers to its agent child processes. One instance per
/// agent process; terminals die with it.
pub struct HostServices {
    terminals: TerminalManager,
}

impl HostServices {
    pub fn new() -> Self {
        Self {
            terminals: TerminalManager::new(),
        }
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    /// Dispatch one agent→host request. Returns the `result` value or a
    /// `(code, message)` error pair for the JSON-RPC reply.
    pub async fn handle_request(
        &self,
        method: &str,
        params: &Value,
        session_id: &str,
        notifier: broadcast::Sender<Value>,
    ) -> Result<Value, (i64, String)> {
        match method {
            "session/request_permission" => Ok(json!({
                "outcome": { "outcome": "approved" }
            })),

            "fs/read_text_file" => {
                let path = require_str(params, "path")?;
                match tokio::fs::read_to_string(path).await {
                    Ok(content) => Ok(json!({ "content": content })),
                    Err(e) => Err((HOST_ERROR, e.to_string())),
                }
            }

            "fs/write_text_file" => {
                let path = require_str(params, "path")?;
                let content = params
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        return Err((HOST_ERROR, e.to_string()));
                    }
                }
                match tokio::fs::write(path, content).await {
                    Ok(()) => Ok(json!({})),
                    Err(e) => Err((HOST_ERROR, e.to_string())),
                }
            }

            "terminal/create" => {
                let create: TerminalCreateParams = serde_json::from_value(params.clone())
                    .map_err(|e| (HOST_ERROR, format!("invalid terminal params: {e}")))?;
                let terminal_id = self
                    .terminals
                    .create(create, session_id, notifier)
                    .await
                    .map_err(host_error)?;
                Ok(json!({ "terminalId": terminal_id }))
            }

            "terminal/output" => {
                let id = require_str(params, "terminalId")?;
                self.terminals.output(id).await.map_err(host_error)
            }

            "terminal/wait_for_exit" => {
                let id = require_str(params, "terminalId")?;
                let code = self.terminals.wait_for_exit(id).await.map_err(host_error)?;
                Ok(json!({ "exitCode": code }))
            }

            "terminal/kill" => {
                let id = require_str(params, "terminalId")?;
                self.terminals.kill(id).await.map_err(host_error)?;
                Ok(json!({}))
            }

            "terminal/release" => {
                let id = require_str(params, "terminalId")?;
                self.terminals.release(id).await.map_err(host_error)?;
                Ok(json!({}))
            }

            other => Err((
                METHOD_NOT_SUPPORTED,
                format!("Method not supported: {other}"),
            )),
        }
    }

    /// Shut down everything this host side owns.
    pub async fn shutdown(&self) {
        self.terminals.release_all().await;
    }
}

impl Default for HostServices {
    fn default() -> Self {
        Self::new()
    }
}

fn host_error(e: BrokerError) -> (i64, String) {
    (HOST_ERROR, e.to_string())
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, (i64, String)> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| (HOST_ERROR, format!("missing '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> broadcast::Sender<Value> {
        broadcast::channel(16).0
    }

    #[tokio::test]
    async fn permission_is_auto_approved() {
        let host = HostServices::new();
        let result = host
            .handle_request("session/request_permission", &json!({}), "s1", notifier())
            .await
            .unwrap();
        assert_eq!(result["outcome"]["outcome"], "approved");
    }

    #[tokio::test]
    async fn fs_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/file.txt");
        let host = HostServices::new();

        host.handle_request(
            "fs/write_text_file",
            &json!({ "path": path, "content": "hello" }),
            "s1",
            notifier(),
        )
        .await
        .unwrap();

        let read = host
            .handle_request("fs/read_text_file", &json!({ "path": path }), "s1", notifier())
            .await
            .unwrap();
        assert_eq!(read["content"], "hello");
    }

    #[tokio::test]
    async fn read_missing_file_maps_to_host_error() {
        let host = HostServices::new();
        let err = host
            .handle_request(
                "fs/read_text_file",
                &json!({ "path": "/definitely/not/here.txt" }),
                "s1",
                notifier(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.0, HOST_ERROR);
    }

    #[tokio::test]
    async fn unknown_method_is_not_supported() {
        let host = HostServices::new();
        let err = host
            .handle_request("fs/delete_everything", &json!({}), "s1", notifier())
            .await
            .unwrap_err();
        assert_eq!(err.0, METHOD_NOT_SUPPORTED);
    }
}
