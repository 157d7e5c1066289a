//! Terminal subsystem for agent-requested subprocesses.
//!
//! Agents ask the host to run commands (`terminal/create`) and then poll
//! or wait on them. Each terminal is an OS process with piped stdio;
//! combined stdout/stderr is accumulated per terminal and also streamed to
//! the owning session's notification channel as `terminal_output` frames so
//! the UI can render it live.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch, Mutex};

use crate::error::BrokerError;
use crate::events::types::session_notification;

/// Parameters for `terminal/create`.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCreateParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    // Accepted for wire compatibility; sizing only matters with a real PTY.
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
}

struct Terminal {
    child: Arc<Mutex<Option<tokio::process::Child>>>,
    output: Arc<Mutex<String>>,
    exit_rx: watch::Receiver<Option<i32>>,
    command: String,
}

/// Manages the terminals of one agent process.
pub struct TerminalManager {
    terminals: Mutex<HashMap<String, Terminal>>,
}

impl TerminalManager {
    pub fn new() -> Self {
        Self {
            terminals: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a terminal process and start streaming its output into
    /// `notifier` for `session_id`. Returns the terminal id.
    pub async fn create(
        &self,
        params: TerminalCreateParams,
        session_id: &str,
        notifier: broadcast::Sender<Value>,
    ) -> Result<String, BrokerError> {
        let terminal_id = format!("term-{}", uuid::Uuid::new_v4());

        let mut cmd = tokio::process::Command::new(&params.command);
        cmd.args(&params.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &params.env {
            cmd.envs(env);
        }
        cmd.env("PATH", crate::shell_env::full_path());

        let mut child = cmd.spawn().map_err(|e| BrokerError::Spawn {
            command: params.command.clone(),
            message: e.to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let output = Arc::new(Mutex::new(String::new()));
        let (exit_tx, exit_rx) = watch::channel(None);

        let _ = notifier.send(session_notification(
            session_id,
            json!({
                "sessionUpdate": "terminal_created",
                "terminalId": terminal_id,
                "command": params.command,
                "args": params.args,
            }),
        ));

        let mut readers = Vec::new();
        for stream in [
            stdout.map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
            stderr.map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
        ]
        .into_iter()
        .flatten()
        {
            let output = output.clone();
            let notifier = notifier.clone();
            let session_id = session_id.to_string();
            let terminal_id = terminal_id.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let data = format!("{line}\n");
                    output.lock().await.push_str(&data);
                    let _ = notifier.send(session_notification(
                        &session_id,
                        json!({
                            "sessionUpdate": "terminal_output",
                            "terminalId": terminal_id,
                            "data": data,
                        }),
                    ));
                }
            }));
        }

        let child = Arc::new(Mutex::new(Some(child)));

        // Waiter: reap the child after both streams close, then announce
        // the exit code.
        {
            let child = child.clone();
            let notifier = notifier.clone();
            let session_id = session_id.to_string();
            let terminal_id = terminal_id.clone();
            tokio::spawn(async move {
                for reader in readers {
                    let _ = reader.await;
                }
                let code = match child.lock().await.as_mut() {
                    Some(child) => child
                        .wait()
                        .await
                        .ok()
                        .and_then(|status| status.code())
                        .unwrap_or(-1),
                    None => -1,
                };
                let _ = exit_tx.send(Some(code));
                let _ = notifier.send(session_notification(
                    &session_id,
                    json!({
                        "sessionUpdate": "terminal_exited",
                        "terminalId": terminal_id,
                        "exitCode": code,
                    }),
                ));
            });
        }

        self.terminals.lock().await.insert(
            terminal_id.clone(),
            Terminal {
                child,
                output,
                exit_rx,
                command: params.command,
            },
        );

        Ok(terminal_id)
    }

    /// Accumulated combined output so far, plus the exit code if exited.
    pub async fn output(&self, terminal_id: &str) -> Result<Value, BrokerError> {
        let terminals = self.terminals.lock().await;
        let terminal = terminals
            .get(terminal_id)
            .ok_or_else(|| BrokerError::TerminalNotFound(terminal_id.to_string()))?;
        let output = terminal.output.lock().await.clone();
        let exit_code = *terminal.exit_rx.borrow();
        let mut result = json!({ "output": output, "truncated": false });
        if let Some(code) = exit_code {
            result["exitStatus"] = json!({ "exitCode": code });
        }
        Ok(result)
    }

    /// Block until the terminal's process exits.
    pub async fn wait_for_exit(&self, terminal_id: &str) -> Result<i32, BrokerError> {
        let mut exit_rx = {
            let terminals = self.terminals.lock().await;
            terminals
                .get(terminal_id)
                .ok_or_else(|| BrokerError::TerminalNotFound(terminal_id.to_string()))?
                .exit_rx
                .clone()
        };

        loop {
            if let Some(code) = *exit_rx.borrow() {
                return Ok(code);
            }
            if exit_rx.changed().await.is_err() {
                return Ok(-1);
            }
        }
    }

    /// Terminate the terminal's process (SIGTERM on unix).
    pub async fn kill(&self, terminal_id: &str) -> Result<(), BrokerError> {
        let terminals = self.terminals.lock().await;
        let terminal = terminals
            .get(terminal_id)
            .ok_or_else(|| BrokerError::TerminalNotFound(terminal_id.to_string()))?;

        let mut guard = terminal.child.lock().await;
        if let Some(child) = guard.as_mut() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                return Ok(());
            }
            let _ = child.start_kill();
        }
        Ok(())
    }

    /// Drop the handle. The process is killed if still running.
    pub async fn release(&self, terminal_id: &str) -> Result<(), BrokerError> {
        let removed = self.terminals.lock().await.remove(terminal_id);
        if let Some(terminal) = removed {
            let mut guard = terminal.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
            tracing::debug!("[terminal] released {} ({})", terminal_id, terminal.command);
        }
        Ok(())
    }

    /// Kill and drop every terminal (process shutdown path).
    pub async fn release_all(&self) {
        let ids: Vec<String> = self.terminals.lock().await.keys().cloned().collect();
        for id in ids {
            let _ = self.release(&id).await;
        }
    }
}

impl Default for TerminalManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::events::types::{split_notification, update_kind, EventKind};

    fn params(command: &str, args: &[&str]) -> TerminalCreateParams {
        TerminalCreateParams {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: None,
            rows: None,
            cols: None,
        }
    }

    #[tokio::test]
    async fn create_streams_output_and_exits() {
        let manager = TerminalManager::new();
        let (tx, mut rx) = broadcast::channel(64);

        let id = manager
            .create(params("sh", &["-c", "echo hello-term"]), "s1", tx)
            .await
            .unwrap();

        let code = manager.wait_for_exit(&id).await.unwrap();
        assert_eq!(code, 0);

        let output = manager.output(&id).await.unwrap();
        assert!(output["output"].as_str().unwrap().contains("hello-term"));
        assert_eq!(output["exitStatus"]["exitCode"], 0);

        // created → ≥1 output → exited, all tagged with the terminal id
        let mut kinds = Vec::new();
        while let Ok(n) = rx.try_recv() {
            let (sid, update) = split_notification(&n).unwrap();
            assert_eq!(sid, "s1");
            assert_eq!(update["terminalId"], serde_json::json!(id));
            kinds.push(update_kind(update).unwrap());
        }
        assert_eq!(kinds.first(), Some(&EventKind::TerminalCreated));
        assert!(kinds.contains(&EventKind::TerminalOutput));
        assert_eq!(kinds.last(), Some(&EventKind::TerminalExited));
    }

    #[tokio::test]
    async fn kill_terminates_long_running_process() {
        let manager = TerminalManager::new();
        let (tx, _rx) = broadcast::channel(64);

        let id = manager
            .create(params("sleep", &["30"]), "s1", tx)
            .await
            .unwrap();
        manager.kill(&id).await.unwrap();

        let code = manager.wait_for_exit(&id).await.unwrap();
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn unknown_terminal_is_an_error() {
        let manager = TerminalManager::new();
        assert!(manager.output("nope").await.is_err());
        assert!(manager.wait_for_exit("nope").await.is_err());
    }
}
