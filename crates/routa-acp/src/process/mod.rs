//! AgentProcess — one ACP agent child process with JSON-RPC over stdio.
//!
//! Lifecycle:
//!   1. `spawn(config, ...)`   — start the child, launch the stdout reader
//!   2. `initialize()`         — protocol handshake, capabilities cached
//!   3. `new_session(cwd)`     — returns the agent-side session id
//!   4. `prompt(sid, text)`    — one turn; content streams as notifications
//!   5. `kill()`               — SIGTERM, 5 s grace, SIGKILL
//!
//! The stdout reader owns all routing: responses resolve pending request
//! channels, agent→host requests are answered through `HostServices`, and
//! pure notifications are forwarded (with the session id rewritten to ours)
//! into the session's broadcast channel.

pub mod framing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{broadcast, oneshot, watch, Mutex};

use crate::error::{looks_like_auth_error, AgentInfo, AuthMethod, BrokerError};
use crate::events::types::{process_output, session_notification, turn_complete};
use crate::host::HostServices;
use crate::registry::{AgentProcessConfig, DistributionType};

/// Broadcast channel type for `session/update` notifications.
pub type NotificationSender = broadcast::Sender<Value>;

// ─── Timeouts ───────────────────────────────────────────────────────────

/// `initialize` / `session/new` against a locally installed command.
const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
/// Same, for npx/uvx agents that may download their package on first run.
const HANDSHAKE_TIMEOUT_PACKAGE_MS: u64 = 120_000;
/// `session/prompt` — one full agent turn.
const PROMPT_TIMEOUT_MS: u64 = 300_000;
/// Everything else.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// SIGTERM → SIGKILL grace.
const KILL_GRACE: Duration = Duration::from_secs(5);

// ─── Initialize result ──────────────────────────────────────────────────

/// Cached result of the `initialize` handshake.
#[derive(Debug, Clone, Default)]
pub struct InitializeResult {
    pub raw: Value,
    pub auth_methods: Vec<AuthMethod>,
    pub agent_info: Option<AgentInfo>,
}

impl InitializeResult {
    fn from_raw(raw: Value) -> Self {
        let auth_methods = raw
            .get("authMethods")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let agent_info = raw
            .get("agentInfo")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        Self {
            raw,
            auth_methods,
            agent_info,
        }
    }
}

// ─── AgentProcess ───────────────────────────────────────────────────────

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, BrokerError>>>>>;

/// A supervised ACP agent child process.
pub struct AgentProcess {
    config: AgentProcessConfig,
    stdin: Arc<Mutex<ChildStdin>>,
    child: Arc<Mutex<Option<Child>>>,
    pid: Option<u32>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    notification_tx: NotificationSender,
    host: Arc<HostServices>,
    init_result: Mutex<Option<InitializeResult>>,
    exited_rx: watch::Receiver<bool>,
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl AgentProcess {
    /// Spawn the agent child and start the background readers.
    ///
    /// `our_session_id` replaces the agent's own session id in every
    /// forwarded notification so subscribers match on the broker's id.
    pub async fn spawn(
        config: AgentProcessConfig,
        notification_tx: NotificationSender,
        our_session_id: &str,
    ) -> Result<Self, BrokerError> {
        let display_name = config.display_name.clone();
        tracing::info!(
            "[process:{}] spawning: {:?} {} (cwd: {})",
            display_name,
            config.command,
            config.args.join(" "),
            config.cwd,
        );

        // GUI-launched hosts inherit a minimal PATH that misses user CLIs.
        let resolved = if config.command.is_absolute() {
            config.command.clone()
        } else {
            crate::shell_env::which(&config.command.to_string_lossy())
                .unwrap_or_else(|| config.command.clone())
        };

        let mut child = tokio::process::Command::new(&resolved)
            .args(&config.args)
            .current_dir(&config.cwd)
            .envs(&config.env)
            .env("PATH", crate::shell_env::full_path())
            .env("NODE_NO_READLINE", "1")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| BrokerError::Spawn {
                command: config.command.to_string_lossy().into_owned(),
                message: format!(
                    "{e} (resolved: {:?}). Is it installed and on PATH?",
                    resolved
                ),
            })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| BrokerError::Spawn {
            command: display_name.clone(),
            message: "no stdin on child process".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BrokerError::Spawn {
            command: display_name.clone(),
            message: "no stdout on child process".into(),
        })?;
        let stderr = child.stderr.take();

        let alive = Arc::new(AtomicBool::new(true));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let stdin = Arc::new(Mutex::new(stdin));
        let host = Arc::new(HostServices::new());
        let (exited_tx, exited_rx) = watch::channel(false);

        // Stderr: line-log and surface to the UI as process_output.
        if let Some(stderr) = stderr {
            let name = display_name.clone();
            let ntx = notification_tx.clone();
            let sid = our_session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::debug!("[process:{} stderr] {}", name, line);
                    let _ = ntx.send(session_notification(
                        &sid,
                        process_output("stderr", &format!("{line}\n"), &name),
                    ));
                }
            });
        }

        // Stdout reader: responses, agent→host requests, notifications.
        let reader_handle = {
            let alive = alive.clone();
            let pending = pending.clone();
            let stdin = stdin.clone();
            let ntx = notification_tx.clone();
            let host = host.clone();
            let name = display_name.clone();
            let our_sid = our_session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    for msg in framing::parse_json_objects(&line) {
                        dispatch_message(msg, &pending, &stdin, &ntx, &host, &name, &our_sid)
                            .await;
                    }
                }

                alive.store(false, Ordering::SeqCst);

                // Child is gone: fail whatever was in flight, and close the
                // turn on the stream if one was open.
                let mut map = pending.lock().await;
                let had_pending = !map.is_empty();
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(BrokerError::ProcessExited(name.clone())));
                }
                drop(map);
                if had_pending {
                    let _ = ntx.send(session_notification(&our_sid, turn_complete("error", None)));
                }

                let _ = exited_tx.send(true);
                tracing::info!("[process:{}] stdout reader finished", name);
            })
        };

        // Give the child a beat to fail fast (bad flags, missing deps).
        tokio::time::sleep(Duration::from_millis(500)).await;

        if pid.is_none() || !alive.load(Ordering::SeqCst) {
            return Err(BrokerError::Spawn {
                command: config.command.to_string_lossy().into_owned(),
                message: format!("{display_name} exited during startup"),
            });
        }

        tracing::info!("[process:{}] started (pid {:?})", display_name, pid);

        Ok(Self {
            config,
            stdin,
            child: Arc::new(Mutex::new(Some(child))),
            pid,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            notification_tx,
            host,
            init_result: Mutex::new(None),
            exited_rx,
            _reader_handle: reader_handle,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &AgentProcessConfig {
        &self.config
    }

    pub fn notification_sender(&self) -> &NotificationSender {
        &self.notification_tx
    }

    /// Resolves to `true` when the child has exited.
    pub fn exited(&self) -> watch::Receiver<bool> {
        self.exited_rx.clone()
    }

    /// Cached `initialize` result, when the handshake has completed.
    pub async fn init_result(&self) -> Option<InitializeResult> {
        self.init_result.lock().await.clone()
    }

    // ── Outbound requests ────────────────────────────────────────────────

    fn default_timeout(&self, method: &str) -> u64 {
        let is_package_run = matches!(
            self.config.preset.distribution_type,
            Some(DistributionType::Npx) | Some(DistributionType::Uvx)
        );
        match method {
            "initialize" | "session/new" if is_package_run => HANDSHAKE_TIMEOUT_PACKAGE_MS,
            "initialize" | "session/new" => HANDSHAKE_TIMEOUT_MS,
            "session/prompt" => PROMPT_TIMEOUT_MS,
            _ => DEFAULT_TIMEOUT_MS,
        }
    }

    /// Send a JSON-RPC request and await its response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, BrokerError> {
        if !self.is_alive() {
            return Err(BrokerError::ProcessExited(self.config.display_name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write_line(&msg).await?;

        let timeout_ms = timeout_ms.unwrap_or_else(|| self.default_timeout(method));
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::ProcessExited(self.config.display_name.clone())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BrokerError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Fire-and-forget notification to the child.
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), BrokerError> {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&msg).await
    }

    async fn write_line(&self, msg: &Value) -> Result<(), BrokerError> {
        let data = format!("{msg}\n");
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(data.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    // ── Protocol surface ─────────────────────────────────────────────────

    /// `initialize` handshake. Called once after spawn; the result is cached.
    pub async fn initialize(&self) -> Result<InitializeResult, BrokerError> {
        let raw = self
            .send_request(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientInfo": {
                        "name": "routa-acp",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
                None,
            )
            .await?;

        tracing::info!(
            "[process:{}] initialized: {}",
            self.config.display_name,
            raw
        );
        let result = InitializeResult::from_raw(raw);
        *self.init_result.lock().await = Some(result.clone());
        Ok(result)
    }

    /// `session/new`. Returns the agent-side session id.
    ///
    /// A JSON-RPC error whose message matches the auth pattern becomes
    /// `BrokerError::AuthRequired` carrying the cached auth methods; the
    /// process stays alive so a credentialed retry can reuse it.
    pub async fn new_session(
        &self,
        cwd: &str,
        mcp_servers: Vec<Value>,
    ) -> Result<String, BrokerError> {
        let result = self
            .send_request(
                "session/new",
                json!({ "cwd": cwd, "mcpServers": mcp_servers }),
                None,
            )
            .await;

        let result = match result {
            Err(BrokerError::Protocol { message, .. }) if looks_like_auth_error(&message) => {
                let cached = self.init_result.lock().await.clone().unwrap_or_default();
                return Err(BrokerError::AuthRequired {
                    message,
                    auth_methods: cached.auth_methods,
                    agent_info: cached.agent_info,
                });
            }
            other => other?,
        };

        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrokerError::Internal("no sessionId in session/new response".into())
            })?
            .to_string();

        tracing::info!(
            "[process:{}] agent session created: {}",
            self.config.display_name,
            session_id
        );
        Ok(session_id)
    }

    /// `session/set_mode`.
    pub async fn set_mode(&self, agent_session_id: &str, mode_id: &str) -> Result<(), BrokerError> {
        self.send_request(
            "session/set_mode",
            json!({ "sessionId": agent_session_id, "modeId": mode_id }),
            None,
        )
        .await
        .map(|_| ())
    }

    /// `session/prompt` — one turn. Returns the result (`{stopReason}`).
    pub async fn prompt(&self, agent_session_id: &str, text: &str) -> Result<Value, BrokerError> {
        self.send_request(
            "session/prompt",
            json!({
                "sessionId": agent_session_id,
                "prompt": [{ "type": "text", "text": text }],
            }),
            None,
        )
        .await
    }

    /// `session/cancel` — fire-and-forget.
    pub async fn cancel(&self, agent_session_id: &str) {
        let _ = self
            .send_notification("session/cancel", json!({ "sessionId": agent_session_id }))
            .await;
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// SIGTERM the child; escalate to SIGKILL after the grace period.
    /// All pending requests reject.
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            tracing::info!(
                "[process:{}] terminating (pid {:?})",
                self.config.display_name,
                self.pid
            );

            #[cfg(unix)]
            let terminated = {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if let Some(pid) = self.pid {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok()
                } else {
                    false
                }
            };
            #[cfg(not(unix))]
            let terminated = false;

            if !terminated {
                let _ = child.kill().await;
            }
        }

        let mut map = self.pending.lock().await;
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(BrokerError::ProcessExited(
                self.config.display_name.clone(),
            )));
        }
        drop(map);

        self.host.shutdown().await;
    }
}

// ─── Stdout dispatch ────────────────────────────────────────────────────

async fn dispatch_message(
    msg: Value,
    pending: &Pending,
    stdin: &Arc<Mutex<ChildStdin>>,
    ntx: &NotificationSender,
    host: &Arc<HostServices>,
    name: &str,
    our_sid: &str,
) {
    let has_id = msg.get("id").map(|id| !id.is_null()).unwrap_or(false);
    let has_result = msg.get("result").is_some();
    let has_error = msg.get("error").is_some();
    let method = msg.get("method").and_then(Value::as_str);

    if has_id && (has_result || has_error) {
        // Response to one of our requests.
        let id = msg["id"].as_u64().unwrap_or(0);
        let sender = pending.lock().await.remove(&id);
        if let Some(tx) = sender {
            let outcome = if has_error {
                Err(BrokerError::Protocol {
                    code: msg["error"]["code"].as_i64().unwrap_or(0),
                    message: msg["error"]["message"]
                        .as_str()
                        .unwrap_or("unknown error")
                        .to_string(),
                })
            } else {
                Ok(msg["result"].clone())
            };
            let _ = tx.send(outcome);
        } else {
            tracing::debug!("[process:{}] response for unknown id {}", name, id);
        }
        return;
    }

    if has_id {
        if let Some(method) = method {
            // Agent→host request: must get exactly one reply. Handled in
            // its own task — terminal/wait_for_exit can block for minutes
            // and must not stall the stdout reader.
            let id_val = msg["id"].clone();
            tracing::debug!("[process:{}] agent request: {} (id={})", name, method, id_val);
            let params = msg.get("params").cloned().unwrap_or(json!({}));
            let method = method.to_string();
            let host = host.clone();
            let ntx = ntx.clone();
            let stdin = stdin.clone();
            let our_sid = our_sid.to_string();
            tokio::spawn(async move {
                let reply = match host
                    .handle_request(&method, &params, &our_sid, ntx.clone())
                    .await
                {
                    Ok(result) => json!({ "jsonrpc": "2.0", "id": id_val, "result": result }),
                    Err((code, message)) => json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "error": { "code": code, "message": message },
                    }),
                };
                let data = format!("{reply}\n");
                let mut stdin = stdin.lock().await;
                let _ = stdin.write_all(data.as_bytes()).await;
                let _ = stdin.flush().await;
            });
        }
        return;
    }

    if method.is_some() {
        // Pure notification: rewrite the agent's session id to ours and
        // forward.
        let mut rewritten = msg;
        if let Some(params) = rewritten.get_mut("params") {
            if params.get("sessionId").is_some() {
                params["sessionId"] = Value::String(our_sid.to_string());
            }
        }
        let _ = ntx.send(rewritten);
        return;
    }

    tracing::debug!("[process:{}] unhandled message shape", name);
}
