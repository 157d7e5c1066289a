//! Claude Code adapter — stream-json to canonical events.
//!
//! Claude Code does not speak ACP. It is spawned with
//! `-p --output-format stream-json --input-format stream-json
//! --include-partial-messages --verbose` and emits NDJSON with its own
//! message types (`system`, `assistant`, `user`, `result`, `stream_event`).
//! This adapter translates them into canonical `session/update`
//! notifications so the rest of the broker never sees the dialect.
//!
//! Translation is stateful within a turn: which content block is open,
//! which tool is streaming input (and its accumulated partial JSON),
//! accumulated reasoning text and signature. All state resets at `result`.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex};

use super::partial_json::repair_partial_json;
use crate::error::BrokerError;
use crate::events::types::{process_output, session_notification};

// ─── Wire types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
    signature: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    index: Option<i64>,
    content_block: Option<StreamContentBlock>,
    delta: Option<StreamDelta>,
    usage: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
    tool_use_id: Option<String>,
    content: Option<Value>,
    is_error: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct Message {
    #[allow(dead_code)]
    role: Option<String>,
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct OutputMessage {
    #[serde(rename = "type")]
    msg_type: String,
    subtype: Option<String>,
    session_id: Option<String>,
    message: Option<Message>,
    event: Option<StreamEvent>,
    result: Option<String>,
    is_error: Option<bool>,
    usage: Option<Value>,
}

// ─── Config ─────────────────────────────────────────────────────────────

/// Spawning parameters for the Claude CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    pub command: String,
    pub cwd: String,
    pub display_name: String,
    /// "acceptEdits" | "bypassPermissions" (default)
    pub permission_mode: Option<String>,
    /// Inline MCP config JSON strings, one `--mcp-config` each.
    pub mcp_configs: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            cwd: ".".to_string(),
            display_name: "Claude Code".to_string(),
            permission_mode: Some("bypassPermissions".to_string()),
            mcp_configs: Vec::new(),
            env: HashMap::new(),
        }
    }
}

// ─── Turn state ─────────────────────────────────────────────────────────

#[derive(Default)]
struct TurnState {
    in_thinking: bool,
    in_text: bool,
    /// The tool block currently streaming input.
    current_tool: Option<StreamingTool>,
    /// tool_use id → tool name, for matching tool_result messages.
    tool_names: HashMap<String, String>,
    /// Tool calls already rendered as `tool_call`.
    rendered_tools: HashSet<String>,
    reasoning_text: String,
    signature: String,
    has_streamed_text: bool,
    last_stop_reason: Option<String>,
    usage: Option<Value>,
}

struct StreamingTool {
    id: String,
    name: String,
    partial_json: String,
}

impl TurnState {
    fn reset(&mut self) {
        *self = TurnState::default();
    }
}

/// What `prompt` resolves to when the turn finishes.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub stop_reason: String,
    pub usage: Option<Value>,
    /// The final result text, for clients without a live event stream.
    pub result_text: Option<String>,
}

// ─── Process ────────────────────────────────────────────────────────────

/// A supervised Claude Code child process.
pub struct ClaudeCodeProcess {
    config: ClaudeCodeConfig,
    our_session_id: String,
    claude_session_id: Arc<Mutex<Option<String>>>,
    alive: Arc<AtomicBool>,
    notification_tx: broadcast::Sender<Value>,
    state: Arc<Mutex<TurnState>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    child: Arc<Mutex<Option<Child>>>,
    pid: Option<u32>,
    prompt_complete: Arc<Mutex<Option<oneshot::Sender<PromptOutcome>>>>,
    exited_rx: tokio::sync::watch::Receiver<bool>,
}

impl ClaudeCodeProcess {
    /// Spawn the CLI and start the stdout translator.
    pub async fn spawn(
        config: ClaudeCodeConfig,
        notification_tx: broadcast::Sender<Value>,
        our_session_id: &str,
    ) -> Result<Self, BrokerError> {
        let mut cmd = Command::new(&config.command);
        cmd.arg("-p");
        cmd.args(["--output-format", "stream-json"]);
        cmd.args(["--input-format", "stream-json"]);
        cmd.arg("--include-partial-messages");
        cmd.arg("--verbose");

        let permission_mode = config
            .permission_mode
            .as_deref()
            .unwrap_or("bypassPermissions");
        if permission_mode == "bypassPermissions" {
            cmd.arg("--dangerously-skip-permissions");
        } else {
            cmd.args(["--permission-mode", permission_mode]);
        }

        // Interactive questions cannot be answered in a headless broker.
        cmd.args(["--disallowed-tools", "AskUserQuestion"]);

        for mcp_config in &config.mcp_configs {
            cmd.args(["--mcp-config", mcp_config]);
        }

        cmd.current_dir(&config.cwd);
        cmd.envs(&config.env);
        cmd.env("PATH", crate::shell_env::full_path());
        if crate::adapters::api::is_serverless() && std::env::var("CLAUDE_CONFIG_DIR").is_err() {
            // The CLI wants a writable config dir; serverless roots are
            // read-only outside /tmp.
            cmd.env("CLAUDE_CONFIG_DIR", "/tmp/.claude");
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::info!(
            "[claude:{}] spawning: {} -p --output-format stream-json ... (cwd: {})",
            config.display_name,
            config.command,
            config.cwd
        );

        let mut child = cmd.spawn().map_err(|e| BrokerError::Spawn {
            command: config.command.clone(),
            message: format!("{e}. Is the Claude CLI installed?"),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| BrokerError::Spawn {
            command: config.command.clone(),
            message: "no stdin on child process".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BrokerError::Spawn {
            command: config.command.clone(),
            message: "no stdout on child process".into(),
        })?;
        let stderr = child.stderr.take();

        let (exited_tx, exited_rx) = tokio::sync::watch::channel(false);
        let process = Self {
            our_session_id: our_session_id.to_string(),
            claude_session_id: Arc::new(Mutex::new(None)),
            alive: Arc::new(AtomicBool::new(true)),
            notification_tx,
            state: Arc::new(Mutex::new(TurnState::default())),
            stdin: Arc::new(Mutex::new(Some(stdin))),
            child: Arc::new(Mutex::new(Some(child))),
            pid,
            prompt_complete: Arc::new(Mutex::new(None)),
            exited_rx,
            config,
        };

        // Stderr → log + process_output.
        if let Some(stderr) = stderr {
            let name = process.config.display_name.clone();
            let ntx = process.notification_tx.clone();
            let sid = process.our_session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::debug!("[claude:{} stderr] {}", name, line);
                    let _ = ntx.send(session_notification(
                        &sid,
                        process_output("stderr", &format!("{line}\n"), &name),
                    ));
                }
            });
        }

        // Stdout translator.
        {
            let alive = process.alive.clone();
            let ntx = process.notification_tx.clone();
            let state = process.state.clone();
            let claude_sid = process.claude_session_id.clone();
            let prompt_complete = process.prompt_complete.clone();
            let our_sid = process.our_session_id.clone();
            let name = process.config.display_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = strip_ansi(line.trim());
                    if !line.starts_with('{') {
                        continue;
                    }
                    match serde_json::from_str::<OutputMessage>(&line) {
                        Ok(msg) => {
                            translate_message(
                                msg,
                                &our_sid,
                                &claude_sid,
                                &ntx,
                                &state,
                                &prompt_complete,
                            )
                            .await;
                        }
                        Err(e) => {
                            tracing::debug!(
                                "[claude:{}] unparseable line: {} ({})",
                                name,
                                &line[..line.len().min(120)],
                                e
                            );
                        }
                    }
                }

                alive.store(false, Ordering::SeqCst);
                // Unresolved prompt at EOF means the CLI died mid-turn.
                if let Some(tx) = prompt_complete.lock().await.take() {
                    let _ = tx.send(PromptOutcome {
                        stop_reason: "error".into(),
                        usage: None,
                        result_text: None,
                    });
                    let _ = ntx.send(session_notification(
                        &our_sid,
                        json!({ "sessionUpdate": "turn_complete", "stopReason": "error" }),
                    ));
                }
                let _ = exited_tx.send(true);
                tracing::info!("[claude:{}] stdout translator exited", name);
            });
        }

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        if !process.is_alive() {
            return Err(BrokerError::Spawn {
                command: process.config.command.clone(),
                message: "Claude Code exited during startup".into(),
            });
        }

        tracing::info!("[claude:{}] started (pid {:?})", process.config.display_name, pid);
        Ok(process)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// The CLI-assigned session id, once the first turn has started.
    pub async fn claude_session_id(&self) -> Option<String> {
        self.claude_session_id.lock().await.clone()
    }

    /// Resolves to `true` when the CLI has exited.
    pub fn exited(&self) -> tokio::sync::watch::Receiver<bool> {
        self.exited_rx.clone()
    }

    /// One prompt turn. Streams canonical events; resolves with the stop
    /// reason and usage when Claude's `result` message arrives.
    pub async fn prompt(&self, text: &str) -> Result<PromptOutcome, BrokerError> {
        if !self.is_alive() {
            return Err(BrokerError::ProcessExited(self.config.display_name.clone()));
        }

        self.state.lock().await.reset();

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.prompt_complete.lock().await;
            if slot.is_some() {
                return Err(BrokerError::PromptInFlight(self.our_session_id.clone()));
            }
            *slot = Some(tx);
        }

        let session_id = self.claude_session_id.lock().await.clone();
        let user_input = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": text }],
            },
            "session_id": session_id,
        });

        {
            let mut guard = self.stdin.lock().await;
            let stdin = guard
                .as_mut()
                .ok_or_else(|| BrokerError::ProcessExited(self.config.display_name.clone()))?;
            stdin.write_all(format!("{user_input}\n").as_bytes()).await?;
            stdin.flush().await?;
        }

        rx.await
            .map_err(|_| BrokerError::ProcessExited(self.config.display_name.clone()))
    }

    /// Cancel the current turn: SIGINT the CLI and resolve the prompt with
    /// `cancelled`.
    pub async fn cancel(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
        }

        if let Some(tx) = self.prompt_complete.lock().await.take() {
            let _ = tx.send(PromptOutcome {
                stop_reason: "cancelled".into(),
                usage: None,
                result_text: None,
            });
            let _ = self.notification_tx.send(session_notification(
                &self.our_session_id,
                json!({ "sessionUpdate": "turn_complete", "stopReason": "cancelled" }),
            ));
        }
    }

    /// SIGTERM, 5 s grace, SIGKILL.
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            #[cfg(unix)]
            let terminated = {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if let Some(pid) = self.pid {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
                        .await
                        .is_ok()
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
    }
}

// ─── Translation ────────────────────────────────────────────────────────

async fn translate_message(
    msg: OutputMessage,
    our_sid: &str,
    claude_sid: &Arc<Mutex<Option<String>>>,
    ntx: &broadcast::Sender<Value>,
    state: &Arc<Mutex<TurnState>>,
    prompt_complete: &Arc<Mutex<Option<oneshot::Sender<PromptOutcome>>>>,
) {
    match msg.msg_type.as_str() {
        "system" => {
            if msg.subtype.as_deref() == Some("init") {
                if let Some(sid) = msg.session_id {
                    *claude_sid.lock().await = Some(sid);
                }
            }
        }

        "stream_event" => {
            if let Some(event) = msg.event {
                translate_stream_event(event, our_sid, ntx, state).await;
            }
        }

        "assistant" => {
            let Some(message) = msg.message else { return };
            let mut state = state.lock().await;
            for item in message.content {
                if item.content_type != "tool_use" {
                    continue;
                }
                let tool_id = item.id.clone().unwrap_or_default();
                let tool_name = item.name.clone().unwrap_or_else(|| "unknown".into());
                state.tool_names.insert(tool_id.clone(), tool_name.clone());

                if state.rendered_tools.insert(tool_id.clone()) {
                    let input = item.input.clone().unwrap_or(json!({}));
                    emit(ntx, our_sid, json!({
                        "sessionUpdate": "tool_call",
                        "toolCallId": tool_id,
                        "title": tool_title(&tool_name, &input),
                        "status": "running",
                        "kind": map_tool_kind(&tool_name),
                        "rawInput": input,
                    }));
                }
            }
        }

        "user" => {
            let Some(message) = msg.message else { return };
            let state = state.lock().await;
            for item in message.content {
                if item.content_type != "tool_result" {
                    continue;
                }
                let tool_id = item.tool_use_id.clone().unwrap_or_default();
                let tool_name = state
                    .tool_names
                    .get(&tool_id)
                    .cloned()
                    .unwrap_or_else(|| "unknown".into());
                let kind = map_tool_kind(&tool_name);
                let is_error = item.is_error.unwrap_or(false);
                let output = tool_result_text(&item);

                let mut update = json!({
                    "sessionUpdate": "tool_call_update",
                    "toolCallId": tool_id,
                    "title": tool_name,
                    "status": if is_error { "failed" } else { "completed" },
                    "kind": kind,
                    "rawOutput": output,
                });

                // A successful delegation keeps running as a subtask; the
                // real completion arrives later as task_completion.
                if kind == "task" && !is_error {
                    if let Some(task_id) = extract_task_id(&output) {
                        update["status"] = json!("delegated");
                        update["delegatedTaskId"] = json!(task_id);
                    }
                }

                emit(ntx, our_sid, update);
            }
        }

        "result" => {
            let mut state = state.lock().await;
            let is_error = msg.is_error.unwrap_or(false);
            let stop_reason = if is_error {
                "error".to_string()
            } else {
                state
                    .last_stop_reason
                    .clone()
                    .unwrap_or_else(|| "end_turn".to_string())
            };
            let usage = msg.usage.clone().or_else(|| state.usage.clone());
            let result_text = msg.result.clone();

            // Non-streaming runs put the only copy of the reply here.
            if let Some(text) = result_text.as_deref() {
                if !text.is_empty() && !state.has_streamed_text {
                    emit(ntx, our_sid, json!({
                        "sessionUpdate": "agent_message_chunk",
                        "content": { "type": "text", "text": text },
                    }));
                }
            }

            let mut turn = json!({
                "sessionUpdate": "turn_complete",
                "stopReason": stop_reason,
            });
            if let Some(usage) = usage_tokens(usage.as_ref()) {
                turn["usage"] = usage;
            }
            if !state.reasoning_text.is_empty() {
                turn["reasoningText"] = json!(state.reasoning_text.clone());
            }
            emit(ntx, our_sid, turn);

            if let Some(tx) = prompt_complete.lock().await.take() {
                let _ = tx.send(PromptOutcome {
                    stop_reason,
                    usage: usage_tokens(usage.as_ref()),
                    result_text,
                });
            }

            state.reset();
        }

        _ => {}
    }
}

async fn translate_stream_event(
    event: StreamEvent,
    our_sid: &str,
    ntx: &broadcast::Sender<Value>,
    state: &Arc<Mutex<TurnState>>,
) {
    let mut state = state.lock().await;
    match event.event_type.as_str() {
        "content_block_start" => {
            let Some(block) = event.content_block else { return };
            match block.block_type.as_str() {
                "thinking" => {
                    state.in_thinking = true;
                    emit(ntx, our_sid, json!({
                        "sessionUpdate": "thinking_start",
                        "blockIndex": event.index,
                    }));
                }
                "text" => state.in_text = true,
                "tool_use" => {
                    if let (Some(id), Some(name)) = (block.id, block.name) {
                        state.tool_names.insert(id.clone(), name.clone());
                        emit(ntx, our_sid, json!({
                            "sessionUpdate": "tool_call_start",
                            "toolCallId": id,
                            "toolName": name,
                            "kind": map_tool_kind(&name),
                            "status": "streaming",
                        }));
                        state.current_tool = Some(StreamingTool {
                            id,
                            name,
                            partial_json: String::new(),
                        });
                    }
                }
                _ => {}
            }
        }

        "content_block_delta" => {
            let Some(delta) = event.delta else { return };
            match delta.delta_type.as_str() {
                "text_delta" => {
                    if let Some(text) = delta.text {
                        state.has_streamed_text = true;
                        state.in_thinking = false;
                        emit(ntx, our_sid, json!({
                            "sessionUpdate": "agent_message_chunk",
                            "content": { "type": "text", "text": text },
                        }));
                    }
                }
                "thinking_delta" => {
                    if let Some(thinking) = delta.thinking {
                        state.reasoning_text.push_str(&thinking);
                        emit(ntx, our_sid, json!({
                            "sessionUpdate": "agent_thought_chunk",
                            "content": { "type": "text", "text": thinking },
                        }));
                    }
                }
                "signature_delta" => {
                    if let Some(signature) = delta.signature {
                        state.signature.push_str(&signature);
                    }
                }
                "input_json_delta" => {
                    if let Some(fragment) = delta.partial_json {
                        if let Some(tool) = state.current_tool.as_mut() {
                            tool.partial_json.push_str(&fragment);
                            let accumulated = tool.partial_json.clone();
                            let id = tool.id.clone();
                            let name = tool.name.clone();
                            let parsed = repair_partial_json(&accumulated);
                            let mut update = json!({
                                "sessionUpdate": "tool_call_params_delta",
                                "toolCallId": id,
                                "partialJson": fragment,
                                "accumulatedJson": accumulated,
                            });
                            if let Some(parsed) = parsed {
                                update["title"] = json!(tool_title(&name, &parsed));
                                update["parsedInput"] = parsed;
                            }
                            emit(ntx, our_sid, update);
                        }
                    }
                }
                _ => {}
            }
        }

        "content_block_stop" => {
            if state.in_thinking {
                state.in_thinking = false;
                emit(ntx, our_sid, json!({
                    "sessionUpdate": "thinking_stop",
                    "blockIndex": event.index,
                }));
                if !state.signature.is_empty() {
                    let signature = std::mem::take(&mut state.signature);
                    emit(ntx, our_sid, json!({
                        "sessionUpdate": "thinking_signature",
                        "signature": signature,
                    }));
                }
            }
            state.in_text = false;
            state.current_tool = None;
        }

        "message_delta" => {
            if let Some(delta) = event.delta {
                if let Some(stop_reason) = delta.stop_reason {
                    state.last_stop_reason = Some(stop_reason);
                }
            }
            if let Some(usage) = event.usage {
                state.usage = Some(usage);
            }
        }

        _ => {}
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn emit(ntx: &broadcast::Sender<Value>, session_id: &str, update: Value) {
    let _ = ntx.send(session_notification(session_id, update));
}

fn strip_ansi(text: &str) -> String {
    // Claude occasionally colors its NDJSON under --verbose.
    static ANSI: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ANSI.get_or_init(|| regex::Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());
    re.replace_all(text, "").into_owned()
}

/// Map Claude tool names onto canonical kinds. MCP tools
/// (`mcp__server__name`) unwrap to their bare name.
pub fn map_tool_kind(tool_name: &str) -> String {
    if let Some(rest) = tool_name.strip_prefix("mcp__") {
        if let Some(pos) = rest.find("__") {
            let bare = &rest[pos + 2..];
            if bare == "delegate_task_to_agent" {
                return "task".to_string();
            }
            return bare.to_string();
        }
    }

    match tool_name {
        "Bash" => "shell",
        "Read" | "LS" => "read-file",
        "Write" => "write-file",
        "Edit" | "MultiEdit" => "edit-file",
        "Glob" => "glob",
        "Grep" => "grep",
        "WebSearch" => "web-search",
        "WebFetch" => "web-fetch",
        "Task" => "task",
        other => return other.to_string(),
    }
    .to_string()
}

fn tool_title(tool_name: &str, params: &Value) -> String {
    let display = if let Some(rest) = tool_name.strip_prefix("mcp__") {
        rest.find("__")
            .map(|pos| rest[pos + 2..].to_string())
            .unwrap_or_else(|| tool_name.to_string())
    } else {
        tool_name.to_string()
    };

    match display.as_str() {
        "Read" | "Write" | "Edit" | "MultiEdit" => {
            let path = params
                .get("file_path")
                .or_else(|| params.get("path"))
                .and_then(Value::as_str)
                .unwrap_or("");
            format!("{display}: {path}")
        }
        "Bash" => {
            let cmd = params.get("command").and_then(Value::as_str).unwrap_or("");
            let truncated: String = cmd.chars().take(80).collect();
            format!("Bash: {truncated}")
        }
        "Task" => {
            let desc = params
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            if desc.is_empty() {
                "Task".to_string()
            } else {
                format!("Task: {desc}")
            }
        }
        _ => display,
    }
}

fn tool_result_text(item: &ContentItem) -> String {
    match &item.content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(v) => v.to_string(),
        None => item.text.clone().unwrap_or_default(),
    }
}

/// Find a `taskId` in a delegation tool's result, which may be structured
/// or a JSON string.
fn extract_task_id(output: &str) -> Option<String> {
    let value: Value = serde_json::from_str(output).ok()?;
    value
        .get("taskId")
        .or_else(|| value.get("task_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn usage_tokens(usage: Option<&Value>) -> Option<Value> {
    let usage = usage?;
    let input = usage.get("input_tokens").and_then(Value::as_u64);
    let output = usage.get("output_tokens").and_then(Value::as_u64);
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(json!({ "inputTokens": input, "outputTokens": output }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{split_notification, update_kind, EventKind};

    struct Harness {
        ntx: broadcast::Sender<Value>,
        rx: broadcast::Receiver<Value>,
        state: Arc<Mutex<TurnState>>,
        claude_sid: Arc<Mutex<Option<String>>>,
        prompt_complete: Arc<Mutex<Option<oneshot::Sender<PromptOutcome>>>>,
    }

    impl Harness {
        fn new() -> Self {
            let (ntx, rx) = broadcast::channel(256);
            Self {
                ntx,
                rx,
                state: Arc::new(Mutex::new(TurnState::default())),
                claude_sid: Arc::new(Mutex::new(None)),
                prompt_complete: Arc::new(Mutex::new(None)),
            }
        }

        async fn feed(&self, line: &str) {
            let msg: OutputMessage = serde_json::from_str(line).unwrap();
            translate_message(
                msg,
                "s1",
                &self.claude_sid,
                &self.ntx,
                &self.state,
                &self.prompt_complete,
            )
            .await;
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut updates = Vec::new();
            while let Ok(n) = self.rx.try_recv() {
                let (_, update) = split_notification(&n).map(|(s, u)| (s.to_string(), u.clone())).unwrap();
                updates.push(update);
            }
            updates
        }
    }

    #[tokio::test]
    async fn init_captures_session_id() {
        let h = Harness::new();
        h.feed(r#"{"type":"system","subtype":"init","session_id":"c-123"}"#).await;
        assert_eq!(h.claude_sid.lock().await.as_deref(), Some("c-123"));
    }

    #[tokio::test]
    async fn text_deltas_become_message_chunks() {
        let mut h = Harness::new();
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text"}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hel"}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}}"#).await;

        let updates = h.drain();
        assert_eq!(updates.len(), 2);
        assert!(updates
            .iter()
            .all(|u| update_kind(u) == Some(EventKind::AgentMessageChunk)));
        let text: String = updates
            .iter()
            .map(|u| u["content"]["text"].as_str().unwrap())
            .collect();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn thinking_emits_start_chunks_stop_and_signature() {
        let mut h = Harness::new();
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig=="}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_stop","index":0}}"#).await;

        let kinds: Vec<_> = h.drain().iter().map(|u| update_kind(u).unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ThinkingStart,
                EventKind::AgentThoughtChunk,
                EventKind::ThinkingStop,
                EventKind::ThinkingSignature,
            ]
        );
    }

    #[tokio::test]
    async fn tool_use_streams_params_then_finalizes() {
        let mut h = Harness::new();
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"Read"}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"file_path\":\"READ"}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"ME.md\"}"}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_stop","index":1}}"#).await;
        h.feed(r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"README.md"}}]}}"#).await;
        h.feed(r##"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"# Readme"}]}}"##).await;

        let updates = h.drain();
        let kinds: Vec<_> = updates.iter().map(|u| update_kind(u).unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ToolCallStart,
                EventKind::ToolCallParamsDelta,
                EventKind::ToolCallParamsDelta,
                EventKind::ToolCall,
                EventKind::ToolCallUpdate,
            ]
        );

        assert_eq!(updates[0]["toolName"], "Read");
        assert_eq!(updates[0]["kind"], "read-file");
        assert_eq!(updates[0]["status"], "streaming");

        // Partial input is previewable before it is complete.
        assert_eq!(updates[1]["parsedInput"]["file_path"], "READ");
        assert_eq!(updates[2]["parsedInput"]["file_path"], "README.md");

        assert_eq!(updates[3]["status"], "running");
        assert_eq!(updates[3]["rawInput"]["file_path"], "README.md");
        assert_eq!(updates[3]["title"], "Read: README.md");

        assert_eq!(updates[4]["status"], "completed");
        assert_eq!(updates[4]["rawOutput"], "# Readme");
    }

    #[tokio::test]
    async fn failed_tool_result_maps_to_failed() {
        let mut h = Harness::new();
        h.feed(r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t2","name":"Bash","input":{"command":"false"}}]}}"#).await;
        h.feed(r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t2","content":"exit 1","is_error":true}]}}"#).await;

        let updates = h.drain();
        assert_eq!(updates[1]["status"], "failed");
        assert_eq!(updates[1]["kind"], "shell");
    }

    #[tokio::test]
    async fn delegation_tool_goes_delegated_with_task_id() {
        let mut h = Harness::new();
        h.feed(r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t3","name":"mcp__routa__delegate_task_to_agent","input":{"task":"x"}}]}}"#).await;
        h.feed(r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t3","content":"{\"taskId\":\"task-9\"}"}]}}"#).await;

        let updates = h.drain();
        assert_eq!(updates[1]["status"], "delegated");
        assert_eq!(updates[1]["delegatedTaskId"], "task-9");
    }

    #[tokio::test]
    async fn result_completes_turn_with_usage_and_stop_reason() {
        let mut h = Harness::new();
        let (tx, rx) = oneshot::channel();
        *h.prompt_complete.lock().await = Some(tx);

        h.feed(r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"done"}}}"#).await;
        h.feed(r#"{"type":"stream_event","event":{"type":"message_delta","delta":{"type":"message_delta","stop_reason":"end_turn"},"usage":{"input_tokens":10,"output_tokens":3}}}"#).await;
        h.feed(r#"{"type":"result","subtype":"success","result":"done","is_error":false}"#).await;

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.stop_reason, "end_turn");
        assert_eq!(outcome.usage.as_ref().unwrap()["inputTokens"], 10);

        let updates = h.drain();
        let last = updates.last().unwrap();
        assert_eq!(update_kind(last), Some(EventKind::TurnComplete));
        assert_eq!(last["usage"]["outputTokens"], 3);
        // The reply already streamed, so result text is not re-emitted.
        assert_eq!(
            updates
                .iter()
                .filter(|u| update_kind(u) == Some(EventKind::AgentMessageChunk))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn unstreamed_result_text_is_emitted_once() {
        let mut h = Harness::new();
        h.feed(r#"{"type":"result","subtype":"success","result":"only here","is_error":false}"#).await;

        let updates = h.drain();
        assert_eq!(update_kind(&updates[0]), Some(EventKind::AgentMessageChunk));
        assert_eq!(updates[0]["content"]["text"], "only here");
        assert_eq!(update_kind(updates.last().unwrap()), Some(EventKind::TurnComplete));
    }

    #[test]
    fn tool_kind_mapping() {
        assert_eq!(map_tool_kind("Bash"), "shell");
        assert_eq!(map_tool_kind("Edit"), "edit-file");
        assert_eq!(map_tool_kind("Glob"), "glob");
        assert_eq!(map_tool_kind("mcp__server__list_notes"), "list_notes");
        assert_eq!(map_tool_kind("mcp__routa__delegate_task_to_agent"), "task");
        assert_eq!(map_tool_kind("SomethingNew"), "SomethingNew");
    }

    #[test]
    fn ansi_stripping() {
        assert_eq!(strip_ansi("\u{1b}[32m{\"a\":1}\u{1b}[0m"), "{\"a\":1}");
        assert_eq!(strip_ansi("plain"), "plain");
    }
}
