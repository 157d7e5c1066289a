//! Session manager — session id ↔ agent connection.
//!
//! Owns every live `AgentHandle` exclusively. Creation is idempotent
//! within a 30 s window keyed on `(idempotencyKey, workspaceId)`: two
//! concurrent creates with the same key spawn one child and return the
//! same session. An auth-required failure keeps the freshly spawned
//! process in a 30 s grace stash so a credentialed retry reuses it
//! instead of paying the spawn again.
//!
//! One prompt at a time per session: overlapping prompts are rejected
//! here, before anything reaches the child.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};

use crate::adapters::{
    api, AgentHandle, ClaudeCodeConfig, ClaudeCodeProcess, DirectApiConfig, DirectApiSession,
    PromptResult,
};
use crate::error::BrokerError;
use crate::events::types::session_notification;
use crate::events::{split_notification, Normalizer, SessionEventBus};
use crate::mcp::{McpConfigWriter, McpInjection, McpMaterial};
use crate::process::AgentProcess;
use crate::registry::PresetCatalog;

/// Idempotent-create and auth-retry windows.
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(30);
const AUTH_GRACE: Duration = Duration::from_secs(30);

/// How long a cancelled child gets to wind down before the broker force-
/// resolves the turn.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

// ─── Records ────────────────────────────────────────────────────────────

/// Parameters for `create_session`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionParams {
    pub provider: Option<String>,
    pub cwd: Option<String>,
    pub workspace_id: Option<String>,
    pub mode_id: Option<String>,
    pub model_id: Option<String>,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

/// What a session looks like to the outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub agent_session_id: String,
    pub provider: String,
    pub cwd: String,
    pub workspace_id: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub created_at: String,
}

struct ManagedSession {
    handle: Arc<AgentHandle>,
    record: SessionRecord,
    agent_session_id: String,
    prompt_in_flight: Arc<AtomicBool>,
    force_cancel: Arc<Notify>,
}

struct IdempotencyEntry {
    /// Serializes concurrent creates sharing a key; holds the result.
    slot: Arc<Mutex<Option<(SessionRecord, Instant)>>>,
}

struct PendingAuthProcess {
    process: Arc<AgentProcess>,
    notification_tx: broadcast::Sender<Value>,
    session_id: String,
    stashed_at: Instant,
}

// ─── Manager ────────────────────────────────────────────────────────────

/// Process-wide owner of agent sessions.
pub struct SessionManager {
    catalog: Arc<PresetCatalog>,
    mcp_writer: McpConfigWriter,
    bus: Arc<SessionEventBus>,
    sessions: Arc<RwLock<HashMap<String, ManagedSession>>>,
    idempotency: Mutex<HashMap<String, IdempotencyEntry>>,
    /// (provider, cwd) → process awaiting credentials.
    pending_auth: Arc<Mutex<HashMap<(String, String), PendingAuthProcess>>>,
}

impl SessionManager {
    pub fn new(catalog: Arc<PresetCatalog>) -> Self {
        Self {
            catalog,
            mcp_writer: McpConfigWriter::new(),
            bus: Arc::new(SessionEventBus::new()),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idempotency: Mutex::new(HashMap::new()),
            pending_auth: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bus(&self) -> Arc<SessionEventBus> {
        self.bus.clone()
    }

    pub fn catalog(&self) -> Arc<PresetCatalog> {
        self.catalog.clone()
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn list_sessions(&self) -> Vec<SessionRecord> {
        self.sessions
            .read()
            .await
            .values()
            .map(|m| m.record.clone())
            .collect()
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|m| m.record.clone())
    }

    pub async fn is_alive(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|m| m.handle.is_alive())
            .unwrap_or(false)
    }

    /// Subscribe to a session's live event stream.
    pub async fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<Value>> {
        self.bus.subscribe(session_id).await
    }

    /// The ordered replay buffer for a session.
    pub async fn history(&self, session_id: &str) -> Vec<Value> {
        self.bus.history(session_id).await
    }

    // ── Create ───────────────────────────────────────────────────────────

    /// Create a session: resolve the preset, materialize MCP config, spawn
    /// (or reuse) the agent, handshake, and register.
    pub async fn create_session(
        &self,
        params: CreateSessionParams,
    ) -> Result<SessionRecord, BrokerError> {
        let workspace_id = params
            .workspace_id
            .clone()
            .unwrap_or_else(|| "default".to_string());

        // Idempotent create: a key holds one slot; whoever locks it first
        // does the work, everyone else reads the stored result.
        if let Some(key) = params.idempotency_key.clone() {
            let slot = {
                let mut map = self.idempotency.lock().await;
                map.entry(format!("{key}\u{1}{workspace_id}"))
                    .or_insert_with(|| IdempotencyEntry {
                        slot: Arc::new(Mutex::new(None)),
                    })
                    .slot
                    .clone()
            };

            let mut guard = slot.lock().await;
            if let Some((record, created)) = guard.as_ref() {
                if created.elapsed() < IDEMPOTENCY_WINDOW {
                    tracing::info!(
                        "[session] idempotent hit for key {} -> {}",
                        key,
                        record.session_id
                    );
                    return Ok(record.clone());
                }
            }
            let record = self.create_session_inner(params, workspace_id).await?;
            *guard = Some((record.clone(), Instant::now()));
            return Ok(record);
        }

        self.create_session_inner(params, workspace_id).await
    }

    async fn create_session_inner(
        &self,
        params: CreateSessionParams,
        workspace_id: String,
    ) -> Result<SessionRecord, BrokerError> {
        let provider = params
            .provider
            .clone()
            .unwrap_or_else(|| "opencode".to_string());
        let preset = self.catalog.get_preset(&provider).await?;
        let cwd = params.cwd.clone().unwrap_or_else(|| ".".to_string());

        let session_id = uuid::Uuid::new_v4().to_string();
        let notification_tx = self.bus.open(&session_id).await;
        self.spawn_normalizer_pump(&session_id, &provider, &cwd, &notification_tx);

        // MCP material: explicit env configuration, else none.
        let injection = match McpMaterial::from_env() {
            Some(material) => {
                self.mcp_writer
                    .ensure_for_provider(&preset.id, &material)
                    .await
            }
            None => McpInjection::default(),
        };

        let started: Result<(AgentHandle, String), BrokerError> = if preset.id == "claude"
            && api::is_serverless()
            && api::has_api_credentials()
        {
            // No child processes on a lambda: route through the API.
            DirectApiConfig::from_env().map(|config| {
                let session = Arc::new(DirectApiSession::new(
                    config,
                    notification_tx.clone(),
                    &session_id,
                ));
                let api_session_id = session.api_session_id().to_string();
                (AgentHandle::Api(session), api_session_id)
            })
        } else if preset.non_standard_dialect {
            let config = ClaudeCodeConfig {
                command: preset.effective_command(),
                cwd: cwd.clone(),
                display_name: preset.display_name.clone(),
                permission_mode: params.mode_id.clone(),
                mcp_configs: injection.mcp_configs.clone(),
                env: HashMap::new(),
            };
            ClaudeCodeProcess::spawn(config, notification_tx.clone(), &session_id)
                .await
                // Claude assigns its own id on the first turn; until then
                // the broker id stands in.
                .map(|process| (AgentHandle::Claude(Arc::new(process)), session_id.clone()))
        } else {
            self.start_acp_process(&preset.id, &cwd, &params, &injection, &notification_tx, &session_id)
                .await
                .map(|(process, agent_session_id)| (AgentHandle::Acp(process), agent_session_id))
        };

        let (handle, agent_session_id) = match started {
            Ok(pair) => pair,
            Err(e) => {
                // Don't leak the channel opened for a session that never
                // came up.
                self.bus.close(&session_id).await;
                return Err(e);
            }
        };

        let record = SessionRecord {
            session_id: session_id.clone(),
            agent_session_id: agent_session_id.clone(),
            provider: preset.id.clone(),
            cwd,
            workspace_id,
            role: "CRAFTER".to_string(),
            mode_id: params.mode_id.clone(),
            model_id: params.model_id.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let handle = Arc::new(handle);
        self.watch_exit(&session_id, &handle);

        self.sessions.write().await.insert(
            session_id.clone(),
            ManagedSession {
                handle,
                record: record.clone(),
                agent_session_id,
                prompt_in_flight: Arc::new(AtomicBool::new(false)),
                force_cancel: Arc::new(Notify::new()),
            },
        );

        tracing::info!(
            "[session] {} created (provider: {}, agent session: {})",
            record.session_id,
            record.provider,
            record.agent_session_id,
        );
        Ok(record)
    }

    /// Spawn (or reuse a stashed) ACP process and run the handshake.
    async fn start_acp_process(
        &self,
        preset_id: &str,
        cwd: &str,
        params: &CreateSessionParams,
        injection: &McpInjection,
        notification_tx: &broadcast::Sender<Value>,
        session_id: &str,
    ) -> Result<(Arc<AgentProcess>, String), BrokerError> {
        // A process stashed by a recent auth failure skips the spawn.
        let stashed = {
            let mut pending = self.pending_auth.lock().await;
            pending.remove(&(preset_id.to_string(), cwd.to_string()))
        };

        let (process, reused) = match stashed {
            Some(stash) if stash.process.is_alive() && stash.stashed_at.elapsed() < AUTH_GRACE => {
                tracing::info!("[session] reusing pending-auth process for {}", preset_id);
                (stash.process, true)
            }
            _ => {
                let config = self
                    .catalog
                    .build_spawn_descriptor(
                        preset_id,
                        cwd,
                        injection.cli_args.clone(),
                        HashMap::new(),
                        injection.mcp_configs.clone(),
                    )
                    .await?;
                let process =
                    Arc::new(AgentProcess::spawn(config, notification_tx.clone(), session_id).await?);
                process.initialize().await?;
                (process, false)
            }
        };

        match process.new_session(cwd, params.mcp_servers.clone()).await {
            Ok(agent_session_id) => {
                if let Some(mode_id) = &params.mode_id {
                    // Best-effort: not every agent supports modes.
                    if let Err(e) = process.set_mode(&agent_session_id, mode_id).await {
                        tracing::warn!("[session] set_mode({}) failed: {}", mode_id, e);
                    }
                }
                Ok((process, agent_session_id))
            }
            Err(err @ BrokerError::AuthRequired { .. }) => {
                // Keep the process for a grace window; a retry with
                // credentials set via env reuses it.
                if !reused {
                    self.stash_pending_auth(preset_id, cwd, process, notification_tx, session_id)
                        .await;
                } else {
                    process.kill().await;
                }
                Err(err)
            }
            Err(other) => {
                process.kill().await;
                Err(other)
            }
        }
    }

    async fn stash_pending_auth(
        &self,
        preset_id: &str,
        cwd: &str,
        process: Arc<AgentProcess>,
        notification_tx: &broadcast::Sender<Value>,
        session_id: &str,
    ) {
        let key = (preset_id.to_string(), cwd.to_string());
        self.pending_auth.lock().await.insert(
            key.clone(),
            PendingAuthProcess {
                process,
                notification_tx: notification_tx.clone(),
                session_id: session_id.to_string(),
                stashed_at: Instant::now(),
            },
        );

        // Reap the stash after the grace window.
        let manager_pending = self.pending_auth.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AUTH_GRACE).await;
            let stale = {
                let mut map = manager_pending.lock().await;
                match map.get(&key) {
                    Some(stash) if stash.stashed_at.elapsed() >= AUTH_GRACE => map.remove(&key),
                    _ => None,
                }
            };
            if let Some(stash) = stale {
                tracing::info!(
                    "[session] auth grace expired for {} — killing stashed process",
                    key.0
                );
                stash.process.kill().await;
                let _ = stash.notification_tx.send(session_notification(
                    &stash.session_id,
                    json!({ "sessionUpdate": "session_info_update", "message": "authentication window expired" }),
                ));
            }
        });
    }

    // ── Prompt / cancel ──────────────────────────────────────────────────

    /// One prompt turn. Rejects when another prompt is outstanding on the
    /// same session.
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<PromptResult, BrokerError> {
        let (handle, agent_session_id, in_flight, force_cancel) = {
            let sessions = self.sessions.read().await;
            let managed = sessions
                .get(session_id)
                .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_string()))?;
            if !managed.handle.is_alive() {
                return Err(BrokerError::ProcessExited(managed.record.provider.clone()));
            }
            (
                managed.handle.clone(),
                managed.agent_session_id.clone(),
                managed.prompt_in_flight.clone(),
                managed.force_cancel.clone(),
            )
        };

        if in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BrokerError::PromptInFlight(session_id.to_string()));
        }

        // Echo the user message into the stream so subscribers (and the
        // trace) see the full conversation.
        self.bus
            .publish(
                session_id,
                session_notification(session_id, json!({
                    "sessionUpdate": "user_message",
                    "content": { "type": "text", "text": text },
                })),
            )
            .await;

        let result = tokio::select! {
            result = handle.prompt(&agent_session_id, text) => result,
            _ = force_cancel.notified() => {
                tracing::warn!(
                    "[session] {} did not wind down after cancel — force-resolving turn",
                    session_id
                );
                Ok(PromptResult {
                    stop_reason: "cancelled".to_string(),
                    usage: None,
                    content: None,
                })
            }
        };
        in_flight.store(false, Ordering::SeqCst);

        // Conformant ACP agents end the turn by answering the prompt
        // request; the stream still needs its closing frame. The dialect
        // adapters emit turn_complete themselves.
        if let Ok(prompt_result) = &result {
            if matches!(handle.as_ref(), AgentHandle::Acp(_)) {
                let mut update = json!({
                    "sessionUpdate": "turn_complete",
                    "stopReason": prompt_result.stop_reason,
                });
                if let Some(usage) = &prompt_result.usage {
                    update["usage"] = usage.clone();
                }
                self.bus
                    .publish(session_id, session_notification(session_id, update))
                    .await;
            }
        }

        match result {
            Err(BrokerError::Timeout { method, timeout_ms }) => {
                // The child may still be computing; tell it to stop and
                // close the turn on the stream.
                handle.cancel(&agent_session_id).await;
                self.bus
                    .publish(
                        session_id,
                        session_notification(session_id, json!({
                            "sessionUpdate": "turn_complete",
                            "stopReason": "timeout",
                        })),
                    )
                    .await;
                Err(BrokerError::Timeout { method, timeout_ms })
            }
            other => other,
        }
    }

    /// Cancel the in-flight turn. Fire-and-forget toward the child; if it
    /// has not wound down in 30 s the broker force-resolves the turn.
    pub async fn cancel(&self, session_id: &str) -> Result<(), BrokerError> {
        let (handle, agent_session_id, in_flight, force_cancel) = {
            let sessions = self.sessions.read().await;
            let managed = sessions
                .get(session_id)
                .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_string()))?;
            (
                managed.handle.clone(),
                managed.agent_session_id.clone(),
                managed.prompt_in_flight.clone(),
                managed.force_cancel.clone(),
            )
        };

        handle.cancel(&agent_session_id).await;

        let bus = self.bus.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_GRACE).await;
            if in_flight.load(Ordering::SeqCst) {
                force_cancel.notify_waiters();
                bus.publish(
                    &session_id,
                    session_notification(&session_id, json!({
                        "sessionUpdate": "turn_complete",
                        "stopReason": "cancelled",
                    })),
                )
                .await;
            }
        });
        Ok(())
    }

    /// Set the agent-side mode for a session.
    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<(), BrokerError> {
        let (handle, agent_session_id) = {
            let sessions = self.sessions.read().await;
            let managed = sessions
                .get(session_id)
                .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_string()))?;
            (managed.handle.clone(), managed.agent_session_id.clone())
        };
        match handle.as_ref() {
            AgentHandle::Acp(p) => p.set_mode(&agent_session_id, mode_id).await,
            // Dialect adapters take the mode at spawn time.
            _ => Ok(()),
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Kill a session's agent and forget it.
    pub async fn kill_session(&self, session_id: &str) {
        let managed = self.sessions.write().await.remove(session_id);
        if let Some(managed) = managed {
            managed.handle.kill().await;
        }
        self.bus.close(session_id).await;
    }

    /// Bootstrap teardown: kill everything.
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.kill_session(&id).await;
        }
    }

    // ── Internal plumbing ────────────────────────────────────────────────

    /// Per-session normalizer: watches the event stream, records traces,
    /// re-publishes derived plan / file-summary updates.
    fn spawn_normalizer_pump(
        &self,
        session_id: &str,
        provider: &str,
        cwd: &str,
        tx: &broadcast::Sender<Value>,
    ) {
        let mut rx = tx.subscribe();
        let tx = tx.clone();
        let mut normalizer = Normalizer::new(session_id, provider, cwd);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        let Some((sid, update)) = split_notification(&frame)
                            .map(|(s, u)| (s.to_string(), u.clone()))
                        else {
                            continue;
                        };
                        for derived in normalizer.handle(&update).await {
                            let _ = tx.send(session_notification(&sid, derived));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[session] normalizer for {} lagged {} frames", session_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        normalizer.finish().await;
                        break;
                    }
                }
            }
        });
    }

    /// Child-exit watcher: deregister the session, close its channel.
    fn watch_exit(&self, session_id: &str, handle: &Arc<AgentHandle>) {
        let Some(mut exited) = handle.exited() else {
            return;
        };
        let bus = self.bus.clone();
        let session_id = session_id.to_string();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            loop {
                if *exited.borrow() {
                    break;
                }
                if exited.changed().await.is_err() {
                    break;
                }
            }
            tracing::info!("[session] agent for {} exited — terminating session", session_id);
            let _ = sessions.write().await.remove(&session_id);
            bus.close(&session_id).await;
        });
    }
}
