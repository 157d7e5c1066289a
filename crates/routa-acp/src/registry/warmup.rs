//! Warmup service — pre-caches npx/uvx agent packages.
//!
//! The first spawn of an npx/uvx agent pays the npm / PyPI download, which
//! can take minutes. Warming runs the package manager once in the
//! background so the first real session starts fast. Binary and static
//! presets need no warmup.
//!
//! State per agent id: idle → warming → {warm, failed}.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::RwLock;

use super::{DistributionType, PresetCatalog};
use crate::runtime::RuntimeKind;

const WARMUP_TIMEOUT_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupState {
    Idle,
    Warming,
    Warm,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupStatus {
    pub agent_id: String,
    pub state: WarmupState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WarmupStatus {
    fn idle(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            state: WarmupState::Idle,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Pre-warms npx/uvx packages so first launch is instant.
#[derive(Clone)]
pub struct WarmupService {
    catalog: Arc<PresetCatalog>,
    states: Arc<RwLock<HashMap<String, WarmupStatus>>>,
}

impl WarmupService {
    pub fn new(catalog: Arc<PresetCatalog>) -> Self {
        Self {
            catalog,
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn status(&self, agent_id: &str) -> WarmupStatus {
        self.states
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| WarmupStatus::idle(agent_id))
    }

    pub async fn all_statuses(&self) -> Vec<WarmupStatus> {
        self.states.read().await.values().cloned().collect()
    }

    async fn needs_warmup(&self, agent_id: &str) -> bool {
        !matches!(
            self.states.read().await.get(agent_id).map(|s| s.state),
            Some(WarmupState::Warming) | Some(WarmupState::Warm)
        )
    }

    /// Fire-and-forget warmup. Safe to call repeatedly.
    pub async fn warmup_in_background(&self, agent_id: &str) {
        if !self.needs_warmup(agent_id).await {
            return;
        }
        let this = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let _ = this.warmup(&agent_id).await;
        });
    }

    /// Run warmup to completion. `Ok(true)` when the package is cached,
    /// `Ok(false)` when the prewarm command timed out.
    pub async fn warmup(&self, agent_id: &str) -> Result<bool, String> {
        if !self.needs_warmup(agent_id).await {
            return Ok(self.status(agent_id).await.state == WarmupState::Warm);
        }

        self.set_state(agent_id, WarmupState::Warming, Some(now_secs()), None, None)
            .await;

        let result = self.run_warmup(agent_id).await;
        let (state, error) = match &result {
            Ok(true) => (WarmupState::Warm, None),
            Ok(false) => (WarmupState::Failed, None),
            Err(e) => (WarmupState::Failed, Some(e.clone())),
        };
        self.set_state(agent_id, state, None, Some(now_secs()), error)
            .await;

        result
    }

    async fn run_warmup(&self, agent_id: &str) -> Result<bool, String> {
        let preset = self
            .catalog
            .get_preset(agent_id)
            .await
            .map_err(|e| e.to_string())?;

        let (kind, package) = match (preset.distribution_type, preset.args.as_slice()) {
            // npx preset args are ["-y", package, ...]
            (Some(DistributionType::Npx), [_, package, ..]) => {
                (RuntimeKind::Npx, package.clone())
            }
            // uvx preset args are [package, ...]
            (Some(DistributionType::Uvx), [package, ..]) => (RuntimeKind::Uvx, package.clone()),
            _ => {
                tracing::info!("[warmup] {} needs no warmup", agent_id);
                return Ok(true);
            }
        };

        let info = self
            .catalog
            .runtime_manager()
            .ensure_runtime(kind)
            .await
            .map_err(|e| e.to_string())?;

        let args: Vec<String> = if kind == RuntimeKind::Npx {
            vec!["-y".into(), package.clone()]
        } else {
            // uvx: --help is enough to trigger the package download
            vec![package.clone(), "--help".into()]
        };

        tracing::info!(
            "[warmup] pre-warming {} via {:?} {:?}",
            package,
            info.path,
            args
        );

        let mut cmd = Command::new(&info.path);
        cmd.args(&args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        // The managed runtime dir must be on PATH so npx can find node.
        if let Some(runtime_dir) = info.path.parent() {
            let sep = if cfg!(windows) { ";" } else { ":" };
            let path = std::env::var("PATH").unwrap_or_default();
            cmd.env("PATH", format!("{}{}{}", runtime_dir.display(), sep, path));
        }

        let child = cmd.spawn().map_err(|e| format!("spawn failed: {e}"))?;

        match tokio::time::timeout(
            std::time::Duration::from_secs(WARMUP_TIMEOUT_SECS),
            child.wait_with_output(),
        )
        .await
        {
            // Non-zero exit is fine; many CLIs exit non-zero for --help but
            // the package is cached by then.
            Ok(Ok(output)) => {
                tracing::info!(
                    "[warmup] done for {} (exit={})",
                    package,
                    output.status.code().unwrap_or(-1)
                );
                Ok(true)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                tracing::warn!("[warmup] timed out after {}s for {}", WARMUP_TIMEOUT_SECS, package);
                Ok(false)
            }
        }
    }

    async fn set_state(
        &self,
        agent_id: &str,
        state: WarmupState,
        started_at: Option<u64>,
        finished_at: Option<u64>,
        error: Option<String>,
    ) {
        self.states.write().await.insert(
            agent_id.to_string(),
            WarmupStatus {
                agent_id: agent_id.to_string(),
                state,
                started_at,
                finished_at,
                error,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{AgentPaths, RuntimeManager};

    fn service() -> WarmupService {
        let paths = AgentPaths::with_root(std::env::temp_dir());
        let runtime = Arc::new(RuntimeManager::new(paths.clone()));
        WarmupService::new(Arc::new(PresetCatalog::new(runtime, paths)))
    }

    #[tokio::test]
    async fn static_preset_warms_instantly() {
        let svc = service();
        assert_eq!(svc.warmup("opencode").await, Ok(true));
        assert_eq!(svc.status("opencode").await.state, WarmupState::Warm);
    }

    #[tokio::test]
    async fn unknown_agent_fails() {
        let svc = service();
        assert!(svc.warmup("no-such-agent").await.is_err());
        assert_eq!(svc.status("no-such-agent").await.state, WarmupState::Failed);
    }
}
