//! Preset catalog — static providers plus the remote agent registry.
//!
//! A `Preset` is everything the session manager needs to name a provider;
//! `build_spawn_descriptor` turns one into a concrete `AgentProcessConfig`
//! with a resolved executable (possibly a managed npx/uvx runtime or a
//! freshly installed binary archive).
//!
//! Static presets are compile-time constants and always win id collisions
//! with registry agents. The registry is fetched lazily and cached for an
//! hour; agents whose distribution has no entry usable on this platform
//! are filtered out.

pub mod types;
pub mod warmup;

pub use types::*;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::BrokerError;
use crate::runtime::{
    self, current_platform, AgentPaths, RuntimeKind, RuntimeManager,
};

const REGISTRY_URL: &str =
    "https://cdn.agentclientprotocol.com/registry/v1/latest/registry.json";

const REGISTRY_TTL: Duration = Duration::from_secs(60 * 60);

// ─── Preset ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetSource {
    Static,
    Registry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionType {
    Npx,
    Uvx,
    Binary,
}

/// Immutable descriptor of one launchable provider.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub display_name: String,
    /// Executable name or placeholder runtime (`npx`, `uvx`) resolved at
    /// spawn-descriptor build time.
    pub command: String,
    pub args: Vec<String>,
    /// Env var that overrides `command` with an absolute binary path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_override: Option<String>,
    /// True for providers whose wire dialect needs a translating adapter
    /// (Claude Code's stream-json).
    #[serde(default)]
    pub non_standard_dialect: bool,
    pub source: PresetSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_type: Option<DistributionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Preset {
    fn statik(
        id: &str,
        display_name: &str,
        command: &str,
        args: &[&str],
        env_override: Option<&str>,
        description: &str,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env_override: env_override.map(Into::into),
            non_standard_dialect: false,
            source: PresetSource::Static,
            distribution_type: None,
            version: None,
            description: description.into(),
            icon: None,
        }
    }

    /// The command with any `env_override` applied.
    pub fn effective_command(&self) -> String {
        self.env_override
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.command.clone())
    }
}

/// The built-in provider table.
pub fn static_presets() -> Vec<Preset> {
    let mut claude = Preset::statik(
        "claude",
        "Claude Code",
        "claude",
        &[],
        None,
        "Anthropic Claude Code (stream-json dialect)",
    );
    claude.non_standard_dialect = true;

    vec![
        Preset::statik(
            "opencode",
            "OpenCode",
            "opencode",
            &["acp"],
            Some("OPENCODE_BIN"),
            "OpenCode AI coding agent",
        ),
        Preset::statik(
            "gemini",
            "Gemini CLI",
            "gemini",
            &["--experimental-acp"],
            Some("GEMINI_BIN"),
            "Google Gemini CLI",
        ),
        Preset::statik(
            "codex",
            "Codex",
            "codex-acp",
            &[],
            Some("CODEX_ACP_BIN"),
            "OpenAI Codex CLI (codex-acp wrapper)",
        ),
        Preset::statik(
            "copilot",
            "Copilot CLI",
            "copilot",
            &["--acp"],
            Some("COPILOT_BIN"),
            "GitHub Copilot CLI",
        ),
        Preset::statik(
            "auggie",
            "Auggie",
            "auggie",
            &["--acp"],
            Some("AUGGIE_BIN"),
            "Augment Code's AI agent",
        ),
        Preset::statik(
            "kimi",
            "Kimi CLI",
            "kimi",
            &["acp"],
            Some("KIMI_BIN"),
            "Moonshot AI's Kimi CLI",
        ),
        claude,
    ]
}

// ─── Spawn descriptor ───────────────────────────────────────────────────

/// Everything needed to spawn one agent child process.
#[derive(Debug, Clone)]
pub struct AgentProcessConfig {
    pub preset: Preset,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub display_name: String,
    /// Inline MCP config JSON strings (Claude's `--mcp-config <json>`).
    pub mcp_configs: Vec<String>,
}

// ─── Catalog ────────────────────────────────────────────────────────────

struct CachedRegistry {
    fetched_at: Instant,
    agents: Vec<RegistryAgent>,
}

/// Static preset table + cached remote registry.
pub struct PresetCatalog {
    runtime: Arc<RuntimeManager>,
    paths: AgentPaths,
    cache: RwLock<Option<CachedRegistry>>,
}

impl PresetCatalog {
    pub fn new(runtime: Arc<RuntimeManager>, paths: AgentPaths) -> Self {
        Self {
            runtime,
            paths,
            cache: RwLock::new(None),
        }
    }

    pub fn runtime_manager(&self) -> Arc<RuntimeManager> {
        self.runtime.clone()
    }

    /// All presets. Registry agents are appended after static presets,
    /// minus id collisions and agents not usable on this platform. A
    /// registry fetch failure degrades to static-only.
    pub async fn list_presets(&self, include_registry: bool) -> Vec<Preset> {
        let mut presets = static_presets();
        if !include_registry {
            return presets;
        }

        let agents = match self.registry_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                tracing::warn!("[catalog] registry unavailable: {}", e);
                return presets;
            }
        };

        let known: std::collections::HashSet<String> =
            presets.iter().map(|p| p.id.clone()).collect();
        let platform = current_platform();

        for agent in agents {
            if known.contains(&agent.id) || !agent.distribution.usable_on(platform) {
                continue;
            }
            presets.push(registry_preset(&agent));
        }
        presets
    }

    /// Look up a preset by id; static table first, then the registry.
    pub async fn get_preset(&self, id: &str) -> Result<Preset, BrokerError> {
        if let Some(preset) = static_presets().into_iter().find(|p| p.id == id) {
            return Ok(preset);
        }

        let agents = self.registry_agents().await?;
        let platform = current_platform();
        agents
            .iter()
            .find(|a| a.id == id && a.distribution.usable_on(platform))
            .map(registry_preset)
            .ok_or_else(|| BrokerError::PresetNotFound(id.to_string()))
    }

    /// Compose a preset with a working directory and MCP material into a
    /// spawnable descriptor, resolving npx/uvx runtimes and installing
    /// binary archives as needed.
    pub async fn build_spawn_descriptor(
        &self,
        id: &str,
        cwd: &str,
        extra_args: Vec<String>,
        extra_env: HashMap<String, String>,
        mcp_configs: Vec<String>,
    ) -> Result<AgentProcessConfig, BrokerError> {
        let preset = self.get_preset(id).await?;

        let mut env = HashMap::new();
        let mut args = preset.args.clone();

        let command: PathBuf = match preset.distribution_type {
            Some(DistributionType::Npx) => {
                let info = self.runtime.ensure_runtime(RuntimeKind::Npx).await?;
                env.extend(self.distribution_env(&preset.id, |d| d.npx.clone()).await);
                info.path
            }
            Some(DistributionType::Uvx) => {
                let info = self.runtime.ensure_runtime(RuntimeKind::Uvx).await?;
                env.extend(self.distribution_env(&preset.id, |d| d.uvx.clone()).await);
                info.path
            }
            Some(DistributionType::Binary) => self.install_binary(&preset).await?,
            None => PathBuf::from(preset.effective_command()),
        };

        args.extend(extra_args);
        env.extend(extra_env);

        Ok(AgentProcessConfig {
            display_name: preset.display_name.clone(),
            preset,
            command,
            args,
            cwd: cwd.to_string(),
            env,
            mcp_configs,
        })
    }

    // ── Registry cache ───────────────────────────────────────────────────

    async fn registry_agents(&self) -> Result<Vec<RegistryAgent>, BrokerError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < REGISTRY_TTL {
                    return Ok(cached.agents.clone());
                }
            }
        }
        self.refresh_registry().await
    }

    /// Fetch the registry, replacing the cache. Refreshes are serialized
    /// by the write lock.
    pub async fn refresh_registry(&self) -> Result<Vec<RegistryAgent>, BrokerError> {
        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < REGISTRY_TTL {
                return Ok(cached.agents.clone());
            }
        }

        let resp = reqwest::get(REGISTRY_URL)
            .await
            .map_err(|e| BrokerError::Registry(format!("fetch registry: {e}")))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Registry(format!(
                "registry returned HTTP {}",
                resp.status()
            )));
        }
        let registry: AgentRegistry = resp
            .json()
            .await
            .map_err(|e| BrokerError::Registry(format!("parse registry: {e}")))?;

        tracing::info!("[catalog] registry refreshed: {} agents", registry.agents.len());
        *cache = Some(CachedRegistry {
            fetched_at: Instant::now(),
            agents: registry.agents.clone(),
        });
        Ok(registry.agents)
    }

    async fn distribution_env<F>(&self, id: &str, pick: F) -> HashMap<String, String>
    where
        F: Fn(&Distribution) -> Option<PackageDist>,
    {
        match self.registry_agents().await {
            Ok(agents) => agents
                .iter()
                .find(|a| a.id == id)
                .and_then(|a| pick(&a.distribution))
                .map(|d| d.env)
                .unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    /// Download and extract a binary-distribution agent, returning the path
    /// to its executable. Re-uses an already-installed tree.
    async fn install_binary(&self, preset: &Preset) -> Result<PathBuf, BrokerError> {
        let agents = self.registry_agents().await?;
        let agent = agents
            .iter()
            .find(|a| a.id == preset.id)
            .ok_or_else(|| BrokerError::PresetNotFound(preset.id.clone()))?;

        let dist = agent
            .distribution
            .binary
            .as_ref()
            .and_then(|m| m.get(current_platform()))
            .ok_or_else(|| {
                BrokerError::Registry(format!(
                    "agent '{}' has no binary for {}",
                    preset.id,
                    current_platform()
                ))
            })?;

        let version = agent.version.clone().unwrap_or_else(|| "latest".into());
        let install_dir = self.paths.binary_dir(&preset.id, &version);

        if let Some(existing) = runtime::find_executable(&install_dir, &dist.cmd).await {
            return Ok(existing);
        }

        tokio::fs::create_dir_all(&install_dir).await?;
        let resp = reqwest::get(&dist.archive)
            .await
            .map_err(|e| BrokerError::Registry(format!("fetch {}: {e}", dist.archive)))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Registry(format!(
                "archive download failed ({}) for {}",
                resp.status(),
                dist.archive
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BrokerError::Registry(format!("reading archive: {e}")))?;

        let is_zip = dist.archive.ends_with(".zip");
        let archive_path = install_dir.join(if is_zip { "agent.zip" } else { "agent.tar.gz" });
        tokio::fs::write(&archive_path, &bytes).await?;

        let archive = archive_path.clone();
        let dest = install_dir.clone();
        tokio::task::spawn_blocking(move || {
            if is_zip {
                runtime::extract_zip(&archive, &dest)
            } else {
                runtime::extract_tgz(&archive, &dest)
            }
        })
        .await
        .map_err(|e| BrokerError::Registry(format!("extract task panicked: {e}")))??;
        let _ = tokio::fs::remove_file(&archive_path).await;

        let exe = runtime::find_executable(&install_dir, &dist.cmd)
            .await
            .ok_or_else(|| {
                BrokerError::Registry(format!(
                    "'{}' not found in archive for agent '{}'",
                    dist.cmd, preset.id
                ))
            })?;
        runtime::make_executable(&exe).await?;
        Ok(exe)
    }
}

/// Turn a registry agent into a Preset. npx wins over uvx wins over binary
/// when several distributions are present.
fn registry_preset(agent: &RegistryAgent) -> Preset {
    let (command, args, distribution_type) = if let Some(npx) = &agent.distribution.npx {
        let mut args = vec!["-y".to_string(), npx.package.clone()];
        args.extend(npx.args.clone());
        ("npx".to_string(), args, DistributionType::Npx)
    } else if let Some(uvx) = &agent.distribution.uvx {
        let mut args = vec![uvx.package.clone()];
        args.extend(uvx.args.clone());
        ("uvx".to_string(), args, DistributionType::Uvx)
    } else {
        let bin = agent
            .distribution
            .binary
            .as_ref()
            .and_then(|m| m.get(current_platform()));
        (
            bin.map(|b| b.cmd.clone()).unwrap_or_default(),
            bin.map(|b| b.args.clone()).unwrap_or_default(),
            DistributionType::Binary,
        )
    };

    Preset {
        id: agent.id.clone(),
        display_name: agent.name.clone(),
        command,
        args,
        env_override: None,
        non_standard_dialect: false,
        source: PresetSource::Registry,
        distribution_type: Some(distribution_type),
        version: agent.version.clone(),
        description: agent.description.clone(),
        icon: agent.icon.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_is_exhaustive() {
        let presets = static_presets();
        let ids: Vec<&str> = presets.iter().map(|p| p.id.as_str()).collect();
        for expected in ["opencode", "gemini", "codex", "copilot", "auggie", "kimi", "claude"] {
            assert!(ids.contains(&expected), "missing preset {expected}");
        }
        let claude = presets.iter().find(|p| p.id == "claude").unwrap();
        assert!(claude.non_standard_dialect);
    }

    #[test]
    fn registry_preset_prefers_npx() {
        let agent: RegistryAgent = serde_json::from_value(serde_json::json!({
            "id": "agent-x",
            "name": "Agent X",
            "distribution": {
                "npx": { "package": "@acme/agent-x", "args": ["serve"] },
                "uvx": { "package": "agent-x" }
            }
        }))
        .unwrap();
        let preset = registry_preset(&agent);
        assert_eq!(preset.command, "npx");
        assert_eq!(preset.args, vec!["-y", "@acme/agent-x", "serve"]);
        assert_eq!(preset.distribution_type, Some(DistributionType::Npx));
    }

    #[test]
    fn env_override_substitutes_command() {
        let mut preset = static_presets().remove(0);
        let var = "ROUTA_TEST_OPENCODE_BIN_7F";
        preset.env_override = Some(var.to_string());
        std::env::set_var(var, "/opt/custom/opencode");
        assert_eq!(preset.effective_command(), "/opt/custom/opencode");
        std::env::remove_var(var);
        assert_eq!(preset.effective_command(), "opencode");
    }

    #[tokio::test]
    async fn static_presets_listed_without_registry() {
        let paths = AgentPaths::with_root(std::env::temp_dir());
        let runtime = Arc::new(RuntimeManager::new(paths.clone()));
        let catalog = PresetCatalog::new(runtime, paths);
        let presets = catalog.list_presets(false).await;
        assert_eq!(presets.len(), static_presets().len());
    }
}
