//! MCP config materialization.
//!
//! Every provider has its own way of learning about MCP servers: some read
//! a global config file, some take a `--mcp-config` flag pointing at a
//! file, Claude takes inline JSON. `McpConfigWriter` hides the differences
//! behind `ensure_for_provider`, which returns the CLI arguments (and/or
//! inline JSON strings) the spawner must add.
//!
//! File-based targets are merged read-modify-write: pre-existing entries
//! survive, parent directories are created, and concurrent sessions
//! writing the same file are serialized by a per-path lock. A write
//! failure never kills the session — it degrades to "no MCP" with a
//! logged summary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Name of the built-in coordination server entry. Always wins collisions
/// with user-defined servers.
pub const COORDINATION_SERVER_NAME: &str = "routa-coordination";

// ─── Input material ─────────────────────────────────────────────────────

/// Transport for a user-defined MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpServerType {
    Stdio,
    Http,
    Sse,
}

/// A user-defined MCP server to inject alongside the coordination server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomMcpServer {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: McpServerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// What the config writer needs to know about the coordination endpoint.
#[derive(Debug, Clone, Default)]
pub struct McpMaterial {
    pub server_url: String,
    pub workspace_id: Option<String>,
    pub custom_servers: Vec<CustomMcpServer>,
}

impl McpMaterial {
    /// Build from `ROUTA_SERVER_URL` / `ROUTA_WORKSPACE_ID`. Returns `None`
    /// when no coordination endpoint is configured.
    pub fn from_env() -> Option<Self> {
        let server_url = std::env::var("ROUTA_SERVER_URL").ok()?;
        if server_url.is_empty() {
            return None;
        }
        Some(Self {
            server_url,
            workspace_id: std::env::var("ROUTA_WORKSPACE_ID").ok(),
            custom_servers: Vec::new(),
        })
    }

    /// Endpoint URL with the workspace id attached when present.
    fn endpoint(&self) -> String {
        match &self.workspace_id {
            Some(ws) if !ws.is_empty() => {
                format!("{}?workspaceId={}", self.server_url, ws)
            }
            _ => self.server_url.clone(),
        }
    }
}

/// What the spawner must add to the agent command line.
#[derive(Debug, Clone, Default)]
pub struct McpInjection {
    pub cli_args: Vec<String>,
    /// Inline config JSON strings (Claude's `--mcp-config <json>`).
    pub mcp_configs: Vec<String>,
    pub summary: String,
}

// ─── Writer ─────────────────────────────────────────────────────────────

/// Materializes per-provider MCP configuration.
pub struct McpConfigWriter {
    /// Home directory the provider config files live under. Overridable
    /// for tests and serverless path redirection.
    home: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl McpConfigWriter {
    pub fn new() -> Self {
        Self::with_home(dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure `provider_id` can reach the coordination server, and
    /// return what to add to its command line. Never fails: a config write
    /// error degrades to no MCP.
    pub async fn ensure_for_provider(
        &self,
        provider_id: &str,
        material: &McpMaterial,
    ) -> McpInjection {
        let result = match provider_id {
            "opencode" => self.write_opencode(material).await,
            "auggie" => self.write_auggie(material).await,
            "claude" => Ok(self.inline_claude(material)),
            "codex" => self.write_codex(material).await,
            "gemini" => self.write_gemini(material).await,
            "kimi" => self.write_kimi(material).await,
            "copilot" => self.write_copilot(material).await,
            other => {
                tracing::debug!("[mcp] no config mechanism for provider '{}'", other);
                Ok(McpInjection {
                    summary: format!("no MCP mechanism for {other}"),
                    ..Default::default()
                })
            }
        };

        match result {
            Ok(injection) => {
                tracing::info!("[mcp] {}: {}", provider_id, injection.summary);
                injection
            }
            Err(e) => {
                tracing::warn!(
                    "[mcp] config write failed for {} — continuing without MCP: {}",
                    provider_id,
                    e
                );
                McpInjection {
                    summary: format!("MCP disabled ({e})"),
                    ..Default::default()
                }
            }
        }
    }

    // ── Per-provider mechanisms ──────────────────────────────────────────

    /// OpenCode: merge into `~/.config/opencode/opencode.json` `mcp` object.
    async fn write_opencode(&self, material: &McpMaterial) -> Result<McpInjection, String> {
        let path = self.home.join(".config/opencode/opencode.json");
        self.merge_json(&path, |root| {
            let mcp = ensure_object(root, "mcp");
            for server in enabled_custom(material) {
                mcp.insert(server.name.clone(), opencode_entry(server));
            }
            mcp.insert(
                COORDINATION_SERVER_NAME.into(),
                json!({ "type": "remote", "url": material.endpoint(), "enabled": true }),
            );
        })
        .await?;
        Ok(McpInjection {
            summary: format!("merged into {}", path.display()),
            ..Default::default()
        })
    }

    /// Auggie: write `~/.augment/mcp-config.json`, pass its path via
    /// `--mcp-config <path>`.
    async fn write_auggie(&self, material: &McpMaterial) -> Result<McpInjection, String> {
        let path = self.home.join(".augment/mcp-config.json");
        self.merge_json(&path, |root| {
            let servers = ensure_object(root, "mcpServers");
            for server in enabled_custom(material) {
                servers.insert(server.name.clone(), generic_entry(server));
            }
            servers.insert(
                COORDINATION_SERVER_NAME.into(),
                json!({ "type": "http", "url": material.endpoint() }),
            );
        })
        .await?;
        Ok(McpInjection {
            cli_args: vec!["--mcp-config".into(), path.to_string_lossy().into_owned()],
            summary: format!("wrote {}", path.display()),
            ..Default::default()
        })
    }

    /// Claude: no file — one inline JSON string for `--mcp-config <json>`.
    fn inline_claude(&self, material: &McpMaterial) -> McpInjection {
        let mut servers = serde_json::Map::new();
        for server in enabled_custom(material) {
            servers.insert(server.name.clone(), generic_entry(server));
        }
        servers.insert(
            COORDINATION_SERVER_NAME.into(),
            json!({ "type": "http", "url": material.endpoint() }),
        );
        let config = Value::Object(
            [("mcpServers".to_string(), Value::Object(servers))]
                .into_iter()
                .collect(),
        );
        McpInjection {
            mcp_configs: vec![config.to_string()],
            summary: "inline --mcp-config".into(),
            ..Default::default()
        }
    }

    /// Codex: merge TOML at `~/.codex/config.toml` under `[mcp_servers.*]`.
    async fn write_codex(&self, material: &McpMaterial) -> Result<McpInjection, String> {
        let path = self.home.join(".codex/config.toml");
        self.merge_toml(&path, |root| {
            let servers = ensure_table(root, "mcp_servers");
            for server in enabled_custom(material) {
                servers.insert(server.name.clone(), toml_entry(server));
            }
            servers.insert(
                COORDINATION_SERVER_NAME.into(),
                toml::Value::Table(
                    [("url".to_string(), toml::Value::String(material.endpoint()))]
                        .into_iter()
                        .collect(),
                ),
            );
        })
        .await?;
        Ok(McpInjection {
            summary: format!("merged into {}", path.display()),
            ..Default::default()
        })
    }

    /// Gemini: merge `~/.gemini/settings.json` under `mcpServers`, using
    /// `httpUrl` (Gemini ignores plain `url` for HTTP transports).
    async fn write_gemini(&self, material: &McpMaterial) -> Result<McpInjection, String> {
        let path = self.home.join(".gemini/settings.json");
        self.merge_json(&path, |root| {
            let servers = ensure_object(root, "mcpServers");
            for server in enabled_custom(material) {
                let mut entry = generic_entry(server);
                if let Some(url) = entry.as_object_mut().and_then(|o| o.remove("url")) {
                    entry["httpUrl"] = url;
                }
                servers.insert(server.name.clone(), entry);
            }
            servers.insert(
                COORDINATION_SERVER_NAME.into(),
                json!({ "httpUrl": material.endpoint() }),
            );
        })
        .await?;
        Ok(McpInjection {
            summary: format!("merged into {}", path.display()),
            ..Default::default()
        })
    }

    /// Kimi: merge TOML at `~/.kimi/config.toml` under `[mcp.servers.*]`.
    async fn write_kimi(&self, material: &McpMaterial) -> Result<McpInjection, String> {
        let path = self.home.join(".kimi/config.toml");
        self.merge_toml(&path, |root| {
            let mcp = ensure_table(root, "mcp");
            let servers = ensure_table(mcp, "servers");
            for server in enabled_custom(material) {
                servers.insert(server.name.clone(), toml_entry(server));
            }
            servers.insert(
                COORDINATION_SERVER_NAME.into(),
                toml::Value::Table(
                    [("url".to_string(), toml::Value::String(material.endpoint()))]
                        .into_iter()
                        .collect(),
                ),
            );
        })
        .await?;
        Ok(McpInjection {
            summary: format!("merged into {}", path.display()),
            ..Default::default()
        })
    }

    /// Copilot: merge `~/.copilot/mcp-config.json`.
    async fn write_copilot(&self, material: &McpMaterial) -> Result<McpInjection, String> {
        let path = self.home.join(".copilot/mcp-config.json");
        self.merge_json(&path, |root| {
            let servers = ensure_object(root, "mcpServers");
            for server in enabled_custom(material) {
                servers.insert(server.name.clone(), generic_entry(server));
            }
            servers.insert(
                COORDINATION_SERVER_NAME.into(),
                json!({ "type": "http", "url": material.endpoint() }),
            );
        })
        .await?;
        Ok(McpInjection {
            summary: format!("merged into {}", path.display()),
            ..Default::default()
        })
    }

    // ── Merge primitives ─────────────────────────────────────────────────

    async fn merge_json<F>(&self, path: &Path, mutate: F) -> Result<(), String>
    where
        F: FnOnce(&mut serde_json::Map<String, Value>),
    {
        let lock = self.path_lock(path).await;
        let _guard = lock.lock().await;

        let mut root = match tokio::fs::read_to_string(path).await {
            Ok(existing) => serde_json::from_str::<Value>(&existing)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
            Err(_) => serde_json::Map::new(),
        };

        mutate(&mut root);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
        }
        let rendered = serde_json::to_string_pretty(&Value::Object(root))
            .map_err(|e| format!("serialize: {e}"))?;
        tokio::fs::write(path, rendered)
            .await
            .map_err(|e| format!("write {}: {e}", path.display()))
    }

    async fn merge_toml<F>(&self, path: &Path, mutate: F) -> Result<(), String>
    where
        F: FnOnce(&mut toml::value::Table),
    {
        let lock = self.path_lock(path).await;
        let _guard = lock.lock().await;

        let mut root = match tokio::fs::read_to_string(path).await {
            Ok(existing) => existing.parse::<toml::value::Table>()
                .ok()
                .unwrap_or_default(),
            Err(_) => toml::value::Table::new(),
        };

        mutate(&mut root);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
        }
        let rendered = toml::to_string_pretty(&toml::Value::Table(root))
            .map_err(|e| format!("serialize: {e}"))?;
        tokio::fs::write(path, rendered)
            .await
            .map_err(|e| format!("write {}: {e}", path.display()))
    }

    async fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for McpConfigWriter {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Entry shapes ───────────────────────────────────────────────────────

fn enabled_custom(material: &McpMaterial) -> impl Iterator<Item = &CustomMcpServer> {
    material
        .custom_servers
        .iter()
        .filter(|s| s.enabled && s.name != COORDINATION_SERVER_NAME)
}

fn opencode_entry(server: &CustomMcpServer) -> Value {
    match server.server_type {
        McpServerType::Stdio => json!({
            "type": "local",
            "command": server.command,
            "args": server.args,
            "enabled": true,
        }),
        _ => json!({
            "type": "remote",
            "url": server.url,
            "enabled": true,
        }),
    }
}

fn generic_entry(server: &CustomMcpServer) -> Value {
    match server.server_type {
        McpServerType::Stdio => json!({
            "type": "stdio",
            "command": server.command,
            "args": server.args,
        }),
        McpServerType::Sse => json!({ "type": "sse", "url": server.url }),
        McpServerType::Http => json!({ "type": "http", "url": server.url }),
    }
}

fn toml_entry(server: &CustomMcpServer) -> toml::Value {
    let mut table = toml::value::Table::new();
    match server.server_type {
        McpServerType::Stdio => {
            if let Some(command) = &server.command {
                table.insert("command".into(), toml::Value::String(command.clone()));
            }
            table.insert(
                "args".into(),
                toml::Value::Array(
                    server
                        .args
                        .iter()
                        .map(|a| toml::Value::String(a.clone()))
                        .collect(),
                ),
            );
        }
        _ => {
            if let Some(url) = &server.url {
                table.insert("url".into(), toml::Value::String(url.clone()));
            }
        }
    }
    toml::Value::Table(table)
}

fn ensure_object<'a>(
    root: &'a mut serde_json::Map<String, Value>,
    key: &str,
) -> &'a mut serde_json::Map<String, Value> {
    if !root.get(key).map(Value::is_object).unwrap_or(false) {
        root.insert(key.to_string(), Value::Object(serde_json::Map::new()));
    }
    root.get_mut(key)
        .and_then(Value::as_object_mut)
        .expect("just inserted object")
}

fn ensure_table<'a>(root: &'a mut toml::value::Table, key: &str) -> &'a mut toml::value::Table {
    if !root.get(key).map(toml::Value::is_table).unwrap_or(false) {
        root.insert(key.to_string(), toml::Value::Table(toml::value::Table::new()));
    }
    root.get_mut(key)
        .and_then(toml::Value::as_table_mut)
        .expect("just inserted table")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> McpMaterial {
        McpMaterial {
            server_url: "http://127.0.0.1:3210/api/mcp".into(),
            workspace_id: Some("w1".into()),
            custom_servers: vec![CustomMcpServer {
                name: "notes".into(),
                server_type: McpServerType::Http,
                command: None,
                args: vec![],
                url: Some("http://127.0.0.1:9999/mcp".into()),
                enabled: true,
            }],
        }
    }

    #[tokio::test]
    async fn opencode_merge_preserves_existing_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = McpConfigWriter::with_home(tmp.path());
        let path = tmp.path().join(".config/opencode/opencode.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(
            &path,
            r#"{"theme":"dark","mcp":{"existing":{"type":"remote","url":"http://x","enabled":true}}}"#,
        )
        .await
        .unwrap();

        let injection = writer.ensure_for_provider("opencode", &material()).await;
        assert!(injection.cli_args.is_empty());

        let root: Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(root["theme"], "dark");
        let mcp = root["mcp"].as_object().unwrap();
        assert!(mcp.contains_key("existing"));
        assert!(mcp.contains_key("notes"));
        assert_eq!(
            mcp[COORDINATION_SERVER_NAME]["url"],
            "http://127.0.0.1:3210/api/mcp?workspaceId=w1"
        );

        // Idempotent: a second write yields the same entry set.
        writer.ensure_for_provider("opencode", &material()).await;
        let again: Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(root["mcp"], again["mcp"]);
    }

    #[tokio::test]
    async fn codex_toml_merge_keeps_foreign_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = McpConfigWriter::with_home(tmp.path());
        let path = tmp.path().join(".codex/config.toml");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "model = \"o3\"\n\n[mcp_servers.other]\nurl = \"http://y\"\n")
            .await
            .unwrap();

        writer.ensure_for_provider("codex", &material()).await;

        let root: toml::Value = toml::Value::Table(
            tokio::fs::read_to_string(&path)
                .await
                .unwrap()
                .parse()
                .unwrap(),
        );
        assert_eq!(root["model"].as_str(), Some("o3"));
        let servers = root["mcp_servers"].as_table().unwrap();
        assert!(servers.contains_key("other"));
        assert!(servers.contains_key(COORDINATION_SERVER_NAME));
    }

    #[tokio::test]
    async fn gemini_uses_http_url_key() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = McpConfigWriter::with_home(tmp.path());
        writer.ensure_for_provider("gemini", &material()).await;

        let path = tmp.path().join(".gemini/settings.json");
        let root: Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        let entry = &root["mcpServers"][COORDINATION_SERVER_NAME];
        assert!(entry.get("httpUrl").is_some());
        assert!(entry.get("url").is_none());
    }

    #[tokio::test]
    async fn kimi_nested_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = McpConfigWriter::with_home(tmp.path());
        writer.ensure_for_provider("kimi", &material()).await;

        let path = tmp.path().join(".kimi/config.toml");
        let root: toml::Value = toml::Value::Table(
            tokio::fs::read_to_string(&path)
                .await
                .unwrap()
                .parse()
                .unwrap(),
        );
        assert!(root["mcp"]["servers"][COORDINATION_SERVER_NAME]["url"]
            .as_str()
            .unwrap()
            .contains("workspaceId=w1"));
    }

    #[tokio::test]
    async fn auggie_returns_config_path_args() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = McpConfigWriter::with_home(tmp.path());
        let injection = writer.ensure_for_provider("auggie", &material()).await;
        assert_eq!(injection.cli_args[0], "--mcp-config");
        assert!(injection.cli_args[1].ends_with("mcp-config.json"));
    }

    #[tokio::test]
    async fn claude_gets_inline_json() {
        let writer = McpConfigWriter::with_home("/nonexistent");
        let injection = writer.ensure_for_provider("claude", &material()).await;
        assert!(injection.cli_args.is_empty());
        let config: Value = serde_json::from_str(&injection.mcp_configs[0]).unwrap();
        assert_eq!(
            config["mcpServers"][COORDINATION_SERVER_NAME]["type"],
            "http"
        );
    }

    #[tokio::test]
    async fn builtin_entry_wins_name_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = McpConfigWriter::with_home(tmp.path());
        let mut mat = material();
        mat.custom_servers.push(CustomMcpServer {
            name: COORDINATION_SERVER_NAME.into(),
            server_type: McpServerType::Http,
            command: None,
            args: vec![],
            url: Some("http://evil/override".into()),
            enabled: true,
        });

        writer.ensure_for_provider("copilot", &mat).await;
        let path = tmp.path().join(".copilot/mcp-config.json");
        let root: Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(
            root["mcpServers"][COORDINATION_SERVER_NAME]["url"],
            "http://127.0.0.1:3210/api/mcp?workspaceId=w1"
        );
    }

    #[tokio::test]
    async fn write_failure_degrades_to_no_mcp() {
        // Home is a file, so mkdir under it must fail.
        let tmp = tempfile::tempdir().unwrap();
        let not_a_dir = tmp.path().join("file");
        tokio::fs::write(&not_a_dir, b"x").await.unwrap();

        let writer = McpConfigWriter::with_home(&not_a_dir);
        let injection = writer.ensure_for_provider("copilot", &material()).await;
        assert!(injection.cli_args.is_empty());
        assert!(injection.summary.contains("MCP disabled"));
    }
}
