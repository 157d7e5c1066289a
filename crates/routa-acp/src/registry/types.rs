//! Remote agent registry schema.
//!
//! The registry is a CDN-hosted JSON catalog of installable agents. It is
//! validated strictly on ingest: a `distribution` object may only carry the
//! kinds we know how to launch (`npx`, `uvx`, `binary`) — anything else
//! fails deserialization so a new distribution kind cannot silently produce
//! an unlaunchable preset.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The whole registry document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistry {
    #[serde(default)]
    pub agents: Vec<RegistryAgent>,
}

/// One installable agent in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAgent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    pub distribution: Distribution,
}

/// How an agent is distributed. At least one kind must be present for the
/// agent to be launchable; unknown kinds are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Distribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npx: Option<PackageDist>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uvx: Option<PackageDist>,
    /// Platform tag (`linux-x86_64`, ...) → archive descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<HashMap<String, BinaryDist>>,
}

/// An npm / PyPI package distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDist {
    pub package: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A prebuilt binary archive for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryDist {
    /// Archive URL (`.tar.gz` or `.zip`).
    pub archive: String,
    /// Executable name inside the archive.
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Distribution {
    /// Whether this agent can run on the given platform tag.
    pub fn usable_on(&self, platform: &str) -> bool {
        self.npx.is_some()
            || self.uvx.is_some()
            || self
                .binary
                .as_ref()
                .map(|m| m.contains_key(platform))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_npx_agent() {
        let agent: RegistryAgent = serde_json::from_value(serde_json::json!({
            "id": "agent-x",
            "name": "Agent X",
            "version": "1.2.3",
            "description": "test agent",
            "distribution": { "npx": { "package": "@acme/agent-x" } }
        }))
        .unwrap();
        assert!(agent.distribution.usable_on("linux-x86_64"));
        assert_eq!(agent.distribution.npx.unwrap().package, "@acme/agent-x");
    }

    #[test]
    fn rejects_unknown_distribution_kind() {
        let result: Result<Distribution, _> = serde_json::from_value(serde_json::json!({
            "docker": { "image": "acme/agent" }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn binary_agent_is_platform_filtered() {
        let dist: Distribution = serde_json::from_value(serde_json::json!({
            "binary": {
                "darwin-aarch64": { "archive": "https://x/a.tar.gz", "cmd": "agent" }
            }
        }))
        .unwrap();
        assert!(dist.usable_on("darwin-aarch64"));
        assert!(!dist.usable_on("linux-x86_64"));
    }
}
