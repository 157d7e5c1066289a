//! On-disk layout for managed agent runtimes.
//!
//! Everything the broker downloads lives under `{data_dir}/acp-agents`:
//!
//! ```text
//! acp-agents/
//!   .runtimes/{node|uv}/{version}/   extracted runtime trees
//!   .downloads/{node|uv}/{version}/  in-flight archives (removed after extraction)
//! ```

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AgentPaths {
    root: PathBuf,
}

impl AgentPaths {
    /// Paths rooted at the platform data directory
    /// (`~/.local/share` on Linux, `~/Library/Application Support` on macOS).
    pub fn new() -> Self {
        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            root: base.join("acp-agents"),
        }
    }

    /// Paths rooted at an explicit directory. Used by tests and by
    /// serverless hosts that redirect writable state to ephemeral storage.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().join("acp-agents"),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// `{root}/.runtimes/{base}/{version}` — the extracted runtime tree.
    pub fn runtime_dir(&self, base: &str, version: &str) -> PathBuf {
        self.root.join(".runtimes").join(base).join(version)
    }

    /// `{root}/.downloads` — archive scratch space.
    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join(".downloads")
    }

    /// `{root}/.binaries/{id}/{version}` — installed binary-distribution agents.
    pub fn binary_dir(&self, id: &str, version: &str) -> PathBuf {
        self.root.join(".binaries").join(id).join(version)
    }
}

impl Default for AgentPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_dir_layout() {
        let paths = AgentPaths::with_root("/tmp/x");
        assert_eq!(
            paths.runtime_dir("node", "22.12.0"),
            PathBuf::from("/tmp/x/acp-agents/.runtimes/node/22.12.0")
        );
        assert_eq!(
            paths.downloads_dir(),
            PathBuf::from("/tmp/x/acp-agents/.downloads")
        );
    }
}
