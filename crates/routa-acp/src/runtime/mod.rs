//! Runtime manager — locates and downloads Node.js and uv.
//!
//! Registry agents are distributed as npm or PyPI packages and need a
//! runtime (`npx` / `uvx`) that may not exist on the host. Resolution
//! order, per runtime kind:
//!
//!   1. managed runtime under `.runtimes/{node|uv}/{version}/`
//!   2. system PATH lookup
//!   3. download + extract
//!
//! npx ships inside the Node.js tree and uvx inside the uv archive, so
//! `Npx`/`Uvx` download their base runtime and then locate the companion
//! executable in the same tree.
//!
//! Concurrent downloads of the same (base, version) pair are serialized by
//! a per-key async lock; a failed download removes its scratch directory so
//! no partial tree is left behind.

pub mod paths;

pub use paths::AgentPaths;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::BrokerError;

// ─── Platform tags ──────────────────────────────────────────────────────

pub const DARWIN_AARCH64: &str = "darwin-aarch64";
pub const DARWIN_X86_64: &str = "darwin-x86_64";
pub const LINUX_AARCH64: &str = "linux-aarch64";
pub const LINUX_X86_64: &str = "linux-x86_64";
pub const WINDOWS_AARCH64: &str = "windows-aarch64";
pub const WINDOWS_X86_64: &str = "windows-x86_64";

/// Platform tag for the running host (e.g. `"linux-x86_64"`).
pub fn current_platform() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => DARWIN_AARCH64,
        ("macos", _) => DARWIN_X86_64,
        ("linux", "aarch64") => LINUX_AARCH64,
        ("linux", _) => LINUX_X86_64,
        ("windows", "aarch64") => WINDOWS_AARCH64,
        ("windows", _) => WINDOWS_X86_64,
        _ => LINUX_X86_64,
    }
}

// ─── Runtime kinds ──────────────────────────────────────────────────────

/// Which logical runtime to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Node,
    Npx,
    Uv,
    Uvx,
}

impl RuntimeKind {
    pub fn command_name(&self) -> &'static str {
        match self {
            RuntimeKind::Node => "node",
            RuntimeKind::Npx => "npx",
            RuntimeKind::Uv => "uv",
            RuntimeKind::Uvx => "uvx",
        }
    }

    /// The downloadable base runtime this kind ships with.
    fn base(&self) -> (&'static str, &'static str) {
        match self {
            RuntimeKind::Node | RuntimeKind::Npx => ("node", DEFAULT_NODE_VERSION),
            RuntimeKind::Uv | RuntimeKind::Uvx => ("uv", DEFAULT_UV_VERSION),
        }
    }
}

/// A resolved runtime.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub kind: RuntimeKind,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub is_managed: bool,
}

// ─── Manager ────────────────────────────────────────────────────────────

const DEFAULT_NODE_VERSION: &str = "22.12.0";
const DEFAULT_UV_VERSION: &str = "0.5.11";

const NODE_DOWNLOAD_BASE: &str = "https://nodejs.org/dist";
const UV_DOWNLOAD_BASE: &str = "https://github.com/astral-sh/uv/releases/download";

/// Resolves and auto-installs Node.js / uv runtimes.
pub struct RuntimeManager {
    paths: AgentPaths,
    download_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RuntimeManager {
    pub fn new(paths: AgentPaths) -> Self {
        Self {
            paths,
            download_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a runtime, downloading it when neither a managed nor a
    /// system install exists. Callers treat an `Err` as "this preset
    /// cannot be used on this host".
    pub async fn ensure_runtime(&self, kind: RuntimeKind) -> Result<RuntimeInfo, BrokerError> {
        if let Some(info) = self.managed_runtime(kind).await {
            return Ok(info);
        }
        if let Some(info) = self.system_runtime(kind) {
            return Ok(info);
        }

        let (base, version) = kind.base();
        match base {
            "node" => self.download_node(version).await?,
            _ => self.download_uv(version).await?,
        };

        self.managed_runtime(kind).await.ok_or_else(|| {
            BrokerError::Runtime(format!(
                "'{}' not found after installing {} {}",
                kind.command_name(),
                base,
                version
            ))
        })
    }

    /// Whether the runtime is reachable without downloading anything.
    pub async fn is_available(&self, kind: RuntimeKind) -> bool {
        self.managed_runtime(kind).await.is_some() || self.system_runtime(kind).is_some()
    }

    /// System PATH lookup.
    pub fn system_runtime(&self, kind: RuntimeKind) -> Option<RuntimeInfo> {
        let path = crate::shell_env::which(kind.command_name())?;
        Some(RuntimeInfo {
            kind,
            path,
            version: None,
            is_managed: false,
        })
    }

    /// Previously-installed managed runtime.
    pub async fn managed_runtime(&self, kind: RuntimeKind) -> Option<RuntimeInfo> {
        let (base, version) = kind.base();
        let dir = self.paths.runtime_dir(base, version);
        if !dir.exists() {
            return None;
        }
        let exe = find_executable(&dir, kind.command_name()).await?;
        Some(RuntimeInfo {
            kind,
            path: exe,
            version: Some(version.to_string()),
            is_managed: true,
        })
    }

    // ── Downloads ────────────────────────────────────────────────────────

    async fn download_node(&self, version: &str) -> Result<PathBuf, BrokerError> {
        let lock = self.download_lock(&format!("node-{version}")).await;
        let _guard = lock.lock().await;

        let runtime_dir = self.paths.runtime_dir("node", version);
        if let Some(existing) = find_executable(&runtime_dir, "node").await {
            return Ok(existing);
        }

        let (os, arch) = node_platform(current_platform())?;
        let ext = if os == "win" { "zip" } else { "tar.gz" };
        let archive_base = format!("node-v{version}-{os}-{arch}");
        let url = format!("{NODE_DOWNLOAD_BASE}/v{version}/{archive_base}.{ext}");

        self.fetch_and_extract("node", version, &archive_base, ext, &url, &runtime_dir)
            .await?;

        let node = find_executable(&runtime_dir, "node")
            .await
            .ok_or_else(|| BrokerError::Runtime("node binary missing after extraction".into()))?;
        make_executable(&node).await?;
        if let Some(npx) = find_executable(&runtime_dir, "npx").await {
            let _ = make_executable(&npx).await;
        }

        tracing::info!("[runtime] Node.js {} ready: {:?}", version, node);
        Ok(node)
    }

    async fn download_uv(&self, version: &str) -> Result<PathBuf, BrokerError> {
        let lock = self.download_lock(&format!("uv-{version}")).await;
        let _guard = lock.lock().await;

        let runtime_dir = self.paths.runtime_dir("uv", version);
        if let Some(existing) = find_executable(&runtime_dir, "uv").await {
            return Ok(existing);
        }

        let target = uv_target(current_platform())?;
        let ext = if cfg!(windows) { "zip" } else { "tar.gz" };
        let archive_base = format!("uv-{target}");
        let url = format!("{UV_DOWNLOAD_BASE}/{version}/{archive_base}.{ext}");

        self.fetch_and_extract("uv", version, &archive_base, ext, &url, &runtime_dir)
            .await?;

        let uv = find_executable(&runtime_dir, "uv")
            .await
            .ok_or_else(|| BrokerError::Runtime("uv binary missing after extraction".into()))?;
        make_executable(&uv).await?;
        if let Some(uvx) = find_executable(&runtime_dir, "uvx").await {
            let _ = make_executable(&uvx).await;
        }

        tracing::info!("[runtime] uv {} ready: {:?}", version, uv);
        Ok(uv)
    }

    /// Download `url` into the scratch dir, extract into `runtime_dir`,
    /// and remove the scratch dir. On any failure the scratch dir is
    /// removed so a retry starts clean.
    async fn fetch_and_extract(
        &self,
        base: &str,
        version: &str,
        archive_base: &str,
        ext: &str,
        url: &str,
        runtime_dir: &Path,
    ) -> Result<(), BrokerError> {
        tokio::fs::create_dir_all(runtime_dir).await?;

        let download_dir = self.paths.downloads_dir().join(base).join(version);
        tokio::fs::create_dir_all(&download_dir).await?;
        let archive_path = download_dir.join(format!("{archive_base}.{ext}"));

        tracing::info!("[runtime] downloading {} {}: {}", base, version, url);

        if let Err(e) = self.fetch_file(url, &archive_path).await {
            let _ = tokio::fs::remove_dir_all(&download_dir).await;
            return Err(e);
        }

        let archive = archive_path.clone();
        let dest = runtime_dir.to_path_buf();

        let extracted = tokio::task::spawn_blocking(move || {
            if archive.to_string_lossy().ends_with(".zip") {
                extract_zip(&archive, &dest)
            } else {
                extract_tgz(&archive, &dest)
            }
        })
        .await
        .map_err(|e| BrokerError::Runtime(format!("extract task panicked: {e}")))?;

        let _ = tokio::fs::remove_dir_all(&download_dir).await;

        if let Err(e) = extracted {
            let _ = tokio::fs::remove_dir_all(runtime_dir).await;
            return Err(e);
        }
        Ok(())
    }

    async fn fetch_file(&self, url: &str, dest: &Path) -> Result<(), BrokerError> {
        let resp = reqwest::get(url)
            .await
            .map_err(|e| BrokerError::Runtime(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Runtime(format!(
                "download failed ({}) for {}",
                resp.status(),
                url
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BrokerError::Runtime(format!("reading body of {url}: {e}")))?;
        tokio::fs::write(dest, &bytes).await?;
        tracing::debug!("[runtime] downloaded {} bytes -> {:?}", bytes.len(), dest);
        Ok(())
    }

    async fn download_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.download_locks.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// ─── Platform URL mapping ───────────────────────────────────────────────

fn node_platform(platform: &str) -> Result<(&'static str, &'static str), BrokerError> {
    match platform {
        DARWIN_AARCH64 => Ok(("darwin", "arm64")),
        DARWIN_X86_64 => Ok(("darwin", "x64")),
        LINUX_AARCH64 => Ok(("linux", "arm64")),
        LINUX_X86_64 => Ok(("linux", "x64")),
        WINDOWS_AARCH64 => Ok(("win", "arm64")),
        WINDOWS_X86_64 => Ok(("win", "x64")),
        other => Err(BrokerError::Runtime(format!(
            "unsupported platform for Node.js: {other}"
        ))),
    }
}

fn uv_target(platform: &str) -> Result<&'static str, BrokerError> {
    match platform {
        DARWIN_AARCH64 => Ok("aarch64-apple-darwin"),
        DARWIN_X86_64 => Ok("x86_64-apple-darwin"),
        LINUX_AARCH64 => Ok("aarch64-unknown-linux-gnu"),
        LINUX_X86_64 => Ok("x86_64-unknown-linux-gnu"),
        WINDOWS_AARCH64 => Ok("aarch64-pc-windows-msvc"),
        WINDOWS_X86_64 => Ok("x86_64-pc-windows-msvc"),
        other => Err(BrokerError::Runtime(format!(
            "unsupported platform for uv: {other}"
        ))),
    }
}

// ─── Filesystem helpers ─────────────────────────────────────────────────

/// Recursively find `name` (plus `.exe` on Windows) under `dir`.
pub(crate) async fn find_executable(dir: &Path, name: &str) -> Option<PathBuf> {
    let exe = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    };

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&current).await.ok()?;
        while let Ok(Some(entry)) = rd.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().map(|n| n == exe.as_str()).unwrap_or(false) {
                return Some(path);
            }
        }
    }
    None
}

pub(crate) async fn make_executable(path: &Path) -> Result<(), BrokerError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path).await?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        tokio::fs::set_permissions(path, perms).await?;
    }

    // GateKeeper refuses quarantined binaries downloaded by a non-browser.
    #[cfg(target_os = "macos")]
    {
        let s = path.to_string_lossy().to_string();
        let _ = tokio::process::Command::new("xattr")
            .args(["-d", "com.apple.quarantine", &s])
            .output()
            .await;
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

pub(crate) fn extract_zip(archive: &Path, dest: &Path) -> Result<(), BrokerError> {
    let f = std::fs::File::open(archive)?;
    let mut z = zip::ZipArchive::new(f)
        .map_err(|e| BrokerError::Runtime(format!("read zip {archive:?}: {e}")))?;
    for i in 0..z.len() {
        let mut entry = z
            .by_index(i)
            .map_err(|e| BrokerError::Runtime(format!("zip entry {i}: {e}")))?;
        let out = dest.join(entry.mangled_name());
        if entry.name().ends_with('/') {
            std::fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outf = std::fs::File::create(&out)?;
            std::io::copy(&mut entry, &mut outf)?;
        }
    }
    Ok(())
}

pub(crate) fn extract_tgz(archive: &Path, dest: &Path) -> Result<(), BrokerError> {
    let f = std::fs::File::open(archive)?;
    let gz = flate2::read::GzDecoder::new(f);
    tar::Archive::new(gz)
        .unpack(dest)
        .map_err(|e| BrokerError::Runtime(format!("unpack {archive:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_tag_is_known() {
        let tag = current_platform();
        assert!(node_platform(tag).is_ok());
        assert!(uv_target(tag).is_ok());
    }

    #[test]
    fn kind_maps_to_base() {
        assert_eq!(RuntimeKind::Npx.base().0, "node");
        assert_eq!(RuntimeKind::Uvx.base().0, "uv");
        assert_eq!(RuntimeKind::Node.command_name(), "node");
    }

    #[tokio::test]
    async fn managed_runtime_absent_in_empty_root() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = RuntimeManager::new(AgentPaths::with_root(tmp.path()));
        assert!(mgr.managed_runtime(RuntimeKind::Node).await.is_none());
    }

    #[tokio::test]
    async fn find_executable_walks_nested_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b").join("bin");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("node"), b"#!/bin/sh\n").await.unwrap();

        let found = find_executable(tmp.path(), "node").await.unwrap();
        assert!(found.ends_with("bin/node"));
    }
}
