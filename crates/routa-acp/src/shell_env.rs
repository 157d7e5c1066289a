//! Resolve the user's full shell PATH.
//!
//! The broker may be launched from a desktop shell or a service manager
//! that inherits a minimal PATH (macOS Dock apps famously get
//! `/usr/bin:/bin:/usr/sbin:/sbin`). Agent CLIs like `opencode`, `claude`
//! or `gemini` are usually installed into user-level directories, so we
//! recover the login-shell PATH once and use it for every spawn and
//! `which`-style lookup.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static FULL_PATH: OnceLock<String> = OnceLock::new();

#[cfg(windows)]
const PATH_SEP: char = ';';
#[cfg(not(windows))]
const PATH_SEP: char = ':';

/// The merged PATH: login-shell PATH + process PATH + well-known dirs.
/// Resolved once and cached for the process lifetime.
pub fn full_path() -> &'static str {
    FULL_PATH.get_or_init(resolve_full_path)
}

fn resolve_full_path() -> String {
    let current = std::env::var("PATH").unwrap_or_default();
    let home = dirs::home_dir().unwrap_or_default();

    let mut seen = std::collections::HashSet::new();
    let mut parts: Vec<String> = Vec::new();
    let mut add = |p: &str| {
        if !p.is_empty() && seen.insert(p.to_string()) {
            parts.push(p.to_string());
        }
    };

    #[cfg(not(windows))]
    if let Some(shell_path) = login_shell_path() {
        for p in shell_path.split(PATH_SEP) {
            add(p);
        }
    }

    for p in current.split(PATH_SEP) {
        add(p);
    }

    for dir in well_known_dirs(&home) {
        if dir.is_dir() {
            add(&dir.to_string_lossy());
        }
    }

    let merged = parts.join(&PATH_SEP.to_string());
    tracing::debug!("[shell_env] resolved PATH ({} entries)", parts.len());
    merged
}

/// Ask the user's login shell for its $PATH.
#[cfg(not(windows))]
fn login_shell_path() -> Option<String> {
    let configured = std::env::var("SHELL").unwrap_or_default();
    let mut candidates: Vec<&str> = vec!["/bin/zsh", "/bin/bash", "/bin/sh"];
    if !configured.is_empty() {
        candidates.insert(0, &configured);
    }

    for shell in candidates {
        let output = std::process::Command::new(shell)
            .args(["-l", "-c", "echo $PATH"])
            .output()
            .ok()?;
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(path);
            }
        }
    }
    None
}

/// Directories where user-installed agent CLIs commonly live.
fn well_known_dirs(home: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![
        home.join(".local/bin"),
        home.join(".cargo/bin"),
        home.join(".opencode/bin"),
        home.join(".bun/bin"),
        home.join(".npm-global/bin"),
        home.join("bin"),
    ];

    #[cfg(target_os = "macos")]
    dirs.extend([
        PathBuf::from("/opt/homebrew/bin"),
        PathBuf::from("/usr/local/bin"),
    ]);

    #[cfg(target_os = "linux")]
    dirs.extend([
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/snap/bin"),
        PathBuf::from("/home/linuxbrew/.linuxbrew/bin"),
    ]);

    #[cfg(windows)]
    {
        if let Ok(app_data) = std::env::var("APPDATA") {
            dirs.push(PathBuf::from(app_data).join("npm"));
        }
        dirs.push(home.join("scoop").join("shims"));
    }

    dirs
}

/// Locate `cmd` on the merged PATH. Returns the absolute path when found.
pub fn which(cmd: &str) -> Option<PathBuf> {
    for dir in full_path().split(PATH_SEP) {
        let base = Path::new(dir).join(cmd);

        #[cfg(not(windows))]
        if base.is_file() {
            return Some(base);
        }

        #[cfg(windows)]
        {
            if base.is_file() {
                return Some(base);
            }
            for ext in ["exe", "cmd", "bat", "com"] {
                let with_ext = base.with_extension(ext);
                if with_ext.is_file() {
                    return Some(with_ext);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_path_is_non_empty_and_cached() {
        let first = full_path();
        assert!(!first.is_empty());
        assert_eq!(first, full_path());
    }

    #[cfg(unix)]
    #[test]
    fn which_finds_sh() {
        let path = which("sh").expect("sh should be on PATH");
        assert!(path.is_file());
    }

    #[test]
    fn which_misses_nonsense() {
        assert!(which("definitely-not-a-real-binary-7d3f").is_none());
    }
}
