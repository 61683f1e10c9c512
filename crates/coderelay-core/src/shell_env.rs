//! Resolve the user's full shell PATH before spawning agent CLIs.
//!
//! When the server is launched outside a login shell (systemd unit, GUI
//! launcher) it may inherit a minimal PATH that cannot find user-installed
//! tools like `claude`, `codex`, or `opencode`. This module recovers the
//! login-shell PATH once and caches it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static FULL_PATH: OnceLock<String> = OnceLock::new();

#[cfg(windows)]
const PATH_SEP: char = ';';
#[cfg(not(windows))]
const PATH_SEP: char = ':';

/// Get the user's full shell PATH. Cached after the first call.
pub fn full_path() -> &'static str {
    FULL_PATH.get_or_init(resolve_full_path)
}

/// Resolve a command name to an absolute path using the full PATH.
pub fn which(command: &str) -> Option<String> {
    if command.contains('/') {
        return Some(command.to_string());
    }
    for dir in full_path().split(PATH_SEP) {
        let candidate = Path::new(dir).join(command);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().to_string());
        }
    }
    None
}

fn resolve_full_path() -> String {
    let current = std::env::var("PATH").unwrap_or_default();
    let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_default();

    let mut seen = HashSet::new();
    let mut parts: Vec<String> = Vec::new();

    let mut add = |p: &str| {
        if !p.is_empty() && seen.insert(p.to_string()) {
            parts.push(p.to_string());
        }
    };

    #[cfg(not(windows))]
    if let Some(shell_path) = resolve_unix_shell_path() {
        for p in shell_path.split(PATH_SEP) {
            add(p);
        }
    }

    for p in current.split(PATH_SEP) {
        add(p);
    }

    for dir in [
        home.join(".local/bin"),
        home.join(".cargo/bin"),
        home.join(".npm-global/bin"),
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
    ] {
        if dir.is_dir() {
            add(&dir.to_string_lossy());
        }
    }

    let result = parts.join(&PATH_SEP.to_string());
    tracing::debug!("[shell_env] Resolved PATH ({} entries)", parts.len());
    result
}

/// Unix: run the user's login shell to read its $PATH.
#[cfg(not(windows))]
fn resolve_unix_shell_path() -> Option<String> {
    let login_shell = std::env::var("SHELL").unwrap_or_default();
    let shells: Vec<&str> = if login_shell.is_empty() {
        vec!["/bin/zsh", "/bin/bash", "/bin/sh"]
    } else {
        vec![&login_shell, "/bin/bash", "/bin/sh"]
    };

    for shell in shells {
        if let Ok(output) = std::process::Command::new(shell)
            .args(["-lc", "echo $PATH"])
            .output()
        {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(path);
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
    fn which_finds_sh() {
        // Present on any unix test host
        assert!(which("sh").is_some());
    }

    #[test]
    fn which_passes_through_absolute_paths() {
        assert_eq!(which("/bin/sh").as_deref(), Some("/bin/sh"));
    }
}
