//! Host isolation for sandboxed commands.
//!
//! On Linux, commands can run inside bubblewrap (bwrap) with a private mount
//! namespace in which only the system directories (read-only) and the
//! workspace root (read-write) are visible.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How commands are isolated from the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Run directly on the host, confined only by the working directory.
    None,
    /// Require bubblewrap; booting fails when it is missing.
    Bubblewrap,
    /// Use bubblewrap when available, otherwise run directly.
    #[default]
    Auto,
}

/// Check if bubblewrap is available.
pub fn bwrap_available() -> bool {
    std::process::Command::new("bwrap")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check if `shell` can be executed.
pub fn shell_available(shell: &str) -> bool {
    std::process::Command::new(shell)
        .arg("-c")
        .arg("exit 0")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Build bwrap arguments that confine a command to `root`.
///
/// The returned list ends with `--`, ready for the shell invocation.
pub fn build_bwrap_args(root: &Path, cwd: &Path, isolate_network: bool) -> Vec<String> {
    let mut args = Vec::new();

    // Basic system directories (read-only)
    for dir in &["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc"] {
        if Path::new(dir).exists() {
            args.push("--ro-bind".to_string());
            args.push(dir.to_string());
            args.push(dir.to_string());
        }
    }

    args.push("--proc".to_string());
    args.push("/proc".to_string());
    args.push("--dev".to_string());
    args.push("/dev".to_string());
    args.push("--tmpfs".to_string());
    args.push("/tmp".to_string());

    let root_str = root.to_string_lossy().to_string();
    args.push("--bind".to_string());
    args.push(root_str.clone());
    args.push(root_str);

    args.push("--chdir".to_string());
    args.push(cwd.to_string_lossy().to_string());

    args.push("--unshare-pid".to_string());
    if isolate_network {
        args.push("--unshare-net".to_string());
        debug!("Network namespace isolation enabled");
    }

    // Die with parent (important for cleanup)
    args.push("--die-with-parent".to_string());
    args.push("--".to_string());

    debug!("bwrap args: {:?}", args);
    args
}

/// Resolve whether bwrap should be used for this boot.
///
/// Returns `Err(reason)` when isolation is required but unavailable.
pub(crate) fn resolve(mode: IsolationMode) -> Result<bool, String> {
    match mode {
        IsolationMode::None => Ok(false),
        IsolationMode::Bubblewrap => {
            if bwrap_available() {
                info!("bubblewrap isolation enabled");
                Ok(true)
            } else {
                Err("bubblewrap (bwrap) is required but was not found".to_string())
            }
        }
        IsolationMode::Auto => {
            let available = bwrap_available();
            if !available {
                warn!("bubblewrap (bwrap) not found, commands run without namespace isolation");
            }
            Ok(available)
        }
    }
}
