//! Engine configuration.
//!
//! Every section uses `#[serde(default)]`, so a partial TOML file (or no file
//! at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::sandbox::IsolationMode;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub sandbox: SandboxConfig,
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Local sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Workspace root on the host. Supports `~` and environment variables.
    /// When unset, `<data dir>/workspace` is used.
    pub root: Option<String>,
    /// Shell used to run commands (invoked as `<shell> -lc <command>`).
    pub shell: String,
    /// Namespace isolation for commands.
    pub isolation: IsolationMode,
    /// Also unshare the network namespace when isolating.
    pub isolate_network: bool,
    /// Write a starter project into an empty root on boot.
    pub seed_template: bool,
    /// Terminal size advertised to commands via COLUMNS/LINES.
    pub terminal_cols: u16,
    pub terminal_rows: u16,
    /// Directory names skipped when mirroring the sandbox filesystem.
    pub ignored_dirs: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: None,
            shell: "bash".to_string(),
            isolation: IsolationMode::Auto,
            isolate_network: false,
            seed_template: true,
            terminal_cols: 120,
            terminal_rows: 40,
            ignored_dirs: default_ignored_dirs(),
        }
    }
}

fn default_ignored_dirs() -> Vec<String> {
    ["node_modules", ".git", ".cache", ".pnpm-store"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl SandboxConfig {
    /// Resolve the workspace root, expanding `~` and variables.
    pub fn resolve_root(&self, data_dir: &std::path::Path) -> Result<PathBuf, String> {
        match self.root.as_deref() {
            Some(raw) if !raw.trim().is_empty() => shellexpand::full(raw)
                .map(|expanded| PathBuf::from(expanded.to_string()))
                .map_err(|e| format!("expanding sandbox root {raw:?}: {e}")),
            _ => Ok(data_dir.join("workspace")),
        }
    }
}

/// Mirror and summary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Characters of each file included in its summary preview.
    pub preview_chars: usize,
    /// Files listed in the prompt context text.
    pub summary_file_limit: usize,
    /// Capacity of the runtime event channel.
    pub event_buffer: usize,
    /// Package manifest the dependency list is read from.
    pub manifest_path: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            preview_chars: 280,
            summary_file_limit: 20,
            event_buffer: 256,
            manifest_path: "/package.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sandbox.shell, "bash");
        assert_eq!(config.sandbox.isolation, IsolationMode::Auto);
        assert!(config.sandbox.ignored_dirs.contains(&"node_modules".to_string()));
        assert_eq!(config.workspace.preview_chars, 280);
        assert_eq!(config.workspace.event_buffer, 256);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
[sandbox]
shell = "sh"
isolation = "none"
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.shell, "sh");
        assert_eq!(config.sandbox.isolation, IsolationMode::None);
        assert_eq!(config.sandbox.terminal_cols, 120);
        assert_eq!(config.workspace.manifest_path, "/package.json");
    }

    #[test]
    fn test_resolve_root() {
        let mut sandbox = SandboxConfig::default();
        assert_eq!(
            sandbox.resolve_root(Path::new("/data")).unwrap(),
            PathBuf::from("/data/workspace")
        );

        sandbox.root = Some("/srv/ws".to_string());
        assert_eq!(
            sandbox.resolve_root(Path::new("/data")).unwrap(),
            PathBuf::from("/srv/ws")
        );
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&EngineConfig::default()).unwrap();
        let parsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sandbox.shell, "bash");
    }
}
