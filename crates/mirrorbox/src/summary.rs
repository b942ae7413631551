//! Project summaries for prompt construction.

use log::debug;
use serde_json::Value;

use mirrorbox_protocol::{FileSummary, ProjectSummary};

use crate::config::WorkspaceConfig;
use crate::workspace::WorkspaceMap;

/// Derives summaries from the workspace map.
#[derive(Debug, Clone)]
pub struct WorkspaceSummaryBuilder {
    preview_chars: usize,
    file_limit: usize,
    manifest_path: String,
}

impl Default for WorkspaceSummaryBuilder {
    fn default() -> Self {
        Self::new(&WorkspaceConfig::default())
    }
}

impl WorkspaceSummaryBuilder {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            preview_chars: config.preview_chars,
            file_limit: config.summary_file_limit,
            manifest_path: config.manifest_path.clone(),
        }
    }

    /// Per-file previews plus the manifest's dependency list.
    pub fn build(&self, files: &WorkspaceMap) -> ProjectSummary {
        ProjectSummary {
            files: self.file_summaries(files),
            dependencies: self.dependencies(files),
        }
    }

    pub fn file_summaries(&self, files: &WorkspaceMap) -> Vec<FileSummary> {
        files
            .iter()
            .map(|(path, content)| FileSummary {
                path: path.to_string(),
                size: content.chars().count(),
                preview: content.chars().take(self.preview_chars).collect(),
            })
            .collect()
    }

    /// `name@version` for every runtime and dev dependency in the manifest.
    ///
    /// A missing or unparsable manifest yields an empty list.
    pub fn dependencies(&self, files: &WorkspaceMap) -> Vec<String> {
        let Some(manifest) = files.get(&self.manifest_path) else {
            return Vec::new();
        };
        let parsed: Value = match serde_json::from_str(manifest) {
            Ok(value) => value,
            Err(e) => {
                debug!("Ignoring unparsable manifest {}: {e}", self.manifest_path);
                return Vec::new();
            }
        };

        ["dependencies", "devDependencies"]
            .iter()
            .filter_map(|section| parsed.get(section)?.as_object())
            .flat_map(|deps| deps.iter())
            .map(|(name, version)| match version.as_str() {
                Some(version) => format!("{name}@{version}"),
                None => format!("{name}@{version}"), // non-string specs keep their JSON form
            })
            .collect()
    }

    /// Plain-text block describing the project for an assistant prompt.
    pub fn context_summary(&self, summary: &ProjectSummary) -> String {
        let dependencies = if summary.dependencies.is_empty() {
            "No dependencies installed yet.".to_string()
        } else {
            summary.dependencies.join(", ")
        };

        let files = if summary.files.is_empty() {
            "No project files yet.".to_string()
        } else {
            summary
                .files
                .iter()
                .take(self.file_limit)
                .map(|file| {
                    format!(
                        "• {} ({} chars)\n{}",
                        file.path,
                        file.size,
                        file.preview.replace("```", "")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        format!("Current dependencies: {dependencies}\n\nImportant files:\n{files}")
    }
}
