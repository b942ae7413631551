//! Project summary types handed to the prompt-construction layer.

use serde::{Deserialize, Serialize};

/// Short description of one workspace file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub path: String,
    /// Content length in characters.
    pub size: usize,
    /// Leading slice of the content.
    pub preview: String,
}

/// Everything the assistant is told about the workspace up front.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub files: Vec<FileSummary>,
    /// `name@version` entries from the package manifest.
    pub dependencies: Vec<String>,
}
