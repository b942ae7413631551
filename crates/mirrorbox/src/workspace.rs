//! Workspace paths and the flat path-to-content map.
//!
//! Every path the engine stores is canonical: `/`-rooted, no empty or `.`
//! segments, and never containing `..`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A path that cannot be mapped into the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid path: {0}")]
pub struct InvalidPath(pub String);

/// Canonicalize a workspace path.
///
/// `src//./main.rs` and `/src/main.rs` both become `/src/main.rs`; the empty
/// string and `/` are the root.
pub fn normalize_path(path: &str) -> Result<String, InvalidPath> {
    let segments = path_segments(path)?;
    Ok(format!("/{}", segments.join("/")))
}

/// Split a path into its segments, dropping empty and `.` segments.
pub fn path_segments(path: &str) -> Result<Vec<&str>, InvalidPath> {
    if path.contains('\0') {
        return Err(InvalidPath(path.to_string()));
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }
    Ok(segments)
}

/// Form used for sandbox calls: canonical path without the leading slash.
pub fn sandbox_path(path: &str) -> Result<String, InvalidPath> {
    Ok(path_segments(path)?.join("/"))
}

/// Join a canonical directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Flat map from canonical path to file content.
///
/// This is the source of truth for "current file content"; the tree is
/// derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceMap(BTreeMap<String, String>);

impl WorkspaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file. The path is canonicalized first.
    pub fn insert(&mut self, path: &str, content: impl Into<String>) -> Result<(), InvalidPath> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(InvalidPath(path));
        }
        self.0.insert(path, content.into());
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        let path = normalize_path(path).ok()?;
        self.0.get(&path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Drop `path` itself and every entry below it. Returns the removed keys.
    pub fn remove_path(&mut self, path: &str) -> Result<Vec<String>, InvalidPath> {
        let path = normalize_path(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let removed: Vec<String> = self
            .0
            .keys()
            .filter(|key| **key == path || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &removed {
            self.0.remove(key);
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in sorted path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl TryFrom<BTreeMap<String, String>> for WorkspaceMap {
    type Error = InvalidPath;

    fn try_from(entries: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut map = WorkspaceMap::new();
        for (path, content) in entries {
            map.insert(&path, content)?;
        }
        Ok(map)
    }
}
