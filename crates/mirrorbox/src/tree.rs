//! Persistent tree mirroring the workspace map.
//!
//! Updates never mutate an existing tree. `insert` and `remove` copy only the
//! directories along the affected path and share every other branch with the
//! previous version through `Arc`, so snapshots handed to observers stay
//! valid and cheap to keep.
//!
//! Children are stored in insertion order. Display code sorts them by name
//! ([`DirectoryNode::sorted_children`]), and structural equality ignores the
//! stored order.

use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

use crate::workspace::{InvalidPath, WorkspaceMap, join_path, path_segments};

/// Errors raised by tree updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// A file and a directory would share one path.
    #[error("path conflict at {path}: {existing} already exists")]
    Conflict {
        path: String,
        existing: &'static str,
    },

    #[error(transparent)]
    InvalidPath(#[from] InvalidPath),
}

/// A file leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNode {
    pub path: String,
    pub name: String,
    pub content: String,
}

/// A directory and its children.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryNode {
    pub path: String,
    pub name: String,
    pub children: Vec<TreeNode>,
}

/// Either kind of node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    File(Arc<FileNode>),
    Directory(Arc<DirectoryNode>),
}

impl TreeNode {
    pub fn name(&self) -> &str {
        match self {
            TreeNode::File(file) => &file.name,
            TreeNode::Directory(dir) => &dir.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            TreeNode::File(file) => &file.path,
            TreeNode::Directory(dir) => &dir.path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, TreeNode::Directory(_))
    }
}

impl DirectoryNode {
    fn empty(path: String, name: String) -> Self {
        Self {
            path,
            name,
            children: Vec::new(),
        }
    }

    fn root() -> Self {
        Self::empty("/".to_string(), "/".to_string())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.children.iter().position(|child| child.name() == name)
    }

    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children.iter().find(|child| child.name() == name)
    }

    /// Children in display order (by name).
    pub fn sorted_children(&self) -> Vec<&TreeNode> {
        let mut children: Vec<&TreeNode> = self.children.iter().collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        children
    }

    fn with_file(&self, segments: &[&str], content: &str) -> Result<Self, TreeError> {
        let Some((name, rest)) = segments.split_first() else {
            return Err(InvalidPath(self.path.clone()).into());
        };
        let path = join_path(&self.path, name);
        let mut next = self.clone();

        if rest.is_empty() {
            let file = TreeNode::File(Arc::new(FileNode {
                path: path.clone(),
                name: name.to_string(),
                content: content.to_string(),
            }));
            match self.position(name) {
                Some(index) => match &self.children[index] {
                    TreeNode::File(_) => next.children[index] = file,
                    TreeNode::Directory(_) => {
                        return Err(TreeError::Conflict {
                            path,
                            existing: "directory",
                        });
                    }
                },
                None => next.children.push(file),
            }
            return Ok(next);
        }

        match self.position(name) {
            Some(index) => match &self.children[index] {
                TreeNode::Directory(dir) => {
                    next.children[index] =
                        TreeNode::Directory(Arc::new(dir.with_file(rest, content)?));
                }
                TreeNode::File(_) => {
                    return Err(TreeError::Conflict {
                        path,
                        existing: "file",
                    });
                }
            },
            None => {
                let dir = DirectoryNode::empty(path, name.to_string()).with_file(rest, content)?;
                next.children.push(TreeNode::Directory(Arc::new(dir)));
            }
        }
        Ok(next)
    }

    /// Returns `None` when nothing under this directory matched.
    fn without(&self, segments: &[&str]) -> Option<Self> {
        let (name, rest) = segments.split_first()?;
        let index = self.position(name)?;
        let mut next = self.clone();

        if rest.is_empty() {
            next.children.remove(index);
            return Some(next);
        }

        match &self.children[index] {
            TreeNode::Directory(dir) => {
                next.children[index] = TreeNode::Directory(Arc::new(dir.without(rest)?));
                Some(next)
            }
            TreeNode::File(_) => None,
        }
    }
}

impl PartialEq for DirectoryNode {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.name == other.name
            && self.children.len() == other.children.len()
            && self.sorted_children() == other.sorted_children()
    }
}

impl Eq for DirectoryNode {}

/// Immutable tree rooted at `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VirtualTree {
    root: Arc<DirectoryNode>,
}

impl Default for VirtualTree {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self {
            root: Arc::new(DirectoryNode::root()),
        }
    }

    pub fn root(&self) -> &DirectoryNode {
        &self.root
    }

    /// Place a file at `path`, creating missing parent directories.
    ///
    /// An existing file at `path` is replaced where it stands. A directory at
    /// `path`, or a file where a parent directory is needed, is a
    /// [`TreeError::Conflict`].
    pub fn insert(&self, path: &str, content: &str) -> Result<Self, TreeError> {
        let segments = path_segments(path)?;
        let root = self.root.with_file(&segments, content)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    /// Remove the node at `path` with everything below it.
    ///
    /// Parents left empty stay in the tree. Removing a missing path returns
    /// the same tree; removing `/` clears it.
    pub fn remove(&self, path: &str) -> Result<Self, TreeError> {
        let segments = path_segments(path)?;
        if segments.is_empty() {
            return Ok(Self::new());
        }
        Ok(match self.root.without(&segments) {
            Some(root) => Self {
                root: Arc::new(root),
            },
            None => self.clone(),
        })
    }

    /// Build a tree from scratch, inserting paths in sorted order.
    pub fn rebuild(map: &WorkspaceMap) -> Result<Self, TreeError> {
        let mut paths: Vec<(&str, &str)> = map.iter().collect();
        paths.sort_by(|a, b| a.0.cmp(b.0));

        let mut tree = Self::new();
        for (path, content) in paths {
            tree = tree.insert(path, content)?;
        }
        Ok(tree)
    }

    /// Look up the node at `path`. The root path yields the root directory.
    pub fn get(&self, path: &str) -> Option<TreeNode> {
        let segments = path_segments(path).ok()?;
        let mut node = TreeNode::Directory(self.root.clone());
        for segment in segments {
            let next = match &node {
                TreeNode::Directory(dir) => dir.child(segment)?.clone(),
                TreeNode::File(_) => return None,
            };
            node = next;
        }
        Some(node)
    }

    pub fn file_count(&self) -> usize {
        fn count(dir: &DirectoryNode) -> usize {
            dir.children
                .iter()
                .map(|child| match child {
                    TreeNode::File(_) => 1,
                    TreeNode::Directory(sub) => count(sub),
                })
                .sum()
        }
        count(&self.root)
    }

    /// Every file path, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        fn collect(dir: &DirectoryNode, out: &mut Vec<String>) {
            for child in &dir.children {
                match child {
                    TreeNode::File(file) => out.push(file.path.clone()),
                    TreeNode::Directory(sub) => collect(sub, out),
                }
            }
        }
        let mut paths = Vec::new();
        collect(&self.root, &mut paths);
        paths.sort();
        paths
    }

    /// Box-drawing rendering for terminals, children sorted by name.
    pub fn render(&self) -> String {
        fn walk(dir: &DirectoryNode, prefix: &str, out: &mut String) {
            let children = dir.sorted_children();
            let last = children.len().saturating_sub(1);
            for (i, child) in children.into_iter().enumerate() {
                let (branch, indent) = if i == last {
                    ("└── ", "    ")
                } else {
                    ("├── ", "│   ")
                };
                match child {
                    TreeNode::File(file) => {
                        let _ = writeln!(out, "{prefix}{branch}{}", file.name);
                    }
                    TreeNode::Directory(sub) => {
                        let _ = writeln!(out, "{prefix}{branch}{}/", sub.name);
                        walk(sub, &format!("{prefix}{indent}"), out);
                    }
                }
            }
        }

        let mut out = String::from("/\n");
        walk(&self.root, "", &mut out);
        out
    }

    /// Whether `self` and `other` share the same root allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }
}
