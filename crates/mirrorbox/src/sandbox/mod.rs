//! Sandbox runtime abstraction.
//!
//! A [`SandboxProvider`] boots a [`Sandbox`]: a private filesystem plus the
//! ability to spawn shell commands inside it. The engine only ever talks to
//! these traits; [`LocalSandbox`] is the shipped implementation and runs
//! commands on the host, optionally inside bubblewrap.
//!
//! Paths passed to a sandbox are relative to its root (no leading slash).
//! Normalization happens in the bridge before calls reach this layer.

mod error;
mod isolation;
mod local;

pub use error::{SandboxError, SandboxResult};
pub use isolation::{IsolationMode, bwrap_available, shell_available};
pub use local::{LocalProvider, LocalSandbox};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::BootError;

/// One directory entry returned by [`Sandbox::list_directory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Final path segment.
    pub name: String,
    pub is_dir: bool,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
        }
    }
}

/// A process spawned inside the sandbox.
///
/// `output` yields chunks in the order the process produced them and closes
/// once the process has no more output. `exit` turns `Some(code)` when the
/// process has terminated. Cancelling `kill` terminates the process without a
/// grace period.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub output: mpsc::Receiver<Bytes>,
    pub exit: watch::Receiver<Option<i32>>,
    pub kill: CancellationToken,
}

impl SpawnedProcess {
    /// Handle that can terminate this process and wait for it to be gone.
    pub fn killer(&self) -> ProcessKiller {
        ProcessKiller {
            pid: self.pid,
            token: self.kill.clone(),
            exit: self.exit.clone(),
        }
    }
}

/// Kill handle retained by the bridge for the active process.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    pub pid: Option<u32>,
    token: CancellationToken,
    exit: watch::Receiver<Option<i32>>,
}

impl ProcessKiller {
    /// Whether the process has already terminated.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Kill the process and wait until it has terminated.
    ///
    /// Returns the exit code, or `None` if the process went away without
    /// reporting one.
    pub async fn kill(mut self) -> Option<i32> {
        self.token.cancel();
        match self.exit.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        }
    }
}

/// Filesystem and process capabilities of a booted sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync + std::fmt::Debug {
    /// Read a file as UTF-8 text.
    async fn read_file(&self, path: &str) -> SandboxResult<String>;

    /// Write a file. The parent directory must already exist.
    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()>;

    /// Create a single directory.
    ///
    /// Fails with [`SandboxError::AlreadyExists`] when it exists; callers
    /// that want idempotence ignore that variant.
    async fn mkdir(&self, path: &str) -> SandboxResult<()>;

    /// Remove a file or directory. Directories need `recursive`.
    async fn remove(&self, path: &str, recursive: bool) -> SandboxResult<()>;

    /// List a directory. The empty path is the sandbox root.
    async fn list_directory(&self, path: &str) -> SandboxResult<Vec<DirEntry>>;

    /// Spawn `command` through the sandbox shell.
    async fn spawn(&self, command: &str, cwd: Option<&str>) -> SandboxResult<SpawnedProcess>;

    /// Release the sandbox. Processes must already be stopped.
    async fn teardown(&self) -> SandboxResult<()>;
}

/// Boots sandboxes. One provider backs one bridge.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, BootError>;
}
