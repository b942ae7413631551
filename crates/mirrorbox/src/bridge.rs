//! Runtime bridge.
//!
//! Owns the single sandbox handle of a workspace session. Boot is shared:
//! the first caller starts the boot and everyone arriving while it runs
//! awaits the same future. A failed boot is forgotten so the next call
//! retries, and a teardown invalidates any boot still in flight.
//!
//! All capability calls take workspace paths (`/src/main.js`) and translate
//! them to sandbox paths.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};

use mirrorbox_protocol::{SandboxEvent, WorkspaceStatus};

use crate::config::EngineConfig;
use crate::error::{BootError, EngineError, EngineResult, normalize_message};
use crate::process::ProcessStream;
use crate::sandbox::{DirEntry, ProcessKiller, Sandbox, SandboxError, SandboxProvider};
use crate::workspace::{WorkspaceMap, join_path, path_segments, sandbox_path};

type BootFuture = Shared<BoxFuture<'static, Result<Arc<dyn Sandbox>, BootError>>>;

#[derive(Default)]
struct BootState {
    handle: Option<Arc<dyn Sandbox>>,
    in_flight: Option<(u64, BootFuture)>,
    next_attempt: u64,
    /// Bumped by every teardown.
    generation: u64,
}

/// Owner of the sandbox handle and the active process.
pub struct RuntimeBridge {
    provider: Arc<dyn SandboxProvider>,
    ignored_dirs: Vec<String>,
    state: Mutex<BootState>,
    active: Mutex<Option<ProcessKiller>>,
    events: broadcast::Sender<SandboxEvent>,
    status: watch::Sender<WorkspaceStatus>,
}

impl std::fmt::Debug for RuntimeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBridge")
            .field("ignored_dirs", &self.ignored_dirs)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl RuntimeBridge {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.workspace.event_buffer.max(1));
        let (status, _) = watch::channel(WorkspaceStatus::Idle);
        Self {
            provider,
            ignored_dirs: config.sandbox.ignored_dirs.clone(),
            state: Mutex::new(BootState::default()),
            active: Mutex::new(None),
            events,
            status,
        }
    }

    /// Subscribe to runtime events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Sender<SandboxEvent> {
        self.events.clone()
    }

    pub(crate) fn publish(&self, event: SandboxEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn status(&self) -> WorkspaceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WorkspaceStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: WorkspaceStatus) {
        if *self.status.borrow() == status {
            return;
        }
        debug!("Workspace status -> {}", status.label());
        self.status.send_replace(status.clone());
        self.publish(SandboxEvent::Status { status });
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Return the live sandbox, booting it if necessary.
    pub async fn boot(&self) -> Result<Arc<dyn Sandbox>, BootError> {
        let (attempt, generation, boot) = {
            let mut state = self.state.lock().await;
            if let Some(handle) = &state.handle {
                return Ok(handle.clone());
            }
            match &state.in_flight {
                Some((attempt, boot)) => {
                    debug!("Joining in-flight boot attempt {attempt}");
                    (*attempt, state.generation, boot.clone())
                }
                None => {
                    let attempt = state.next_attempt;
                    state.next_attempt += 1;
                    info!("Starting sandbox boot attempt {attempt}");

                    let provider = self.provider.clone();
                    let boot = async move { provider.boot().await }.boxed().shared();
                    state.in_flight = Some((attempt, boot.clone()));
                    self.set_status(WorkspaceStatus::Booting);
                    (attempt, state.generation, boot)
                }
            }
        };

        let result = boot.await;

        let mut state = self.state.lock().await;
        let owns_attempt = matches!(&state.in_flight, Some((a, _)) if *a == attempt);

        if state.generation != generation {
            drop(state);
            if let Ok(stale) = result {
                warn!("Boot attempt {attempt} finished after teardown, releasing it");
                if let Err(e) = stale.teardown().await {
                    debug!("Releasing superseded sandbox failed: {e}");
                }
            }
            return Err(BootError::Superseded);
        }

        if owns_attempt {
            state.in_flight = None;
        }

        match result {
            Ok(handle) => {
                let handle = state.handle.get_or_insert(handle).clone();
                drop(state);
                self.set_status(WorkspaceStatus::Ready);
                Ok(handle)
            }
            Err(err) => {
                let err = match err {
                    BootError::Failed(message) => BootError::Failed(normalize_message(&message)),
                    other => other,
                };
                drop(state);
                error!("Sandbox boot failed: {err}");
                self.set_status(WorkspaceStatus::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Kill the active process, release the sandbox and forget any boot.
    pub async fn teardown(&self) -> EngineResult<()> {
        if let Some(code) = self.kill_active().await {
            info!("Killed active process during teardown (exit code {code})");
        }

        let handle = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.in_flight = None;
            state.handle.take()
        };
        self.set_status(WorkspaceStatus::Idle);

        match handle {
            Some(handle) => {
                info!("Tearing down sandbox");
                handle
                    .teardown()
                    .await
                    .map_err(|e| EngineError::Teardown(normalize_message(&e.to_string())))
            }
            None => Ok(()),
        }
    }

    /// Whether a sandbox handle is live.
    pub async fn is_booted(&self) -> bool {
        self.state.lock().await.handle.is_some()
    }

    async fn sandbox(&self) -> EngineResult<Arc<dyn Sandbox>> {
        self.state
            .lock()
            .await
            .handle
            .clone()
            .ok_or(EngineError::NotBooted)
    }

    // ========================================================================
    // Filesystem
    // ========================================================================

    pub async fn read_file(&self, path: &str) -> EngineResult<String> {
        let sandbox = self.sandbox().await?;
        let target = sandbox_path(path)?;
        sandbox
            .read_file(&target)
            .await
            .map_err(|e| EngineError::read(path, e))
    }

    /// Write a file, creating any missing parent directories first.
    pub async fn write_file(&self, path: &str, content: &str) -> EngineResult<()> {
        let sandbox = self.sandbox().await?;
        let segments = path_segments(path)?;
        let Some((_, parents)) = segments.split_last() else {
            return Err(EngineError::InvalidPath(path.to_string()));
        };
        ensure_dirs(sandbox.as_ref(), parents)
            .await
            .map_err(|e| EngineError::write(path, e))?;
        sandbox
            .write_file(&segments.join("/"), content)
            .await
            .map_err(|e| EngineError::write(path, e))
    }

    /// Create a directory and its missing parents. Existing ones are fine.
    pub async fn mkdir(&self, path: &str) -> EngineResult<()> {
        let sandbox = self.sandbox().await?;
        let segments = path_segments(path)?;
        ensure_dirs(sandbox.as_ref(), &segments)
            .await
            .map_err(|e| EngineError::write(path, e))
    }

    pub async fn remove(&self, path: &str, recursive: bool) -> EngineResult<()> {
        let sandbox = self.sandbox().await?;
        let target = sandbox_path(path)?;
        if target.is_empty() {
            return Err(EngineError::InvalidPath(path.to_string()));
        }
        sandbox
            .remove(&target, recursive)
            .await
            .map_err(|e| EngineError::delete(path, e))
    }

    pub async fn list_directory(&self, path: &str) -> EngineResult<Vec<DirEntry>> {
        let sandbox = self.sandbox().await?;
        let target = sandbox_path(path)?;
        sandbox
            .list_directory(&target)
            .await
            .map_err(|e| EngineError::read(path, e))
    }

    /// Read every text file in the sandbox into a fresh map.
    ///
    /// Ignored directory names are skipped wherever they appear, as are
    /// files that are not valid UTF-8.
    pub async fn read_all_files(&self) -> EngineResult<WorkspaceMap> {
        let sandbox = self.sandbox().await?;
        let mut files = WorkspaceMap::new();
        let mut pending = vec!["/".to_string()];

        while let Some(dir) = pending.pop() {
            let target = sandbox_path(&dir)?;
            let entries = sandbox
                .list_directory(&target)
                .await
                .map_err(|e| EngineError::read(&dir, e))?;

            for entry in entries {
                let path = join_path(&dir, &entry.name);
                if entry.is_dir {
                    if self.ignored_dirs.iter().any(|name| *name == entry.name) {
                        continue;
                    }
                    pending.push(path);
                    continue;
                }
                match sandbox.read_file(&sandbox_path(&path)?).await {
                    Ok(content) => files.insert(&path, content)?,
                    Err(SandboxError::NotText(_)) => debug!("Skipping binary file {path}"),
                    Err(SandboxError::NotFound(_)) => debug!("{path} vanished during walk"),
                    Err(e) => return Err(EngineError::read(&path, e)),
                }
            }
        }

        debug!("Read {} files from sandbox", files.len());
        Ok(files)
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Start `command`, killing whatever command was running before.
    pub async fn spawn(&self, command: &str, cwd: Option<&str>) -> EngineResult<ProcessStream> {
        let sandbox = self.sandbox().await?;
        let cwd = match cwd {
            Some(cwd) => Some(sandbox_path(cwd)?),
            None => None,
        };

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if !previous.has_exited() {
                info!("Killing previous process {:?}", previous.pid);
            }
            previous.kill().await;
        }

        let process = sandbox
            .spawn(command, cwd.as_deref())
            .await
            .map_err(|e| EngineError::ProcessFailure {
                command: command.to_string(),
                message: normalize_message(&e.to_string()),
            })?;

        *active = Some(process.killer());
        drop(active);

        self.publish(SandboxEvent::ProcessStarted {
            pid: process.pid,
            command: command.to_string(),
        });
        Ok(ProcessStream::new(process, command, self.events()))
    }

    /// Kill the active process, if any, and wait for it to exit.
    pub async fn kill_active(&self) -> Option<i32> {
        let killer = self.active.lock().await.take()?;
        if killer.has_exited() {
            return None;
        }
        debug!("Killing active process {:?}", killer.pid);
        killer.kill().await
    }

    /// Whether a spawned process is still running.
    pub async fn has_active_process(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|killer| !killer.has_exited())
    }
}

/// Create each directory along `segments`, tolerating ones that exist.
async fn ensure_dirs(sandbox: &dyn Sandbox, segments: &[&str]) -> Result<(), SandboxError> {
    let mut current = String::new();
    for segment in segments {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        match sandbox.mkdir(&current).await {
            Ok(()) => debug!("Created directory /{current}"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
