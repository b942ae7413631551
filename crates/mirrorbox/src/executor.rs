//! Sequential action executor.
//!
//! A batch is applied strictly in order. Every action reports `pending`
//! followed by exactly one terminal status, and a failing action never stops
//! the actions after it. Once the batch is done the mirror is rebuilt from
//! the sandbox, because commands can change files the executor never saw.

use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast};

use mirrorbox_protocol::{
    Action, ActionRecord, ActionStatus, ActionValidationError, ProjectSummary, SandboxEvent,
    WorkspaceStatus, parse_actions,
};

use crate::bridge::RuntimeBridge;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::sandbox::SandboxProvider;
use crate::summary::WorkspaceSummaryBuilder;
use crate::tree::{TreeError, VirtualTree};
use crate::workspace::{WorkspaceMap, normalize_path};

/// Receives progress while a batch runs.
pub trait ActionObserver: Send {
    /// Called on every status transition with the full record.
    ///
    /// Every entry, including one rejected by validation, reports `pending`
    /// first and then exactly one terminal status.
    fn on_status(&mut self, record: &ActionRecord);

    /// Called for each chunk of command output.
    fn on_output(&mut self, _chunk: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ActionObserver for NoopObserver {
    fn on_status(&mut self, _record: &ActionRecord) {}
}

/// Read-only view of the mirror at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub files: Arc<WorkspaceMap>,
    pub tree: VirtualTree,
}

/// Result of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Final record of every submitted entry, in submission order.
    pub records: Vec<ActionRecord>,
    /// Set when the post-batch resync failed.
    pub sync_error: Option<String>,
}

impl BatchReport {
    pub fn statuses(&self) -> Vec<ActionStatus> {
        self.records.iter().map(|r| r.status).collect()
    }

    pub fn has_errors(&self) -> bool {
        self.records.iter().any(|r| r.status == ActionStatus::Error)
    }
}

/// Applies assistant actions against the sandbox and keeps the mirror.
#[derive(Debug)]
pub struct ActionExecutor {
    bridge: Arc<RuntimeBridge>,
    mirror: RwLock<Snapshot>,
    batch: Mutex<()>,
    summaries: WorkspaceSummaryBuilder,
}

impl ActionExecutor {
    pub fn new(bridge: Arc<RuntimeBridge>, config: &EngineConfig) -> Self {
        Self {
            bridge,
            mirror: RwLock::new(Snapshot::default()),
            batch: Mutex::new(()),
            summaries: WorkspaceSummaryBuilder::new(&config.workspace),
        }
    }

    /// Build a bridge around `provider` and an executor on top of it.
    pub fn with_provider(provider: Arc<dyn SandboxProvider>, config: &EngineConfig) -> Self {
        Self::new(Arc::new(RuntimeBridge::new(provider, config)), config)
    }

    pub fn bridge(&self) -> &Arc<RuntimeBridge> {
        &self.bridge
    }

    pub fn status(&self) -> WorkspaceStatus {
        self.bridge.status()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SandboxEvent> {
        self.bridge.subscribe_events()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Boot the sandbox (or reuse the live one) and rebuild the mirror.
    pub async fn boot(&self) -> EngineResult<Snapshot> {
        self.bridge.boot().await?;
        self.refresh().await
    }

    async fn ensure_booted(&self) -> EngineResult<()> {
        if self.bridge.is_booted().await {
            return Ok(());
        }
        self.bridge.boot().await?;
        if let Err(e) = self.refresh().await {
            warn!("Initial sync after boot failed: {e}");
        }
        Ok(())
    }

    /// Kill the active process, release the sandbox and clear the mirror.
    pub async fn teardown(&self) -> EngineResult<()> {
        self.bridge.teardown().await?;
        *self.mirror.write().await = Snapshot::default();
        Ok(())
    }

    pub async fn kill_active_process(&self) -> Option<i32> {
        self.bridge.kill_active().await
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Apply a batch of untrusted JSON entries.
    ///
    /// Entries that fail validation are recorded as errors in place; the
    /// others run normally.
    pub async fn apply_values(
        &self,
        values: &[Value],
        observer: &mut dyn ActionObserver,
    ) -> EngineResult<BatchReport> {
        self.run_batch(parse_actions(values), observer).await
    }

    /// Apply a batch of typed actions.
    pub async fn apply_actions(
        &self,
        actions: Vec<Action>,
        observer: &mut dyn ActionObserver,
    ) -> EngineResult<BatchReport> {
        let entries = actions
            .into_iter()
            .map(|action| action.validate().map(|()| action))
            .collect();
        self.run_batch(entries, observer).await
    }

    async fn run_batch(
        &self,
        entries: Vec<Result<Action, ActionValidationError>>,
        observer: &mut dyn ActionObserver,
    ) -> EngineResult<BatchReport> {
        let _batch = self.batch.lock().await;
        self.ensure_booted().await?;

        info!("Applying batch of {} actions", entries.len());
        let mut report = BatchReport::default();

        for (index, entry) in entries.into_iter().enumerate() {
            let record = match entry {
                Ok(action) => self.apply_one(index, action, observer).await,
                Err(err) => {
                    observer.on_status(&ActionRecord::unparsed(index));
                    warn!("Rejected action {index}: {err}");
                    let record = ActionRecord::rejected(index, &err);
                    observer.on_status(&record);
                    record
                }
            };
            report.records.push(record);
        }

        if let Err(e) = self.refresh().await {
            let message = e.user_message();
            warn!("Post-batch sync failed: {message}");
            report.sync_error = Some(message);
        }

        let failed = report
            .records
            .iter()
            .filter(|r| r.status == ActionStatus::Error)
            .count();
        info!(
            "Batch finished: {} succeeded, {} failed",
            report.records.len() - failed,
            failed
        );
        Ok(report)
    }

    async fn apply_one(
        &self,
        index: usize,
        action: Action,
        observer: &mut dyn ActionObserver,
    ) -> ActionRecord {
        let record = ActionRecord::pending(index, action.clone());
        observer.on_status(&record);
        debug!("Action {index}: {} {}", action.kind(), action.target());

        let result = match &action {
            Action::CreateOrUpdateFile { path, content } => self
                .create_or_update(path, content)
                .await
                .map(|()| record.clone().succeed("File written")),
            Action::DeletePath { path } => self
                .delete_path(path)
                .await
                .map(|()| record.clone().succeed("Deleted path")),
            Action::RunCommand { command, cwd } => {
                self.run_command(record.clone(), command, cwd.as_deref(), observer)
                    .await
            }
        };

        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let message = err.user_message();
                warn!("Action {index} ({}) failed: {message}", action.kind());
                record.fail(message)
            }
        };
        observer.on_status(&record);
        record
    }

    async fn create_or_update(&self, path: &str, content: &str) -> EngineResult<()> {
        let path = normalize_path(path)?;
        self.bridge.write_file(&path, content).await?;

        let mut mirror = self.mirror.write().await;
        let inserted = mirror.tree.insert(&path, content);
        match inserted {
            Ok(tree) => {
                Arc::make_mut(&mut mirror.files).insert(&path, content)?;
                mirror.tree = tree;
            }
            // Stale tree: a command reshaped this path. The write stands.
            Err(TreeError::Conflict { path: at, existing }) => {
                drop(mirror);
                debug!("Mirror has a {existing} at {at}, resyncing after write to {path}");
                if let Err(e) = self.refresh().await {
                    warn!("Resync after write to {path} failed: {e}");
                }
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> EngineResult<()> {
        let path = normalize_path(path)?;
        self.bridge.remove(&path, true).await?;

        let mut mirror = self.mirror.write().await;
        let tree = mirror.tree.remove(&path)?;
        Arc::make_mut(&mut mirror.files).remove_path(&path)?;
        mirror.tree = tree;
        Ok(())
    }

    async fn run_command(
        &self,
        record: ActionRecord,
        command: &str,
        cwd: Option<&str>,
        observer: &mut dyn ActionObserver,
    ) -> EngineResult<ActionRecord> {
        let stream = self.bridge.spawn(command, cwd).await?;
        let outcome = stream.run(|chunk| observer.on_output(chunk)).await;

        let message = format!("Exited with code {}", outcome.exit_code);
        let success = outcome.success();
        let mut record = if success {
            record.succeed(message)
        } else {
            record.fail(message)
        };
        record.output = Some(outcome.output);
        record.exit_code = Some(outcome.exit_code);
        Ok(record)
    }

    // ========================================================================
    // Mirror
    // ========================================================================

    /// Rebuild the map and tree from a fresh read of the sandbox.
    pub async fn refresh(&self) -> EngineResult<Snapshot> {
        let files = self.bridge.read_all_files().await?;
        let tree = VirtualTree::rebuild(&files)?;
        let file_count = files.len();

        let snapshot = Snapshot {
            files: Arc::new(files),
            tree,
        };
        *self.mirror.write().await = snapshot.clone();

        debug!("Mirror rebuilt with {file_count} files");
        self.bridge.publish(SandboxEvent::Synced { file_count });
        Ok(snapshot)
    }

    /// Save a file from an editor: write it, mirror it, then resync.
    pub async fn write_file(&self, path: &str, content: &str) -> EngineResult<Snapshot> {
        self.ensure_booted().await?;
        self.create_or_update(path, content).await?;
        self.refresh().await
    }

    /// Current content of `path` according to the mirror.
    pub async fn file_content(&self, path: &str) -> Option<String> {
        self.mirror
            .read()
            .await
            .files
            .get(path)
            .map(str::to_string)
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.mirror.read().await.clone()
    }

    pub async fn summary(&self) -> ProjectSummary {
        let files = self.mirror.read().await.files.clone();
        self.summaries.build(&files)
    }

    /// Prompt-ready text describing the project.
    pub async fn context_summary(&self) -> String {
        let summary = self.summary().await;
        self.summaries.context_summary(&summary)
    }
}
