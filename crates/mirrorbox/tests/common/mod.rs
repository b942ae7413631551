//! Test utilities: an in-memory sandbox with scripted commands.
//!
//! Commands understood by [`ScriptedSandbox::spawn`] are `;`-separated steps:
//!
//! - `echo TEXT`: print `TEXT` and a newline
//! - `write PATH TEXT`: create or replace a file
//! - `rm PATH`: delete a file or directory
//! - `serve PORT`: announce a dev server on `PORT` and block until killed
//! - `hang`: block until killed
//! - `exit N`: stop with exit code `N`
//!
//! Unknown steps print `command not found` and exit with 127.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use mirrorbox::protocol::ActionRecord;
use mirrorbox::sandbox::{
    DirEntry, Sandbox, SandboxError, SandboxProvider, SandboxResult, SpawnedProcess,
};
use mirrorbox::{ActionExecutor, ActionObserver, BootError, EngineConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Entry {
    File(String),
    Dir,
}

/// Filesystem shared by every sandbox a provider boots.
#[derive(Debug, Default)]
pub struct MemoryFs {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryFs {
    fn parent_exists(entries: &BTreeMap<String, Entry>, path: &str) -> bool {
        match path.rsplit_once('/') {
            None => true,
            Some((parent, _)) => matches!(entries.get(parent), Some(Entry::Dir)),
        }
    }

    pub fn write(&self, path: &str, content: &str) -> SandboxResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if !Self::parent_exists(&entries, path) {
            return Err(SandboxError::NotFound(path.to_string()));
        }
        if matches!(entries.get(path), Some(Entry::Dir)) {
            return Err(SandboxError::WrongKind(path.to_string()));
        }
        entries.insert(path.to_string(), Entry::File(content.to_string()));
        Ok(())
    }

    /// Create a file along with all of its parent directories.
    pub fn seed(&self, path: &str, content: &str) {
        let mut entries = self.entries.lock().unwrap();
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len() - 1] {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            entries.entry(current.clone()).or_insert(Entry::Dir);
        }
        entries.insert(path.to_string(), Entry::File(content.to_string()));
    }

    pub fn read(&self, path: &str) -> Option<String> {
        match self.entries.lock().unwrap().get(path) {
            Some(Entry::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.entries.lock().unwrap().get(path), Some(Entry::Dir))
    }

    fn remove(&self, path: &str) -> SandboxResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(path).is_none() {
            return Err(SandboxError::NotFound(path.to_string()));
        }
        let prefix = format!("{path}/");
        entries.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}

/// One observable thing a sandbox did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trace {
    Spawned(u32, String),
    Killed(u32),
    Exited(u32, i32),
}

/// Shared record of process activity across sandboxes.
#[derive(Debug, Default)]
pub struct ProcessLog {
    trace: Mutex<Vec<Trace>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    next_pid: AtomicU32,
}

impl ProcessLog {
    pub fn trace(&self) -> Vec<Trace> {
        self.trace.lock().unwrap().clone()
    }

    /// Highest number of processes that were alive at the same time.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn push(&self, entry: Trace) {
        self.trace.lock().unwrap().push(entry);
    }
}

#[derive(Debug)]
pub struct ScriptedSandbox {
    pub id: usize,
    fs: Arc<MemoryFs>,
    log: Arc<ProcessLog>,
    torn_down: AtomicBool,
}

impl ScriptedSandbox {
    fn check(&self) -> SandboxResult<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SandboxError::TornDown);
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        self.check()?;
        self.fs
            .read(path)
            .ok_or_else(|| SandboxError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        self.check()?;
        self.fs.write(path, content)
    }

    async fn mkdir(&self, path: &str) -> SandboxResult<()> {
        self.check()?;
        let mut entries = self.fs.entries.lock().unwrap();
        if entries.contains_key(path) {
            return Err(SandboxError::AlreadyExists(path.to_string()));
        }
        if !MemoryFs::parent_exists(&entries, path) {
            return Err(SandboxError::NotFound(path.to_string()));
        }
        entries.insert(path.to_string(), Entry::Dir);
        Ok(())
    }

    async fn remove(&self, path: &str, _recursive: bool) -> SandboxResult<()> {
        self.check()?;
        self.fs.remove(path)
    }

    async fn list_directory(&self, path: &str) -> SandboxResult<Vec<DirEntry>> {
        self.check()?;
        let entries = self.fs.entries.lock().unwrap();
        if !path.is_empty() && !matches!(entries.get(path), Some(Entry::Dir)) {
            return Err(SandboxError::NotFound(path.to_string()));
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        Ok(entries
            .iter()
            .filter_map(|(key, entry)| {
                let name = key.strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                Some(match entry {
                    Entry::Dir => DirEntry::directory(name),
                    Entry::File(_) => DirEntry::file(name),
                })
            })
            .collect())
    }

    async fn spawn(&self, command: &str, _cwd: Option<&str>) -> SandboxResult<SpawnedProcess> {
        self.check()?;
        if command.trim() == "unstartable" {
            return Err(SandboxError::NotFound("unstartable".to_string()));
        }

        let pid = self.log.next_pid.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.log.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_live.fetch_max(live, Ordering::SeqCst);
        self.log.push(Trace::Spawned(pid, command.to_string()));

        let (out_tx, out_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        let steps: Vec<String> = command.split(';').map(|s| s.trim().to_string()).collect();
        let fs = self.fs.clone();
        let log = self.log.clone();
        let token = kill.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                code = run_steps(&steps, &fs, &out_tx) => code,
                _ = token.cancelled() => {
                    log.push(Trace::Killed(pid));
                    137
                }
            };
            drop(out_tx);
            log.live.fetch_sub(1, Ordering::SeqCst);
            log.push(Trace::Exited(pid, code));
            exit_tx.send_replace(Some(code));
        });

        Ok(SpawnedProcess {
            pid: Some(pid),
            output: out_rx,
            exit: exit_rx,
            kill,
        })
    }

    async fn teardown(&self) -> SandboxResult<()> {
        self.torn_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn run_steps(steps: &[String], fs: &MemoryFs, out: &mpsc::Sender<Bytes>) -> i32 {
    for step in steps {
        let (verb, rest) = step.split_once(' ').unwrap_or((step.as_str(), ""));
        match verb {
            "" => {}
            "echo" => {
                let _ = out.send(Bytes::from(format!("{rest}\n"))).await;
            }
            "write" => {
                let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
                fs.seed(path.trim_start_matches('/'), text);
            }
            "rm" => {
                let _ = fs.remove(rest.trim_start_matches('/'));
            }
            "serve" => {
                let line = format!("  ➜  Local:   http://localhost:{rest}/\n");
                let _ = out.send(Bytes::from(line)).await;
                std::future::pending::<()>().await;
            }
            "hang" => std::future::pending::<()>().await,
            "exit" => return rest.trim().parse().unwrap_or(1),
            other => {
                let _ = out
                    .send(Bytes::from(format!("{other}: command not found\n")))
                    .await;
                return 127;
            }
        }
    }
    0
}

/// Provider that counts boots and can be paused or made to fail.
#[derive(Debug, Default)]
pub struct CountingProvider {
    pub fs: Arc<MemoryFs>,
    pub log: Arc<ProcessLog>,
    boots: AtomicUsize,
    fail_next: AtomicUsize,
    gate: Option<Arc<Notify>>,
    delay: Option<Duration>,
}

impl CountingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every boot waits for a `notify_one` permit on the returned handle.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                gate: Some(gate.clone()),
                ..Self::default()
            },
            gate,
        )
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make the next `count` boots fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for CountingProvider {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, BootError> {
        let id = self.boots.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BootError::Failed(format!(
                "boot {id} failed\nstack backtrace:\n   0: std::rt::lang_start"
            )));
        }

        Ok(Arc::new(ScriptedSandbox {
            id,
            fs: self.fs.clone(),
            log: self.log.clone(),
            torn_down: AtomicBool::new(false),
        }))
    }
}

/// Observer that keeps everything it is told.
#[derive(Debug, Default)]
pub struct Recorder {
    pub statuses: Vec<ActionRecord>,
    pub output: String,
}

impl ActionObserver for Recorder {
    fn on_status(&mut self, record: &ActionRecord) {
        self.statuses.push(record.clone());
    }

    fn on_output(&mut self, chunk: &str) {
        self.output.push_str(chunk);
    }
}

/// Executor over a fresh [`CountingProvider`].
pub fn executor() -> (Arc<ActionExecutor>, Arc<CountingProvider>) {
    let provider = Arc::new(CountingProvider::new());
    let executor = ActionExecutor::with_provider(provider.clone(), &EngineConfig::default());
    (Arc::new(executor), provider)
}
