//! Local sandbox implementation.
//!
//! The sandbox is a directory on the host. Files are accessed with
//! `tokio::fs` relative to that root and commands are spawned through a login
//! shell, inside bubblewrap when it is enabled.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, warn};
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::isolation::{self, build_bwrap_args, shell_available};
use super::{DirEntry, Sandbox, SandboxError, SandboxProvider, SandboxResult, SpawnedProcess};
use crate::config::SandboxConfig;
use crate::error::BootError;

/// Chunks buffered between the pipe readers and the consumer.
const OUTPUT_CHANNEL_SIZE: usize = 64;

/// How long to wait for pipe readers after the process has exited.
///
/// Background jobs can inherit the pipes and keep them open forever.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Files written into an empty workspace on first boot.
const STARTER_FILES: &[(&str, &str)] = &[
    (
        "package.json",
        r#"{
  "name": "mirrorbox-project",
  "version": "1.0.0",
  "private": true,
  "type": "module",
  "scripts": {
    "dev": "vite --host",
    "build": "vite build",
    "preview": "vite preview --host"
  },
  "dependencies": {},
  "devDependencies": {}
}
"#,
    ),
    (
        "README.md",
        "# Welcome to your mirrorbox workspace\n\n- Ask the assistant to scaffold a project\n- Run commands such as `npm install` or `npm run dev`\n- Open the preview once a dev server boots\n",
    ),
    ("src/index.js", "console.log('Hello from mirrorbox!');\n"),
];

/// Boots [`LocalSandbox`] instances rooted at one host directory.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
    config: SandboxConfig,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>, config: SandboxConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check host preconditions. Runs blocking probes.
    fn check_environment(config: &SandboxConfig) -> Result<bool, BootError> {
        if !shell_available(&config.shell) {
            return Err(BootError::EnvironmentUnsupported {
                reason: format!("shell `{}` is not available", config.shell),
                remediation: format!(
                    "Install `{}` or set `sandbox.shell` in the config file to a POSIX shell that exists on this host.",
                    config.shell
                ),
            });
        }

        isolation::resolve(config.isolation).map_err(|reason| BootError::EnvironmentUnsupported {
            reason,
            remediation: "Install bubblewrap (for example `apt install bubblewrap`), or set `sandbox.isolation` to \"auto\" or \"none\" in the config file.".to_string(),
        })
    }

    async fn seed(&self) -> Result<(), BootError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| BootError::Failed(format!("reading {}: {e}", self.root.display())))?;
        let is_empty = entries
            .next_entry()
            .await
            .map_err(|e| BootError::Failed(format!("reading {}: {e}", self.root.display())))?
            .is_none();
        if !is_empty {
            debug!("Workspace {} is not empty, skipping seed", self.root.display());
            return Ok(());
        }

        for (path, content) in STARTER_FILES {
            let full = self.root.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BootError::Failed(format!("seeding {path}: {e}")))?;
            }
            fs::write(&full, content)
                .await
                .map_err(|e| BootError::Failed(format!("seeding {path}: {e}")))?;
        }
        info!(
            "Seeded {} starter files into {}",
            STARTER_FILES.len(),
            self.root.display()
        );
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, BootError> {
        info!("Booting local sandbox at {}", self.root.display());

        let config = self.config.clone();
        let use_bwrap = tokio::task::spawn_blocking(move || Self::check_environment(&config))
            .await
            .map_err(|e| BootError::Failed(format!("environment probe panicked: {e}")))??;

        fs::create_dir_all(&self.root).await.map_err(|e| {
            BootError::Failed(format!("creating workspace {}: {e}", self.root.display()))
        })?;
        let root = fs::canonicalize(&self.root).await.map_err(|e| {
            BootError::Failed(format!("resolving workspace {}: {e}", self.root.display()))
        })?;

        if self.config.seed_template {
            self.seed().await?;
        }

        info!(
            "Local sandbox ready at {} (bwrap: {})",
            root.display(),
            use_bwrap
        );
        Ok(Arc::new(LocalSandbox {
            root,
            shell: self.config.shell.clone(),
            use_bwrap,
            isolate_network: self.config.isolate_network,
            terminal: (self.config.terminal_cols, self.config.terminal_rows),
            torn_down: AtomicBool::new(false),
        }))
    }
}

/// A booted sandbox rooted at a host directory.
#[derive(Debug)]
pub struct LocalSandbox {
    root: PathBuf,
    shell: String,
    use_bwrap: bool,
    isolate_network: bool,
    terminal: (u16, u16),
    torn_down: AtomicBool,
}

impl LocalSandbox {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a sandbox-relative path, refusing anything that escapes root.
    ///
    /// The check is lexical; [`Self::confined`] also resolves symlinks.
    fn full_path(&self, path: &str) -> SandboxResult<PathBuf> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SandboxError::TornDown);
        }
        let relative = Path::new(path.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(SandboxError::InvalidPath(path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    /// Like [`Self::full_path`], but also rejects paths whose existing
    /// ancestors resolve outside the root through a symlink.
    ///
    /// With `follow_last` unset the final component is not resolved, so a
    /// link itself can still be removed.
    async fn confined(&self, path: &str, follow_last: bool) -> SandboxResult<PathBuf> {
        let full = self.full_path(path)?;
        let escape =
            || SandboxError::InvalidPath(format!("{path} resolves outside the workspace"));

        let mut probe = if follow_last || full == self.root {
            full.as_path()
        } else {
            full.parent().unwrap_or(self.root.as_path())
        };
        let resolved = loop {
            match fs::canonicalize(probe).await {
                Ok(resolved) => break resolved,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // A dangling link would be followed by the write.
                    if fs::symlink_metadata(probe).await.is_ok() {
                        return Err(escape());
                    }
                    match probe.parent() {
                        Some(parent) if parent.starts_with(&self.root) => probe = parent,
                        _ => return Err(escape()),
                    }
                }
                Err(e) => return Err(SandboxError::from_io(path, e)),
            }
        };

        if !resolved.starts_with(&self.root) {
            warn!("Refusing {path}: resolves to {}", resolved.display());
            return Err(escape());
        }
        Ok(full)
    }

    fn build_command(&self, command: &str, cwd: &Path) -> Command {
        let script = format!("exec 2>&1\n{command}");
        let mut cmd = if self.use_bwrap {
            let mut cmd = Command::new("bwrap");
            cmd.args(build_bwrap_args(&self.root, cwd, self.isolate_network));
            cmd.arg(&self.shell);
            cmd
        } else {
            Command::new(&self.shell)
        };
        cmd.arg("-lc")
            .arg(script)
            .current_dir(cwd)
            .env("COLUMNS", self.terminal.0.to_string())
            .env("LINES", self.terminal.1.to_string())
            .env("TERM", "xterm-256color")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn read_file(&self, path: &str) -> SandboxResult<String> {
        let full_path = self.confined(path, true).await?;
        fs::read_to_string(&full_path)
            .await
            .map_err(|e| SandboxError::from_io(path, e))
    }

    async fn write_file(&self, path: &str, content: &str) -> SandboxResult<()> {
        let full_path = self.confined(path, true).await?;
        fs::write(&full_path, content)
            .await
            .map_err(|e| SandboxError::from_io(path, e))?;
        debug!("Wrote {} bytes to {}", content.len(), full_path.display());
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> SandboxResult<()> {
        let full_path = self.confined(path, true).await?;
        fs::create_dir(&full_path)
            .await
            .map_err(|e| SandboxError::from_io(path, e))?;
        debug!("Created directory {}", full_path.display());
        Ok(())
    }

    async fn remove(&self, path: &str, recursive: bool) -> SandboxResult<()> {
        let full_path = self.confined(path, false).await?;
        if full_path == self.root {
            return Err(SandboxError::InvalidPath(
                "refusing to remove the workspace root".to_string(),
            ));
        }

        let meta = fs::symlink_metadata(&full_path)
            .await
            .map_err(|e| SandboxError::from_io(path, e))?;

        let result = if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&full_path).await
            } else {
                fs::remove_dir(&full_path).await
            }
        } else {
            fs::remove_file(&full_path).await
        };
        result.map_err(|e| SandboxError::from_io(path, e))?;

        debug!("Deleted {}", full_path.display());
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> SandboxResult<Vec<DirEntry>> {
        let full_path = self.confined(path, true).await?;
        let mut read_dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| SandboxError::from_io(path, e))?;

        let mut entries = vec![];
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| SandboxError::from_io(path, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| SandboxError::from_io(path, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if file_type.is_dir() {
                entries.push(DirEntry::directory(name));
            } else if file_type.is_file() {
                entries.push(DirEntry::file(name));
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn spawn(&self, command: &str, cwd: Option<&str>) -> SandboxResult<SpawnedProcess> {
        let cwd_path = self.confined(cwd.unwrap_or(""), true).await?;
        let meta = fs::metadata(&cwd_path)
            .await
            .map_err(|e| SandboxError::from_io(cwd.unwrap_or("/"), e))?;
        if !meta.is_dir() {
            return Err(SandboxError::WrongKind(format!(
                "{} is not a directory",
                cwd.unwrap_or("/")
            )));
        }

        let mut child = self.build_command(command, &cwd_path).spawn()?;
        let pid = child.id();
        info!("Spawned `{}` with PID {:?}", command, pid);

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, out_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, out_tx)));
        }

        tokio::spawn(supervise(child, pid, kill.clone(), readers, exit_tx));

        Ok(SpawnedProcess {
            pid,
            output: out_rx,
            exit: exit_rx,
            kill,
        })
    }

    async fn teardown(&self) -> SandboxResult<()> {
        self.torn_down.store(true, Ordering::SeqCst);
        info!("Local sandbox at {} released", self.root.display());
        Ok(())
    }
}

/// Forward one pipe into the output channel until EOF.
async fn pump<R>(reader: R, tx: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut stream = ReaderStream::new(reader);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Process output pipe closed with error: {e}");
                break;
            }
        }
    }
}

/// Wait for the process (or a kill request), then publish its exit code.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    readers: Vec<tokio::task::JoinHandle<()>>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };

    let status = match finished {
        Some(status) => status,
        None => {
            debug!("Killing process {:?}", pid);
            kill_process_group(pid);
            if let Err(e) = child.start_kill() {
                debug!("start_kill for {:?} failed: {e}", pid);
            }
            child.wait().await
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
            warn!("Output of process {:?} still open after exit, detaching", pid);
            reader.abort();
        }
    }

    let code = exit_code(status);
    debug!("Process {:?} exited with code {}", pid, code);
    exit_tx.send_replace(Some(code));
}

/// Kill the whole process group so shell children die with the shell.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) with a negative pid signals the process group we created.
        let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        if rc != 0 {
            debug!(
                "Signalling process group {pid} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

fn exit_code(status: std::io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => status.code().or_else(|| signal_code(&status)).unwrap_or(-1),
        Err(e) => {
            warn!("Error waiting for process: {e}");
            -1
        }
    }
}

#[cfg(unix)]
fn signal_code(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| 128 + sig)
}

#[cfg(not(unix))]
fn signal_code(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> SandboxConfig {
        SandboxConfig {
            shell: "sh".to_string(),
            isolation: isolation::IsolationMode::None,
            seed_template: false,
            ..SandboxConfig::default()
        }
    }

    async fn boot(root: &Path) -> Arc<dyn Sandbox> {
        LocalProvider::new(root, test_config()).boot().await.unwrap()
    }

    async fn collect(mut process: SpawnedProcess) -> (String, Option<i32>) {
        let mut output = Vec::new();
        while let Some(chunk) = process.output.recv().await {
            output.extend_from_slice(&chunk);
        }
        let code = *process.exit.wait_for(Option::is_some).await.unwrap();
        (String::from_utf8_lossy(&output).to_string(), code)
    }

    #[tokio::test]
    async fn test_file_round_trip_and_listing() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;

        sandbox.mkdir("src").await.unwrap();
        assert!(sandbox.mkdir("src").await.unwrap_err().is_already_exists());

        sandbox.write_file("src/main.js", "hi").await.unwrap();
        assert_eq!(sandbox.read_file("src/main.js").await.unwrap(), "hi");

        let entries = sandbox.list_directory("").await.unwrap();
        assert_eq!(entries, vec![DirEntry::directory("src")]);
        let entries = sandbox.list_directory("src").await.unwrap();
        assert_eq!(entries, vec![DirEntry::file("main.js")]);
    }

    #[tokio::test]
    async fn test_write_requires_parent() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;
        let err = sandbox.write_file("a/b.txt", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_semantics() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;

        let err = sandbox.remove("missing.txt", true).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));

        sandbox.mkdir("d").await.unwrap();
        sandbox.write_file("d/f", "x").await.unwrap();
        assert!(sandbox.remove("d", false).await.is_err());
        sandbox.remove("d", true).await.unwrap();
        assert!(sandbox.list_directory("").await.unwrap().is_empty());

        assert!(matches!(
            sandbox.remove("", true).await,
            Err(SandboxError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;
        assert!(matches!(
            sandbox.read_file("../etc/passwd").await,
            Err(SandboxError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_cannot_escape_root() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;

        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        symlink(outside.path(), dir.path().join("esc")).unwrap();
        symlink(outside.path().join("new.txt"), dir.path().join("dangling.txt")).unwrap();

        let refused =
            |result: SandboxResult<()>| matches!(result, Err(SandboxError::InvalidPath(_)));
        assert!(refused(sandbox.write_file("esc/pwned.txt", "owned").await));
        assert!(refused(sandbox.write_file("dangling.txt", "owned").await));
        assert!(refused(sandbox.mkdir("esc/sub").await));
        assert!(refused(sandbox.read_file("esc/secret.txt").await.map(|_| ())));
        assert!(refused(sandbox.list_directory("esc").await.map(|_| ())));
        assert!(refused(sandbox.spawn("pwd", Some("esc")).await.map(|_| ())));
        assert!(!outside.path().join("pwned.txt").exists());
        assert!(!outside.path().join("new.txt").exists());
        assert!(!outside.path().join("sub").exists());

        // The link itself can go; its target stays.
        sandbox.remove("esc", true).await.unwrap();
        assert!(outside.path().join("secret.txt").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_inside_root_are_followed() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;

        sandbox.mkdir("src").await.unwrap();
        std::os::unix::fs::symlink(dir.path().join("src"), dir.path().join("alias")).unwrap();

        sandbox.write_file("alias/main.js", "hi").await.unwrap();
        assert_eq!(sandbox.read_file("src/main.js").await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_seed_only_into_empty_root() {
        let dir = tempdir().unwrap();
        let config = SandboxConfig {
            seed_template: true,
            ..test_config()
        };
        let sandbox = LocalProvider::new(dir.path(), config.clone())
            .boot()
            .await
            .unwrap();
        let readme = sandbox.read_file("README.md").await.unwrap();
        assert!(readme.contains("mirrorbox"));

        sandbox.write_file("README.md", "custom").await.unwrap();
        let sandbox = LocalProvider::new(dir.path(), config).boot().await.unwrap();
        assert_eq!(sandbox.read_file("README.md").await.unwrap(), "custom");
    }

    #[tokio::test]
    async fn test_missing_shell_is_environment_unsupported() {
        let dir = tempdir().unwrap();
        let config = SandboxConfig {
            shell: "/no/such/shell".to_string(),
            ..test_config()
        };
        let err = LocalProvider::new(dir.path(), config).boot().await.unwrap_err();
        assert!(matches!(err, BootError::EnvironmentUnsupported { .. }));
        assert!(err.remediation().unwrap().contains("sandbox.shell"));
    }

    #[tokio::test]
    async fn test_spawn_streams_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;

        let process = sandbox.spawn("echo out; echo err >&2; exit 3", None).await.unwrap();
        let (output, code) = collect(process).await;
        assert!(output.contains("out"));
        assert!(output.contains("err"));
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_spawn_honors_cwd() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;
        sandbox.mkdir("app").await.unwrap();

        let process = sandbox.spawn("touch marker", Some("app")).await.unwrap();
        let (_, code) = collect(process).await;
        assert_eq!(code, Some(0));
        assert!(dir.path().join("app/marker").exists());

        assert!(sandbox.spawn("true", Some("nowhere")).await.is_err());
    }

    #[tokio::test]
    async fn test_kill_terminates_process() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;

        let process = sandbox.spawn("sleep 30", None).await.unwrap();
        let killer = process.killer();
        assert!(!killer.has_exited());

        let code = tokio::time::timeout(Duration::from_secs(10), killer.kill())
            .await
            .unwrap();
        assert_eq!(code, Some(137));
    }

    #[tokio::test]
    async fn test_torn_down_sandbox_rejects_calls() {
        let dir = tempdir().unwrap();
        let sandbox = boot(dir.path()).await;
        sandbox.teardown().await.unwrap();
        assert!(matches!(
            sandbox.read_file("x").await,
            Err(SandboxError::TornDown)
        ));
    }
}
