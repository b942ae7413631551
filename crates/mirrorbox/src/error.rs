//! Engine error types.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use mirrorbox_protocol::ActionValidationError;

use crate::sandbox::SandboxError;
use crate::tree::TreeError;
use crate::workspace::InvalidPath;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while booting the sandbox.
///
/// Cloneable because one boot attempt is shared by every concurrent caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    /// The host lacks a precondition the sandbox needs.
    #[error("sandbox environment unsupported: {reason}")]
    EnvironmentUnsupported { reason: String, remediation: String },

    /// The sandbox failed to initialize.
    #[error("sandbox failed to boot: {0}")]
    Failed(String),

    /// A teardown ran while this boot was still in flight.
    #[error("sandbox boot was superseded by a teardown")]
    Superseded,
}

impl BootError {
    /// Remediation text for an unsupported environment, if any.
    pub fn remediation(&self) -> Option<&str> {
        match self {
            BootError::EnvironmentUnsupported { remediation, .. } => Some(remediation),
            _ => None,
        }
    }
}

/// Errors that can occur while operating on the workspace.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Boot(#[from] BootError),

    /// A capability call was made without a live sandbox.
    #[error("sandbox is not booted")]
    NotBooted,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("failed to read {path}: {message}")]
    ReadFailure { path: String, message: String },

    #[error("failed to write {path}: {message}")]
    WriteFailure { path: String, message: String },

    #[error("failed to delete {path}: {message}")]
    DeleteFailure { path: String, message: String },

    /// The command could not be started at all.
    #[error("failed to start `{command}`: {message}")]
    ProcessFailure { command: String, message: String },

    #[error("invalid action: {0}")]
    InvalidAction(#[from] ActionValidationError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("failed to tear down sandbox: {0}")]
    Teardown(String),
}

impl From<InvalidPath> for EngineError {
    fn from(err: InvalidPath) -> Self {
        EngineError::InvalidPath(err.0)
    }
}

impl EngineError {
    pub(crate) fn read(path: &str, err: SandboxError) -> Self {
        Self::ReadFailure {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn write(path: &str, err: SandboxError) -> Self {
        Self::WriteFailure {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn delete(path: &str, err: SandboxError) -> Self {
        Self::DeleteFailure {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    /// Message suitable for showing in the action log.
    pub fn user_message(&self) -> String {
        normalize_message(&error_chain(self))
    }
}

/// Lines that point into the toolchain, the registry or the async runtime.
static INTERNAL_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(/rustc/[0-9a-f]+/|\.cargo/registry/|\b(std|core|alloc|tokio|futures_util)::|^\s*stack backtrace:|RUST_BACKTRACE)",
    )
    .expect("internal frame pattern is valid")
});

/// Strip internal frames from an error message.
///
/// The first line always survives; later lines are dropped when they look
/// like runtime or toolchain frames, along with the `at file:line` line that
/// follows such a frame.
pub fn normalize_message(message: &str) -> String {
    let mut lines = message.lines();
    let Some(first) = lines.next() else {
        return String::new();
    };

    let mut kept = vec![first.trim_end()];
    let mut skip_location = false;
    for line in lines {
        let trimmed = line.trim_start();
        if skip_location && trimmed.starts_with("at ") {
            skip_location = false;
            continue;
        }
        skip_location = false;
        if INTERNAL_FRAME.is_match(line) {
            skip_location = true;
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        kept.push(line.trim_end());
    }
    kept.join("\n")
}

/// Join an error and its sources into a single `a: b: c` line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::DeleteFailure {
            path: "/missing.txt".to_string(),
            message: "not found: missing.txt".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to delete /missing.txt: not found: missing.txt"
        );
    }

    #[test]
    fn test_boot_remediation() {
        let err = BootError::EnvironmentUnsupported {
            reason: "bwrap not found".to_string(),
            remediation: "install bubblewrap".to_string(),
        };
        assert_eq!(err.remediation(), Some("install bubblewrap"));
        assert_eq!(BootError::Failed("x".to_string()).remediation(), None);

        let engine: EngineError = err.into();
        assert!(engine.to_string().contains("bwrap not found"));
    }

    #[test]
    fn test_normalize_strips_internal_frames() {
        let raw = "\
write failed
stack backtrace:
   0: std::backtrace::Backtrace::create
             at /rustc/abc123/library/std/src/backtrace.rs:331:13
   1: mirrorbox::bridge::write
   2: tokio::runtime::task::harness::poll
             at /home/u/.cargo/registry/src/tokio-1.49.0/src/runtime/task/harness.rs:10:5";
        let cleaned = normalize_message(raw);
        assert_eq!(cleaned, "write failed\n   1: mirrorbox::bridge::write");
    }

    #[test]
    fn test_normalize_keeps_plain_messages() {
        assert_eq!(normalize_message("permission denied"), "permission denied");
        assert_eq!(normalize_message(""), "");
    }

    #[test]
    fn test_error_chain_deduplicates() {
        let io = std::io::Error::other("disk full");
        let err = crate::sandbox::SandboxError::Io(io);
        assert_eq!(error_chain(&err), "io error: disk full");
    }
}
