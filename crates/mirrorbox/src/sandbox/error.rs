//! Sandbox error types.

use thiserror::Error;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors that can occur inside the sandbox runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A directory was given where a file was expected, or the reverse.
    #[error("wrong entry kind: {0}")]
    WrongKind(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// File content is not valid UTF-8.
    #[error("not a text file: {0}")]
    NotText(String),

    /// The sandbox has been torn down.
    #[error("sandbox has been torn down")]
    TornDown,
}

impl SandboxError {
    /// Map an IO error for `path` onto the specific variants.
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SandboxError::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => SandboxError::AlreadyExists(path.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                SandboxError::PermissionDenied(path.to_string())
            }
            std::io::ErrorKind::InvalidData => SandboxError::NotText(path.to_string()),
            _ => SandboxError::Io(err),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, SandboxError::AlreadyExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SandboxError::NotFound("missing.txt".to_string());
        assert_eq!(err.to_string(), "not found: missing.txt");
    }

    #[test]
    fn test_from_io_maps_kinds() {
        let err = SandboxError::from_io(
            "a",
            std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        );
        assert!(err.is_already_exists());

        let err = SandboxError::from_io("a", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(matches!(err, SandboxError::NotFound(p) if p == "a"));

        let err = SandboxError::from_io("a", std::io::Error::other("boom"));
        assert!(matches!(err, SandboxError::Io(_)));
    }
}
