//! Error types for configuration resolution

use std::io;
use thiserror::Error;

/// Standard Result type for configuration loading operations
pub type Result<T> = std::result::Result<T, ConfigLoadError>;

/// Failure to canonicalize a filesystem path.
///
/// The display text carries the requested path and the operating system's
/// reason so callers can surface it verbatim.
#[derive(Debug, Error)]
#[error("failed to canonicalize {path}: {source}")]
pub struct CanonicalizeError {
    /// The path as originally requested (possibly relative).
    pub path: String,
    #[source]
    pub source: io::Error,
}

/// Failure to read a file's contents.
///
/// A missing file is an expected outcome during config search and is
/// distinguished from every other failure (permission denied, path is a
/// directory, ...).
#[derive(Debug, Error)]
pub enum FileReadError {
    #[error("failed to read {path}: No such file or directory")]
    NotFound { path: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FileReadError {
    /// Create a read error from an `io::Error`, classifying not-found.
    pub fn from_io_error(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Io { path, source }
        }
    }

    /// Whether this error means the file does not exist.
    ///
    /// Not-found drives the ancestor search loop; every other read failure
    /// is a hard error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The path the read was attempted on.
    pub fn path(&self) -> &str {
        match self {
            Self::NotFound { path } | Self::Io { path, .. } => path,
        }
    }
}

/// Error type for the configuration loader's recoverable error channel
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error(transparent)]
    Canonicalize(#[from] CanonicalizeError),

    #[error(transparent)]
    Read(#[from] FileReadError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_classified_from_io_error() {
        let err = FileReadError::from_io_error(
            "/nowhere/quick-lint-js.config",
            io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        );
        assert!(err.is_not_found());
        assert_eq!(err.path(), "/nowhere/quick-lint-js.config");
    }

    #[test]
    fn other_errors_are_not_not_found() {
        let err = FileReadError::from_io_error(
            "/etc/quick-lint-js.config",
            io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied"),
        );
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("/etc/quick-lint-js.config"));
        assert!(err.to_string().contains("Permission denied"));
    }
}
