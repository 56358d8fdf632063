//! Error taxonomy for the sync engine

use std::io;
use std::path::{Path, PathBuf};

/// Errors produced by the store, the scanners and the dispatcher.
///
/// Per-path I/O failures inside a traversal are recovered locally and only
/// counted; everything that reaches a caller as `Err` is one of these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The partition's header/footer sentinel pair is absent or mismatched.
    #[error("partition {namespace:?} has no valid header/footer sentinel")]
    NoHeader { namespace: String },

    /// A row that was required to exist is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A source root cannot be read.
    #[error("access denied: {}", .0.display())]
    AccessDenied(PathBuf),

    /// A source root does not exist.
    #[error("does not exist: {}", .0.display())]
    DoesNotExist(PathBuf),

    /// A source root exists but is not a directory.
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// A filesystem operation failed for a reason other than `ENOENT`.
    #[error("I/O error at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// A batch could not be inflated or committed; nothing was applied.
    #[error("index inconsistency: {0}")]
    IndexInconsistency(String),

    #[error("storage error: {0}")]
    Storage(#[from] heed::Error),

    /// A stored value or key could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("dispatcher is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an I/O error with the path it happened at.
    #[must_use]
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Classify an I/O error raised while loading a source root.
    #[must_use]
    pub fn from_source_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::DoesNotExist(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Self::AccessDenied(path.to_path_buf()),
            _ => Self::io(path, source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_io_classification() {
        let path = Path::new("/nowhere");
        let err = Error::from_source_io(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, Error::DoesNotExist(_)));

        let err = Error::from_source_io(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, Error::AccessDenied(_)));

        let err = Error::from_source_io(path, io::Error::other("boom"));
        assert!(matches!(err, Error::Io { .. }));
    }
}
