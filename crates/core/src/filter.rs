//! Exclusion and filter predicates
//!
//! The engine treats these as opaque: `excludes` hides a path from traversal
//! entirely, `accepts` decides whether a classified file or link is kept.

use std::path::{Path, PathBuf};

use ignore::Match;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;

use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Result};

/// Name of the engine's state directory, always excluded.
pub const STATE_DIR: &str = ".vsync";

/// Path filter consulted by every scanner.
///
/// Paths are root-relative. Implementations must be pure and cheap.
pub trait Predicate: Send + Sync {
    fn excludes(&self, path: &Path, is_dir: bool) -> bool;

    fn accepts(&self, _entry: &Entry) -> bool {
        true
    }
}

/// Keeps everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Predicate for AcceptAll {
    fn excludes(&self, _path: &Path, _is_dir: bool) -> bool {
        false
    }
}

/// Gitignore-syntax exclusion plus an optional file size cap.
#[derive(Debug)]
pub struct GlobPredicate {
    matcher: Gitignore,
    state_dir: PathBuf,
    max_file_size: Option<u64>,
}

impl GlobPredicate {
    /// Build from the root's `.gitignore` (if any) and extra patterns.
    ///
    /// # Errors
    /// Returns `Config` if a pattern or the `.gitignore` is malformed.
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);

        let gitignore = root.join(".gitignore");
        if gitignore.is_file() {
            if let Some(err) = builder.add(&gitignore) {
                return Err(Error::Config(format!("{}: {err}", gitignore.display())));
            }
        }
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| Error::Config(format!("exclude pattern {pattern:?}: {e}")))?;
        }
        let matcher = builder
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        debug!(patterns = matcher.num_ignores(), "built exclusion matcher");
        Ok(Self {
            matcher,
            state_dir: PathBuf::from(STATE_DIR),
            max_file_size: None,
        })
    }

    /// Use a different root-relative state directory.
    #[must_use]
    pub fn state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = path.into();
        self
    }

    /// Reject files larger than `bytes`.
    #[must_use]
    pub fn max_file_size(mut self, bytes: Option<u64>) -> Self {
        self.max_file_size = bytes;
        self
    }
}

impl Predicate for GlobPredicate {
    fn excludes(&self, path: &Path, is_dir: bool) -> bool {
        if path.starts_with(&self.state_dir) {
            return true;
        }
        if path.as_os_str().is_empty() {
            return false;
        }
        matches!(
            self.matcher.matched_path_or_any_parents(path, is_dir),
            Match::Ignore(_)
        )
    }

    fn accepts(&self, entry: &Entry) -> bool {
        match (&entry.kind, self.max_file_size, &entry.blob) {
            (EntryKind::File, Some(max), Some(blob)) => blob.size <= max,
            _ => true,
        }
    }
}
