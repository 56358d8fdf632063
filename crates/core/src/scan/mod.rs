//! Scanning and diffing the live filesystem against the stored tree
//!
//! - [`IntegralScanner`]: full traversal, every entry is an upsert.
//! - [`DeltaScanner`]: replays the stored tree and emits only differences.
//! - [`DifferenceEngine`]: the same decisions for a single watched path.
//!
//! All three report through explicit sinks; nothing is written to the tree
//! here.

pub mod delta;
pub mod difference;
pub mod integral;
pub mod path_stack;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::entry::Entry;
use crate::error::Result;

pub use delta::DeltaScanner;
pub use difference::{DiffHandler, DiffOptions, DifferenceEngine};
pub use integral::IntegralScanner;
pub use path_stack::{Level, PathStack};

/// Inserts between two sink commits.
pub const DEFAULT_COMMIT_EVERY: usize = 96;
/// Entries between two progress reports.
pub const DEFAULT_PROGRESS_EVERY: usize = 512;

/// One detected change, keyed by root-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Change {
    Upsert { path: PathBuf, entry: Entry },
    Remove { path: PathBuf },
}

impl Change {
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::Upsert { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Receives a scanner's changes.
///
/// `commit` marks a durable boundary: everything pushed so far should be
/// written before the scan continues.
pub trait ChangeSink: Send {
    /// # Errors
    /// Implementations may fail the scan.
    fn push(&mut self, change: Change) -> Result<()>;

    /// # Errors
    /// Implementations may fail the scan.
    fn commit(&mut self) -> Result<()>;

    fn progress(&mut self, _report: &ScanReport) {}
}

impl ChangeSink for Vec<Change> {
    fn push(&mut self, change: Change) -> Result<()> {
        Vec::push(self, change);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counters for one traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub files: u64,
    pub directories: u64,
    pub soft_links: u64,
    pub ignored: u64,
    pub errors: u64,
    pub total_size: u64,
    pub upserted: u64,
    pub removed: u64,
    pub duration: Duration,
    pub finished: bool,
}

impl ScanReport {
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.files + self.directories + self.soft_links
    }

    /// Fold another traversal's counters into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.files += other.files;
        self.directories += other.directories;
        self.soft_links += other.soft_links;
        self.ignored += other.ignored;
        self.errors += other.errors;
        self.total_size += other.total_size;
        self.upserted += other.upserted;
        self.removed += other.removed;
    }
}

/// Traversal knobs shared by every scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub follow_links: bool,
    pub hash_contents: bool,
    pub commit_every: usize,
    pub progress_every: usize,
    /// Diff the children of directories whose own metadata is unchanged.
    pub rescan_unchanged_directories: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            hash_contents: false,
            commit_every: DEFAULT_COMMIT_EVERY,
            progress_every: DEFAULT_PROGRESS_EVERY,
            rescan_unchanged_directories: false,
        }
    }
}
