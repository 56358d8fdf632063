//! vsync-core: Synchronization engine
//!
//! Mirrors a directory tree into an indexed LMDB store and keeps it current
//! with full, delta and watch-driven scans, stamping every change with a
//! vector clock.

pub mod clock;
pub mod codec;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod filter;
pub mod fs;
pub mod hash;
pub mod limiter;
pub mod scan;
pub mod store;
pub mod tree;
pub mod watch;

pub use clock::{VectorClock, VectorStamp};
pub use config::VsyncConfig;
pub use control::ScanControl;
pub use dispatch::{
    ChangeAction, ChangeRecord, CommitEvent, DispatchEvent, Dispatcher, DispatcherOptions,
    DispatcherState, JobKind, JobOutcome, SourceSpec, WatchAction,
};
pub use entry::{Blob, Entry, EntryKind};
pub use error::{Error, Result};
pub use filter::{AcceptAll, GlobPredicate, Predicate};
pub use fs::{FileKind, FileStat, Filesystem, LocalFs};
pub use hash::ContentHash;
pub use limiter::Limiter;
pub use scan::{
    Change, ChangeSink, DeltaScanner, DiffHandler, DiffOptions, DifferenceEngine,
    IntegralScanner, PathStack, ScanOptions, ScanReport,
};
pub use store::{IndexedPartition, Partition, Store};
pub use tree::TreeAdapter;
pub use watch::SourceWatcher;
