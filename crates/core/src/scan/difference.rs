//! Single-path diffing for watch events
//!
//! Given one path the watcher reported, decide what happened to it by
//! comparing its stored row with a stat of the live path, using the same
//! rules as the delta scanner. Directories additionally diff their child
//! sets, each direction behind its own switch.

use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::integral::{IntegralScanner, Visit};
use super::path_stack::PathStack;
use super::{Change, ChangeSink, ScanReport};
use crate::codec;
use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Result};
use crate::tree::TreeAdapter;

/// Which child-set differences to detect inside directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    pub directory_adds: bool,
    pub directory_removes: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            directory_adds: true,
            directory_removes: true,
        }
    }
}

/// Receives the outcome of a single-path diff.
pub trait DiffHandler: Send {
    /// # Errors
    /// Implementations may abort the diff.
    fn add(&mut self, path: &Path, entry: Entry) -> Result<()>;

    /// # Errors
    /// Implementations may abort the diff.
    fn update(&mut self, path: &Path, entry: Entry) -> Result<()>;

    /// # Errors
    /// Implementations may abort the diff.
    fn remove(&mut self, path: &Path) -> Result<()>;

    fn error(&mut self, path: &Path, error: &Error);

    fn ignore(&mut self, _path: &Path) {}

    /// # Errors
    /// Implementations may abort the diff.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forwards integral scan output to a handler as additions.
struct HandlerSink<'h> {
    handler: &'h mut dyn DiffHandler,
}

impl ChangeSink for HandlerSink<'_> {
    fn push(&mut self, change: Change) -> Result<()> {
        match change {
            Change::Upsert { path, entry } => self.handler.add(&path, entry),
            Change::Remove { path } => self.handler.remove(&path),
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.handler.commit()
    }
}

/// Single-path state machine over one source.
#[derive(Clone)]
pub struct DifferenceEngine {
    integral: IntegralScanner,
    options: DiffOptions,
}

impl DifferenceEngine {
    #[must_use]
    pub fn new(integral: IntegralScanner, options: DiffOptions) -> Self {
        Self { integral, options }
    }

    /// Diff one root-relative path (the empty path is the root) and commit.
    ///
    /// # Errors
    /// Fails on cancellation, storage errors or handler errors. I/O errors
    /// for the path are reported through [`DiffHandler::error`].
    pub async fn difference(
        &self,
        tree: &TreeAdapter,
        path: &Path,
        handler: &mut dyn DiffHandler,
    ) -> Result<ScanReport> {
        self.integral.scan_control().checkpoint().await?;
        let mut report = ScanReport::default();
        let root = self.integral.root().to_path_buf();
        let fs = self.integral.fs();
        let follow = self.integral.scan_options().follow_links;

        if path.as_os_str().is_empty() {
            let stat = fs
                .stat(&root)
                .await
                .map_err(|e| Error::from_source_io(&root, e))?;
            let mut stack = PathStack::new();
            stack.push(PathBuf::new(), stat.ino, stat.dev);
            self.diff_children(tree, path, &mut stack, handler, &mut report)
                .await?;
            handler.commit()?;
            return Ok(report);
        }

        let stored = tree.try_get(path)?;
        let mut stack = PathStack::new();
        if let Err(e) = stack
            .navigate_to(fs.as_ref(), &root, path, Path::new(""), follow)
            .await
        {
            if e.kind() == io::ErrorKind::NotFound {
                // An ancestor is gone, so the path is too.
                if stored.is_some() {
                    remove_sub_tree(tree, path, handler, &mut report)?;
                }
            } else {
                handler.error(path, &Error::io(&root.join(path), e));
                report.errors += 1;
            }
            handler.commit()?;
            return Ok(report);
        }

        let mut probes = self.integral.probe_many(vec![path.to_path_buf()], false).await?;
        let Some(probe) = probes.pop() else {
            return Ok(report);
        };

        if let Err(e) = &probe.lstat {
            if e.kind() != io::ErrorKind::NotFound {
                let error = io::Error::new(e.kind(), e.to_string());
                handler.error(path, &Error::io(&root.join(path), error));
                report.errors += 1;
                handler.commit()?;
                return Ok(report);
            }
        }

        match self.integral.classify(probe, &stack, &mut report) {
            Visit::Gone => {
                if stored.is_some() {
                    remove_sub_tree(tree, path, handler, &mut report)?;
                }
            }
            Visit::Ignored => {
                handler.ignore(path);
                if stored.is_some() {
                    remove_sub_tree(tree, path, handler, &mut report)?;
                }
            }
            Visit::Failed => {
                let error = Error::io(&root.join(path), io::Error::other("link could not be read"));
                handler.error(path, &error);
            }
            Visit::Keep { entry: live, descend } => match stored {
                Some(stored)
                    if std::mem::discriminant(&stored.kind)
                        == std::mem::discriminant(&live.kind) =>
                {
                    if !stored.unchanged(&live) {
                        let mut updated = stored.updated_from(live);
                        self.rehash(path, &mut updated).await;
                        debug!(path = %path.display(), "update");
                        report.upserted += 1;
                        handler.update(path, updated)?;
                    }
                    if let Some((inode, device)) = descend {
                        stack.push(path.to_path_buf(), inode, device);
                        self.diff_children(tree, path, &mut stack, handler, &mut report)
                            .await?;
                    }
                }
                stale => {
                    if stale.is_some() {
                        debug!(path = %path.display(), "type changed");
                        remove_sub_tree(tree, path, handler, &mut report)?;
                    }
                    let mut added = live;
                    self.rehash(path, &mut added).await;
                    report.upserted += 1;
                    handler.add(path, added)?;
                    if let Some((inode, device)) = descend {
                        stack.push(path.to_path_buf(), inode, device);
                        self.diff_children(tree, path, &mut stack, handler, &mut report)
                            .await?;
                    }
                }
            },
        }

        handler.commit()?;
        Ok(report)
    }

    async fn diff_children(
        &self,
        tree: &TreeAdapter,
        dir: &Path,
        stack: &mut PathStack,
        handler: &mut dyn DiffHandler,
        report: &mut ScanReport,
    ) -> Result<()> {
        let absolute = self.integral.root().join(dir);
        let names: Vec<OsString> = match self.integral.fs().read_dir(&absolute).await {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to list directory");
                handler.error(dir, &Error::io(&absolute, e));
                report.errors += 1;
                return Ok(());
            }
        };
        let live: HashSet<Vec<u8>> = names
            .iter()
            .map(|name| codec::os_bytes(name).into_owned())
            .collect();
        let stored = tree.get_children(dir)?;

        if self.options.directory_removes {
            for (child, entry) in &stored {
                if !live.contains(&entry.disk_name) {
                    remove_sub_tree(tree, child, handler, report)?;
                }
            }
        }

        if self.options.directory_adds {
            let known: HashSet<&[u8]> = stored
                .iter()
                .map(|(_, entry)| entry.disk_name.as_slice())
                .collect();
            let mut added: Vec<&OsString> = names
                .iter()
                .filter(|name| !known.contains(codec::os_bytes(name).as_ref()))
                .collect();
            added.sort();

            for name in added {
                let child = dir.join(name);
                stack.interrogate_path(dir);
                let mut sink = HandlerSink {
                    handler: &mut *handler,
                };
                let sub = self.integral.scan(&child, stack, &mut sink).await?;
                report.absorb(&sub);
            }
        }
        Ok(())
    }

    async fn rehash(&self, path: &Path, entry: &mut Entry) {
        if !self.integral.scan_options().hash_contents || entry.kind != EntryKind::File {
            return;
        }
        let Some(blob) = entry.blob.as_mut() else {
            return;
        };
        if blob.hash.is_some() {
            return;
        }
        match self.integral.fs().hash_file(&self.integral.root().join(path)).await {
            Ok(hash) => blob.hash = Some(*hash.as_bytes()),
            Err(e) => warn!(path = %path.display(), error = %e, "hashing failed"),
        }
    }
}

/// Report `path` and every stored descendant as removed.
fn remove_sub_tree(
    tree: &TreeAdapter,
    path: &Path,
    handler: &mut dyn DiffHandler,
    report: &mut ScanReport,
) -> Result<()> {
    let mut paths = Vec::new();
    tree.scan_sub_tree(path, |row, _| {
        paths.push(row.to_path_buf());
        ControlFlow::Continue(())
    })?;
    for row in paths {
        debug!(path = %row.display(), "remove");
        report.removed += 1;
        handler.remove(&row)?;
    }
    Ok(())
}
