//! Full traversal of a source tree
//!
//! Directories are processed from an explicit work stack, never by recursion.
//! For each directory the children are listed, statted concurrently through
//! the [`Limiter`], then classified in name order against the [`PathStack`].

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::path_stack::PathStack;
use super::{Change, ChangeSink, ScanOptions, ScanReport};
use crate::control::ScanControl;
use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Result};
use crate::filter::{AcceptAll, Predicate};
use crate::fs::{FileKind, FileStat, Filesystem};
use crate::hash::ContentHash;
use crate::limiter::Limiter;

/// Full scanner over one source root.
#[derive(Clone)]
pub struct IntegralScanner {
    fs: Arc<dyn Filesystem>,
    root: PathBuf,
    predicate: Arc<dyn Predicate>,
    limiter: Limiter,
    options: ScanOptions,
    control: ScanControl,
}

impl IntegralScanner {
    #[must_use]
    pub fn new(fs: Arc<dyn Filesystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
            predicate: Arc::new(AcceptAll),
            limiter: Limiter::default(),
            options: ScanOptions::default(),
            control: ScanControl::new(),
        }
    }

    #[must_use]
    pub fn predicate(mut self, predicate: Arc<dyn Predicate>) -> Self {
        self.predicate = predicate;
        self
    }

    #[must_use]
    pub fn limiter(mut self, limiter: Limiter) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn control(mut self, control: ScanControl) -> Self {
        self.control = control;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn scan_options(&self) -> &ScanOptions {
        &self.options
    }

    pub(crate) fn fs(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    pub(crate) fn scan_control(&self) -> &ScanControl {
        &self.control
    }

    /// Scan from `start` (the empty path is the root) and push every entry
    /// found as an upsert.
    ///
    /// The root itself is never emitted. A non-root `start` is emitted first;
    /// `stack` must then already hold its ancestors
    /// (see [`PathStack::navigate_to`]).
    ///
    /// # Errors
    /// Fails if the root cannot be read, on cancellation, or when the sink
    /// fails. Per-path I/O errors are logged and counted.
    pub async fn scan(
        &self,
        start: &Path,
        stack: &mut PathStack,
        sink: &mut dyn ChangeSink,
    ) -> Result<ScanReport> {
        let mut emitter = Emitter::new(sink, &self.options);
        self.scan_into(start, stack, &mut emitter).await?;
        emitter.finish()
    }

    pub(crate) async fn scan_into(
        &self,
        start: &Path,
        stack: &mut PathStack,
        emitter: &mut Emitter<'_>,
    ) -> Result<()> {
        let mut work: Vec<Pending> = Vec::new();

        if start.as_os_str().is_empty() {
            let stat = self
                .fs
                .stat(&self.root)
                .await
                .map_err(|e| Error::from_source_io(&self.root, e))?;
            if !stat.is_dir() {
                return Err(Error::NotADirectory(self.root.clone()));
            }
            stack.clear();
            work.push(Pending {
                rel: PathBuf::new(),
                inode: stat.ino,
                device: stat.dev,
            });
        } else {
            let mut probes = self.probe_many(vec![start.to_path_buf()], true).await?;
            let Some(probe) = probes.pop() else {
                return Ok(());
            };
            if let Visit::Keep { entry, descend } = self.classify(probe, stack, &mut emitter.report)
            {
                emitter.seen();
                emitter.upsert(start.to_path_buf(), entry)?;
                if let Some((inode, device)) = descend {
                    work.push(Pending {
                        rel: start.to_path_buf(),
                        inode,
                        device,
                    });
                }
            }
        }

        while let Some(dir) = work.pop() {
            self.control.checkpoint().await?;

            match dir.rel.parent() {
                Some(parent) => stack.interrogate_path(parent),
                None => stack.clear(),
            }
            stack.push(dir.rel.clone(), dir.inode, dir.device);

            let absolute = self.root.join(&dir.rel);
            let mut names = match self.fs.read_dir(&absolute).await {
                Ok(names) => names,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %dir.rel.display(), "directory vanished during scan");
                    continue;
                }
                Err(e) => {
                    warn!(path = %dir.rel.display(), error = %e, "failed to list directory");
                    emitter.report.errors += 1;
                    continue;
                }
            };
            names.sort();

            let rels: Vec<PathBuf> = names.iter().map(|name| dir.rel.join(name)).collect();
            let probes = self.probe_many(rels, true).await?;

            let mut children = Vec::new();
            for probe in probes {
                let rel = probe.rel.clone();
                emitter.seen();
                if let Visit::Keep { entry, descend } =
                    self.classify(probe, stack, &mut emitter.report)
                {
                    emitter.upsert(rel.clone(), entry)?;
                    if let Some((inode, device)) = descend {
                        children.push(Pending { rel, inode, device });
                    }
                }
            }
            // Reverse so the stack pops children in name order
            work.extend(children.into_iter().rev());
        }

        Ok(())
    }

    /// Stat `rels` concurrently.
    pub(crate) async fn probe_many(&self, rels: Vec<PathBuf>, hash: bool) -> Result<Vec<Probe>> {
        let fs = Arc::clone(&self.fs);
        let predicate = Arc::clone(&self.predicate);
        let root = self.root.clone();
        let follow = self.options.follow_links;
        let hash = hash && self.options.hash_contents;

        self.limiter
            .map(rels, &self.control, move |rel| {
                probe(
                    Arc::clone(&fs),
                    Arc::clone(&predicate),
                    root.join(&rel),
                    rel,
                    follow,
                    hash,
                )
            })
            .await
    }

    /// Turn a stat result into an entry, updating the counters.
    pub(crate) fn classify(&self, probe: Probe, stack: &PathStack, report: &mut ScanReport) -> Visit {
        let name = probe.rel.file_name().unwrap_or(OsStr::new("")).to_os_string();
        let lstat = match probe.lstat {
            Ok(stat) => stat,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Visit::Gone,
            Err(e) => {
                warn!(path = %probe.rel.display(), error = %e, "lstat failed");
                report.errors += 1;
                return Visit::Failed;
            }
        };
        if probe.excluded {
            debug!(path = %probe.rel.display(), "excluded");
            report.ignored += 1;
            return Visit::Ignored;
        }

        let (entry, descend) = match lstat.kind {
            FileKind::File => (file_entry(&name, &lstat, probe.hash), None),
            FileKind::Directory => (
                Entry::from_stat(&name, EntryKind::Directory, &lstat),
                Some((lstat.ino, lstat.dev)),
            ),
            FileKind::Other => {
                debug!(path = %probe.rel.display(), "special file ignored");
                report.ignored += 1;
                return Visit::Ignored;
            }
            FileKind::Symlink => match probe.target {
                Some(Ok(target)) if target.is_dir() => match stack.attempt(target.ino, target.dev) {
                    Some(ancestor) => {
                        debug!(
                            path = %probe.rel.display(),
                            ancestor = %ancestor.path.display(),
                            "link closes a cycle"
                        );
                        let kind = EntryKind::Link {
                            target: ancestor.path.to_string_lossy().into_owned(),
                            weak: true,
                        };
                        (Entry::from_stat(&name, kind, &lstat), None)
                    }
                    None => (
                        Entry::from_stat(&name, EntryKind::Directory, &target),
                        Some((target.ino, target.dev)),
                    ),
                },
                Some(Ok(target)) if target.kind == FileKind::File => {
                    (file_entry(&name, &target, probe.hash), None)
                }
                Some(Ok(_)) => {
                    report.ignored += 1;
                    return Visit::Ignored;
                }
                // Not following, or the link dangles
                Some(Err(_)) | None => {
                    let text = match probe.link {
                        Some(Ok(text)) => text.to_string_lossy().into_owned(),
                        Some(Err(e)) => {
                            warn!(path = %probe.rel.display(), error = %e, "readlink failed");
                            report.errors += 1;
                            return Visit::Failed;
                        }
                        None => String::new(),
                    };
                    let kind = EntryKind::Link {
                        target: text,
                        weak: false,
                    };
                    (Entry::from_stat(&name, kind, &lstat), None)
                }
            },
        };

        if !entry.is_dir() && !self.predicate.accepts(&entry) {
            debug!(path = %probe.rel.display(), "rejected by filter");
            report.ignored += 1;
            return Visit::Ignored;
        }

        match &entry.kind {
            EntryKind::File => {
                report.files += 1;
                report.total_size += entry.blob.as_ref().map_or(0, |b| b.size);
            }
            EntryKind::Directory => report.directories += 1,
            EntryKind::Link { .. } => report.soft_links += 1,
        }
        Visit::Keep { entry, descend }
    }
}

fn file_entry(name: &OsStr, stat: &FileStat, hash: Option<ContentHash>) -> Entry {
    let mut entry = Entry::from_stat(name, EntryKind::File, stat);
    if let Some(blob) = entry.blob.as_mut() {
        blob.hash = hash.map(|h| *h.as_bytes());
    }
    entry
}

struct Pending {
    rel: PathBuf,
    inode: u64,
    device: u64,
}

/// Raw filesystem facts about one path.
#[derive(Debug)]
pub(crate) struct Probe {
    pub rel: PathBuf,
    pub lstat: io::Result<FileStat>,
    /// The link target's stat, for links when following.
    pub target: Option<io::Result<FileStat>>,
    /// The link text, for links.
    pub link: Option<io::Result<PathBuf>>,
    pub excluded: bool,
    pub hash: Option<ContentHash>,
}

impl Probe {
    pub fn is_not_found(&self) -> bool {
        matches!(&self.lstat, Err(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

pub(crate) enum Visit {
    Keep {
        entry: Entry,
        /// `(inode, device)` of a directory to descend into.
        descend: Option<(u64, u64)>,
    },
    Ignored,
    Failed,
    Gone,
}

async fn probe(
    fs: Arc<dyn Filesystem>,
    predicate: Arc<dyn Predicate>,
    absolute: PathBuf,
    rel: PathBuf,
    follow: bool,
    hash: bool,
) -> Probe {
    let lstat = fs.lstat(&absolute).await;
    let mut probe = Probe {
        rel,
        lstat,
        target: None,
        link: None,
        excluded: false,
        hash: None,
    };
    let Ok(lstat) = &probe.lstat else {
        return probe;
    };

    let mut kind = lstat.kind;
    if kind == FileKind::Symlink {
        probe.link = Some(fs.read_link(&absolute).await);
        if follow {
            let target = fs.stat(&absolute).await;
            if let Ok(target) = &target {
                kind = target.kind;
            }
            probe.target = Some(target);
        }
    }

    probe.excluded = predicate.excludes(&probe.rel, kind == FileKind::Directory);
    if hash && !probe.excluded && kind == FileKind::File {
        match fs.hash_file(&absolute).await {
            Ok(digest) => probe.hash = Some(digest),
            Err(e) => warn!(path = %probe.rel.display(), error = %e, "hashing failed"),
        }
    }
    probe
}

/// Buffers counters and commit cadence for one job's sink.
pub(crate) struct Emitter<'s> {
    sink: &'s mut dyn ChangeSink,
    commit_every: usize,
    progress_every: usize,
    since_commit: usize,
    since_progress: usize,
    started: Instant,
    pub report: ScanReport,
}

impl<'s> Emitter<'s> {
    pub fn new(sink: &'s mut dyn ChangeSink, options: &ScanOptions) -> Self {
        Self {
            sink,
            commit_every: options.commit_every.max(1),
            progress_every: options.progress_every.max(1),
            since_commit: 0,
            since_progress: 0,
            started: Instant::now(),
            report: ScanReport::default(),
        }
    }

    pub fn upsert(&mut self, path: PathBuf, entry: Entry) -> Result<()> {
        debug!(path = %path.display(), kind = entry.kind.label(), "upsert");
        self.report.upserted += 1;
        self.sink.push(Change::Upsert { path, entry })?;
        self.bump()
    }

    pub fn remove(&mut self, path: PathBuf) -> Result<()> {
        debug!(path = %path.display(), "remove");
        self.report.removed += 1;
        self.sink.push(Change::Remove { path })?;
        self.bump()
    }

    /// Count one visited entry toward the progress cadence.
    pub fn seen(&mut self) {
        self.since_progress += 1;
        if self.since_progress >= self.progress_every {
            self.since_progress = 0;
            self.report.duration = self.started.elapsed();
            self.sink.progress(&self.report);
        }
    }

    /// Commit whatever is pending without finishing.
    pub fn flush(&mut self) -> Result<()> {
        self.since_commit = 0;
        self.sink.commit()
    }

    pub fn finish(mut self) -> Result<ScanReport> {
        self.flush()?;
        self.report.duration = self.started.elapsed();
        self.report.finished = true;
        self.sink.progress(&self.report);
        Ok(self.report)
    }

    fn bump(&mut self) -> Result<()> {
        self.since_commit += 1;
        if self.since_commit >= self.commit_every {
            self.flush()?;
        }
        Ok(())
    }
}
