//! Incremental scan driven by the stored tree
//!
//! Rows stream out of the tree in key order, which is a pre-order walk. Each
//! row is compared against a fresh stat of its live path and only the
//! differences reach the sink. New children are found by diffing a changed
//! directory's live listing against its stored children.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::integral::{Emitter, IntegralScanner, Probe, Visit};
use super::path_stack::PathStack;
use super::{ChangeSink, ScanReport};
use crate::codec;
use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Result};
use crate::tree::TreeAdapter;

/// Replays a stored tree against the filesystem.
#[derive(Clone)]
pub struct DeltaScanner {
    integral: IntegralScanner,
}

/// Per-pass bookkeeping.
struct Pass {
    stack: PathStack,
    /// Rows under this path are removed without touching the filesystem.
    removed_prefix: Option<PathBuf>,
    /// Subtrees scanned as additions during this pass.
    fresh: HashSet<PathBuf>,
}

impl Pass {
    fn is_removed(&self, path: &Path) -> bool {
        self.removed_prefix
            .as_deref()
            .is_some_and(|prefix| path.starts_with(prefix))
    }

    fn is_fresh(&self, path: &Path) -> bool {
        path.ancestors().any(|ancestor| self.fresh.contains(ancestor))
    }
}

impl DeltaScanner {
    #[must_use]
    pub fn new(integral: IntegralScanner) -> Self {
        Self { integral }
    }

    /// Compare the whole stored tree with the live source root.
    ///
    /// # Errors
    /// Fails if the root cannot be read, on cancellation, on storage errors
    /// or when the sink fails. Per-path I/O errors are logged and counted.
    pub async fn scan(&self, tree: &TreeAdapter, sink: &mut dyn ChangeSink) -> Result<ScanReport> {
        let root = self.integral.root().to_path_buf();
        let fs = self.integral.fs();
        let control = self.integral.scan_control();
        let mut emitter = Emitter::new(sink, self.integral.scan_options());

        let root_stat = fs
            .stat(&root)
            .await
            .map_err(|e| Error::from_source_io(&root, e))?;
        if !root_stat.is_dir() {
            return Err(Error::NotADirectory(root));
        }

        let mut pass = Pass {
            stack: PathStack::new(),
            removed_prefix: None,
            fresh: HashSet::new(),
        };
        pass.stack.push(PathBuf::new(), root_stat.ino, root_stat.dev);

        // The root has no row to compare, so its children are always diffed.
        self.diff_children(tree, Path::new(""), &mut pass, &mut emitter)
            .await?;

        let mut cursor = tree.sub_tree_cursor(Path::new(""))?;
        while let Some(page) = cursor.next_page()? {
            control.checkpoint().await?;

            let mut probes: HashMap<PathBuf, Probe> = HashMap::new();
            for (index, (path, stored)) in page.iter().enumerate() {
                if pass.is_removed(path) {
                    emitter.remove(path.clone())?;
                    continue;
                }
                if pass.is_fresh(path) {
                    continue;
                }

                if !probes.contains_key(path) {
                    let chunk = probe_chunk(&page[index..], &pass);
                    probes = self
                        .integral
                        .probe_many(chunk, false)
                        .await?
                        .into_iter()
                        .map(|probe| (probe.rel.clone(), probe))
                        .collect();
                }
                let Some(probe) = probes.remove(path) else {
                    continue;
                };

                match path.parent() {
                    Some(parent) => pass.stack.interrogate_path(parent),
                    None => pass.stack.clear(),
                }
                emitter.seen();

                if probe.is_not_found() {
                    self.remove(path.clone(), stored, &mut pass, &mut emitter)?;
                    continue;
                }

                match self.integral.classify(probe, &pass.stack, &mut emitter.report) {
                    Visit::Gone | Visit::Ignored => {
                        self.remove(path.clone(), stored, &mut pass, &mut emitter)?;
                    }
                    Visit::Failed => {}
                    Visit::Keep { entry, descend } => {
                        self.compare(
                            tree,
                            path.clone(),
                            stored.clone(),
                            entry,
                            descend,
                            &mut pass,
                            &mut emitter,
                        )
                        .await?;
                    }
                }
            }
        }

        let report = emitter.finish()?;
        info!(
            root = %root.display(),
            upserted = report.upserted,
            removed = report.removed,
            errors = report.errors,
            "delta scan finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn compare(
        &self,
        tree: &TreeAdapter,
        path: PathBuf,
        stored: Entry,
        live: Entry,
        descend: Option<(u64, u64)>,
        pass: &mut Pass,
        emitter: &mut Emitter<'_>,
    ) -> Result<()> {
        if std::mem::discriminant(&stored.kind) != std::mem::discriminant(&live.kind) {
            debug!(
                path = %path.display(),
                was = stored.kind.label(),
                now = live.kind.label(),
                "type changed"
            );
            self.remove(path.clone(), &stored, pass, emitter)?;
            if let Some(parent) = path.parent() {
                pass.stack.interrogate_path(parent);
            }
            self.integral
                .scan_into(&path, &mut pass.stack, emitter)
                .await?;
            pass.fresh.insert(path);
            return Ok(());
        }

        let unchanged = stored.unchanged(&live);
        if !unchanged {
            let mut updated = stored.updated_from(live);
            self.rehash(&path, &mut updated).await;
            emitter.upsert(path.clone(), updated)?;
        }

        if let Some((inode, device)) = descend {
            pass.stack.push(path.clone(), inode, device);
            if !unchanged || self.integral.scan_options().rescan_unchanged_directories {
                self.diff_children(tree, &path, pass, emitter).await?;
            }
        }
        Ok(())
    }

    /// Integrally scan live children of `dir` that have no stored row.
    async fn diff_children(
        &self,
        tree: &TreeAdapter,
        dir: &Path,
        pass: &mut Pass,
        emitter: &mut Emitter<'_>,
    ) -> Result<()> {
        let absolute = self.integral.root().join(dir);
        let names = match self.integral.fs().read_dir(&absolute).await {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to list directory");
                emitter.report.errors += 1;
                return Ok(());
            }
        };

        let stored: HashSet<Vec<u8>> = tree
            .get_children(dir)?
            .into_iter()
            .map(|(_, entry)| entry.disk_name)
            .collect();
        let mut added: Vec<OsString> = names
            .into_iter()
            .filter(|name| !stored.contains(codec::os_bytes(name).as_ref()))
            .collect();
        added.sort();

        for name in added {
            let child = dir.join(&name);
            debug!(path = %child.display(), "new child");
            pass.stack.interrogate_path(dir);
            self.integral
                .scan_into(&child, &mut pass.stack, emitter)
                .await?;
            pass.fresh.insert(child);
        }
        pass.stack.interrogate_path(dir);
        Ok(())
    }

    fn remove(
        &self,
        path: PathBuf,
        stored: &Entry,
        pass: &mut Pass,
        emitter: &mut Emitter<'_>,
    ) -> Result<()> {
        if stored.is_dir() {
            pass.removed_prefix = Some(path.clone());
        }
        emitter.remove(path)
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

/// Rows to stat together, up to and including the next stored directory.
///
/// A directory's verdict can mark everything below it removed, so rows past
/// it are statted only once that verdict is known.
fn probe_chunk(rows: &[(PathBuf, Entry)], pass: &Pass) -> Vec<PathBuf> {
    let mut chunk = Vec::new();
    for (path, stored) in rows {
        if pass.is_removed(path) || pass.is_fresh(path) {
            continue;
        }
        chunk.push(path.clone());
        if stored.is_dir() {
            break;
        }
    }
    chunk
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use filetime::FileTime;

    use super::*;
    use crate::fs::{FileStat, Filesystem, LocalFs};
    use crate::hash::ContentHash;
    use crate::scan::{Change, ScanOptions};
    use crate::store::Store;

    struct Fixture {
        dir: tempfile::TempDir,
        _state: tempfile::TempDir,
        tree: TreeAdapter,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let state = tempfile::tempdir().unwrap();
            let store = Store::open_with_map_size(state.path(), 16 * 1024 * 1024).unwrap();
            let tree = TreeAdapter::open(store.partition("tree/test")).unwrap();
            Self {
                dir,
                _state: state,
                tree,
            }
        }

        fn scanner(&self, options: ScanOptions) -> IntegralScanner {
            IntegralScanner::new(Arc::new(LocalFs), self.dir.path()).options(options)
        }

        async fn full_scan(&self, options: ScanOptions) {
            let mut changes = Vec::new();
            self.scanner(options)
                .scan(Path::new(""), &mut PathStack::new(), &mut changes)
                .await
                .unwrap();
            self.tree.apply(&changes).unwrap();
        }

        async fn delta(&self, options: ScanOptions) -> Vec<Change> {
            let mut changes = Vec::new();
            DeltaScanner::new(self.scanner(options))
                .scan(&self.tree, &mut changes)
                .await
                .unwrap();
            self.tree.apply(&changes).unwrap();
            changes
        }
    }

    /// Local disk that records every lstat.
    #[derive(Default)]
    struct CountingFs {
        lstats: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Filesystem for CountingFs {
        async fn read_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
            LocalFs.read_dir(path).await
        }

        async fn stat(&self, path: &Path) -> io::Result<FileStat> {
            LocalFs.stat(path).await
        }

        async fn lstat(&self, path: &Path) -> io::Result<FileStat> {
            self.lstats.lock().unwrap().push(path.to_path_buf());
            LocalFs.lstat(path).await
        }

        async fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            LocalFs.read_link(path).await
        }

        async fn hash_file(&self, path: &Path) -> io::Result<ContentHash> {
            LocalFs.hash_file(path).await
        }
    }

    fn summary(changes: &[Change]) -> Vec<String> {
        changes
            .iter()
            .map(|change| match change {
                Change::Upsert { path, entry } => {
                    format!("upsert {} {}", path.display(), entry.kind.label())
                }
                Change::Remove { path } => format!("remove {}", path.display()),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_second_pass_is_quiet() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.dir.path().join("a/b")).unwrap();
        std::fs::write(fx.dir.path().join("a/b/f"), b"x").unwrap();
        std::fs::write(fx.dir.path().join("g"), b"y").unwrap();

        fx.full_scan(ScanOptions::default()).await;
        assert!(fx.delta(ScanOptions::default()).await.is_empty());
        assert!(fx.delta(ScanOptions::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_removed_and_added_children() {
        let fx = Fixture::new();
        std::fs::create_dir(fx.dir.path().join("a")).unwrap();
        std::fs::write(fx.dir.path().join("a/f"), b"x").unwrap();
        fx.full_scan(ScanOptions::default()).await;
        let before = fx.tree.get(Path::new("a")).unwrap();

        std::fs::remove_file(fx.dir.path().join("a/f")).unwrap();
        std::fs::write(fx.dir.path().join("a/g"), b"y").unwrap();
        // Directory mtime may not move within its granularity
        filetime::set_file_mtime(
            fx.dir.path().join("a"),
            FileTime::from_system_time(SystemTime::now() + Duration::from_secs(5)),
        )
        .unwrap();

        let changes = summary(&fx.delta(ScanOptions::default()).await);
        assert!(changes.contains(&"remove a/f".to_string()));
        assert!(changes.contains(&"upsert a/g file".to_string()));
        assert_eq!(fx.tree.get(Path::new("a")).unwrap().id, before.id);
        assert!(fx.tree.try_get(Path::new("a/f")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rescan_unchanged_directories() {
        let fx = Fixture::new();
        std::fs::create_dir(fx.dir.path().join("a")).unwrap();
        std::fs::write(fx.dir.path().join("a/f"), b"x").unwrap();
        fx.full_scan(ScanOptions::default()).await;

        let mtime = std::fs::metadata(fx.dir.path().join("a"))
            .unwrap()
            .modified()
            .unwrap();
        std::fs::remove_file(fx.dir.path().join("a/f")).unwrap();
        std::fs::write(fx.dir.path().join("a/g"), b"y").unwrap();
        filetime::set_file_mtime(fx.dir.path().join("a"), FileTime::from_system_time(mtime))
            .unwrap();

        let options = ScanOptions {
            rescan_unchanged_directories: true,
            ..ScanOptions::default()
        };
        let changes = summary(&fx.delta(options).await);
        assert!(!changes.iter().any(|c| c == "upsert a dir"));
        assert!(changes.contains(&"upsert a/g file".to_string()));
        assert!(changes.contains(&"remove a/f".to_string()));
    }

    #[tokio::test]
    async fn test_deleted_directory_removes_descendants() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.dir.path().join("d/e")).unwrap();
        std::fs::write(fx.dir.path().join("d/e/f"), b"x").unwrap();
        std::fs::write(fx.dir.path().join("d-sibling"), b"x").unwrap();
        fx.full_scan(ScanOptions::default()).await;

        std::fs::remove_dir_all(fx.dir.path().join("d")).unwrap();
        let changes = summary(&fx.delta(ScanOptions::default()).await);
        assert_eq!(changes, vec!["remove d", "remove d/e", "remove d/e/f"]);
        assert_eq!(fx.tree.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_removed_directory_descendants_skip_the_filesystem() {
        let fx = Fixture::new();
        let gone = fx.dir.path().join("a");
        std::fs::create_dir(&gone).unwrap();
        for i in 0..5 {
            std::fs::write(gone.join(format!("f{i}")), b"x").unwrap();
        }
        std::fs::write(fx.dir.path().join("b"), b"x").unwrap();
        fx.full_scan(ScanOptions::default()).await;

        std::fs::remove_dir_all(&gone).unwrap();
        let fs = Arc::new(CountingFs::default());
        let mut changes = Vec::new();
        DeltaScanner::new(IntegralScanner::new(fs.clone(), fx.dir.path()))
            .scan(&fx.tree, &mut changes)
            .await
            .unwrap();

        assert_eq!(
            summary(&changes),
            vec![
                "remove a",
                "remove a/f0",
                "remove a/f1",
                "remove a/f2",
                "remove a/f3",
                "remove a/f4",
            ]
        );
        let lstats = fs.lstats.lock().unwrap();
        assert!(lstats.contains(&gone));
        let below: Vec<&PathBuf> = lstats
            .iter()
            .filter(|path| path.starts_with(&gone) && **path != gone)
            .collect();
        assert!(below.is_empty(), "descendants were statted: {below:?}");
    }

    #[tokio::test]
    async fn test_type_change_is_remove_then_add() {
        let fx = Fixture::new();
        std::fs::create_dir(fx.dir.path().join("x")).unwrap();
        std::fs::write(fx.dir.path().join("x/inner"), b"x").unwrap();
        fx.full_scan(ScanOptions::default()).await;
        let old_id = fx.tree.get(Path::new("x")).unwrap().id;

        std::fs::remove_dir_all(fx.dir.path().join("x")).unwrap();
        std::fs::write(fx.dir.path().join("x"), b"now a file").unwrap();

        let changes = summary(&fx.delta(ScanOptions::default()).await);
        assert_eq!(changes, vec!["remove x", "upsert x file", "remove x/inner"]);
        let now = fx.tree.get(Path::new("x")).unwrap();
        assert_eq!(now.kind, EntryKind::File);
        assert_ne!(now.id, old_id);
        assert_eq!(fx.tree.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_modified_file_keeps_id() {
        let fx = Fixture::new();
        std::fs::write(fx.dir.path().join("f"), b"one").unwrap();
        fx.full_scan(ScanOptions::default()).await;
        let before = fx.tree.get(Path::new("f")).unwrap();

        std::fs::write(fx.dir.path().join("f"), b"three").unwrap();
        let changes = fx.delta(ScanOptions::default()).await;
        assert_eq!(summary(&changes), vec!["upsert f file"]);

        let after = fx.tree.get(Path::new("f")).unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.blob.unwrap().size, 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_weak_link_is_stable() {
        let fx = Fixture::new();
        std::fs::create_dir(fx.dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink(fx.dir.path().join("a"), fx.dir.path().join("a/loop"))
            .unwrap();
        let options = ScanOptions {
            follow_links: true,
            ..ScanOptions::default()
        };
        fx.full_scan(options.clone()).await;
        assert!(matches!(
            fx.tree.get(Path::new("a/loop")).unwrap().kind,
            EntryKind::Link { weak: true, .. }
        ));
        assert!(fx.delta(options).await.is_empty());
    }
}
