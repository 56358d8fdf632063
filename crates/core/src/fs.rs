//! Injected filesystem capability
//!
//! Scanners never touch `std::fs` directly; they go through [`Filesystem`] so
//! traversal logic can run against any backing store.

use std::ffi::OsString;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;

use crate::hash::ContentHash;

/// What an inode is, as far as the engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    /// Sockets, FIFOs and device nodes.
    Other,
}

/// Stat result with millisecond timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub mtime_ms: i64,
    pub birthtime_ms: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub ino: u64,
    pub dev: u64,
}

impl FileStat {
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };

        let mtime_ms = meta.modified().map(to_millis).unwrap_or(0);
        // Fall back to mtime where the platform has no birth time.
        let birthtime_ms = meta.created().map(to_millis).unwrap_or(mtime_ms);
        let (uid, gid, mode, ino, dev) = unix_fields(meta);

        Self {
            kind,
            size: meta.len(),
            mtime_ms,
            birthtime_ms,
            uid,
            gid,
            mode,
            ino,
            dev,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[cfg(unix)]
fn unix_fields(meta: &Metadata) -> (u32, u32, u32, u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid(), meta.mode(), meta.ino(), meta.dev())
}

#[cfg(not(unix))]
fn unix_fields(meta: &Metadata) -> (u32, u32, u32, u64, u64) {
    let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    (0, 0, mode, 0, 0)
}

fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

/// Async filesystem operations used by the scanners.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Names of a directory's children, in no particular order.
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<OsString>>;

    /// Stat following symlinks.
    async fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Stat without following symlinks.
    async fn lstat(&self, path: &Path) -> io::Result<FileStat>;

    async fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    async fn hash_file(&self, path: &Path) -> io::Result<ContentHash>;
}

/// The local disk through `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait]
impl Filesystem for LocalFs {
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        Ok(names)
    }

    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(FileStat::from_metadata(&meta))
    }

    async fn lstat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        Ok(FileStat::from_metadata(&meta))
    }

    async fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        tokio::fs::read_link(path).await
    }

    async fn hash_file(&self, path: &Path) -> io::Result<ContentHash> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || ContentHash::from_file(&path))
            .await
            .map_err(io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_fs_stat_and_read_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let fs = LocalFs;
        let mut names = fs.read_dir(dir.path()).await.unwrap();
        names.sort();
        assert_eq!(names, vec![OsString::from("a.txt"), OsString::from("sub")]);

        let stat = fs.stat(&dir.path().join("a.txt")).await.unwrap();
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, 5);
        assert!(fs.stat(&dir.path().join("sub")).await.unwrap().is_dir());

        let missing = fs.stat(&dir.path().join("nope")).await.unwrap_err();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);

        let hash = fs.hash_file(&dir.path().join("a.txt")).await.unwrap();
        assert_eq!(hash, ContentHash::from_bytes(b"hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lstat_sees_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();

        let fs = LocalFs;
        let link = dir.path().join("link");
        assert_eq!(fs.lstat(&link).await.unwrap().kind, FileKind::Symlink);
        assert_eq!(fs.stat(&link).await.unwrap().kind, FileKind::File);
        assert_eq!(fs.read_link(&link).await.unwrap(), PathBuf::from("target"));
    }
}
