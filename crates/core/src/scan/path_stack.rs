//! Ancestor chain of the directory being visited, for cycle detection

use std::io;
use std::path::{Path, PathBuf};

use crate::fs::Filesystem;

/// One open directory on the way down from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    /// Root-relative path; the root itself is the empty path.
    pub path: PathBuf,
    pub inode: u64,
    pub device: u64,
}

/// The `(device, inode)` identities of every directory above the current one.
///
/// A symlink whose target matches a level would lead the traversal back into
/// its own ancestor.
#[derive(Debug, Default, Clone)]
pub struct PathStack {
    levels: Vec<Level>,
}

impl PathStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<PathBuf>, inode: u64, device: u64) {
        self.levels.push(Level {
            path: path.into(),
            inode,
            device,
        });
    }

    /// Pop every level whose path is not a component-wise prefix of
    /// `candidate`.
    pub fn interrogate_path(&mut self, candidate: &Path) {
        while let Some(top) = self.levels.last() {
            if candidate.starts_with(&top.path) {
                break;
            }
            self.levels.pop();
        }
    }

    /// The outermost ancestor with this identity, if any.
    #[must_use]
    pub fn attempt(&self, inode: u64, device: u64) -> Option<&Level> {
        self.levels
            .iter()
            .find(|level| level.inode == inode && level.device == device)
    }

    /// Rebuild the chain so it holds every directory from the root down to
    /// the parent of `full_path`.
    ///
    /// Levels at or above `from_path` that are still ancestors of
    /// `full_path` are kept; the remaining directories are statted, following
    /// links when `follow` is set.
    ///
    /// # Errors
    /// Returns the first failed `stat`.
    pub async fn navigate_to(
        &mut self,
        fs: &dyn Filesystem,
        root: &Path,
        full_path: &Path,
        from_path: &Path,
        follow: bool,
    ) -> io::Result<()> {
        let target = full_path.parent().unwrap_or(Path::new(""));
        self.interrogate_path(from_path);
        self.interrogate_path(target);

        if self.levels.is_empty() {
            let stat = fs.stat(root).await?;
            self.push(PathBuf::new(), stat.ino, stat.dev);
        }

        let mut current = self
            .levels
            .last()
            .map(|top| top.path.clone())
            .unwrap_or_default();
        let Ok(rest) = target.strip_prefix(&current).map(Path::to_path_buf) else {
            return Ok(());
        };
        for component in rest.components() {
            current.push(component);
            let absolute = root.join(&current);
            let stat = if follow {
                fs.stat(&absolute).await?
            } else {
                fs.lstat(&absolute).await?
            };
            self.push(current.clone(), stat.ino, stat.dev);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn top(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn levels(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;

    #[test]
    fn test_interrogate_pops_non_ancestors() {
        let mut stack = PathStack::new();
        stack.push("", 1, 1);
        stack.push("a", 2, 1);
        stack.push("a/b", 3, 1);

        stack.interrogate_path(Path::new("a/b/c"));
        assert_eq!(stack.depth(), 3);

        // "a/bc" shares a string prefix with "a/b" but is not inside it
        stack.interrogate_path(Path::new("a/bc"));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.top().unwrap().path, PathBuf::from("a"));

        stack.interrogate_path(Path::new("z"));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_attempt_finds_outermost_match() {
        let mut stack = PathStack::new();
        stack.push("", 1, 7);
        stack.push("a", 2, 7);
        assert_eq!(stack.attempt(2, 7).unwrap().path, PathBuf::from("a"));
        assert!(stack.attempt(2, 8).is_none());
        assert!(stack.attempt(9, 7).is_none());
    }

    #[tokio::test]
    async fn test_navigate_to_stats_each_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();

        let mut stack = PathStack::new();
        stack
            .navigate_to(&LocalFs, dir.path(), Path::new("a/b/c"), Path::new(""), false)
            .await
            .unwrap();
        let paths: Vec<PathBuf> = stack.levels().map(|l| l.path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::new(), PathBuf::from("a"), PathBuf::from("a/b")]
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let b = std::fs::metadata(dir.path().join("a/b")).unwrap();
            assert!(stack.attempt(b.ino(), b.dev()).is_some());
        }

        // Moving sideways keeps the shared ancestors
        std::fs::create_dir_all(dir.path().join("a/x")).unwrap();
        stack
            .navigate_to(&LocalFs, dir.path(), Path::new("a/x/f"), Path::new("a"), false)
            .await
            .unwrap();
        let paths: Vec<PathBuf> = stack.levels().map(|l| l.path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::new(), PathBuf::from("a"), PathBuf::from("a/x")]
        );
    }
}
