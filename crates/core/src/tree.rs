//! Filesystem paths mapped onto an indexed partition
//!
//! Each stored path is one row keyed by its encoded relative path. The value
//! is the 32-byte hash of the parent's key followed by the archived
//! [`Entry`], and the `parent` index keys rows by that hash so a directory's
//! children are one index lookup. Descendants of a path are a contiguous key
//! range.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::codec;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::hash::{ContentHash, HASH_LEN};
use crate::scan::Change;
use crate::store::indexed::RowCursor;
use crate::store::{BatchOp, IndexedPartition, Partition};

/// Name of the children index.
pub const PARENT_INDEX: &str = "parent";

/// The stored mirror of one source tree.
#[derive(Debug, Clone)]
pub struct TreeAdapter {
    rows: IndexedPartition,
}

impl TreeAdapter {
    /// Prepare the partition and register the `parent` index.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn open(partition: Partition) -> Result<Self> {
        let rows = IndexedPartition::new(partition);
        rows.prepare()?;
        rows.index(
            PARENT_INDEX,
            Arc::new(|_key: &[u8], value: &[u8]| {
                ContentHash::from_prefix(value).map(|parent| parent.as_bytes().to_vec())
            }),
        )?;
        Ok(Self { rows })
    }

    #[must_use]
    pub fn rows(&self) -> &IndexedPartition {
        &self.rows
    }

    /// # Errors
    /// Returns `InvalidKey` for the root or a non-relative path, or a storage
    /// error.
    pub fn put(&self, path: &Path, entry: &Entry) -> Result<()> {
        self.rows.batch(vec![put_op(path, entry)?])
    }

    /// Store several entries in one transaction.
    ///
    /// # Errors
    /// Same as [`TreeAdapter::put`]; nothing is stored on error.
    pub fn put_many(&self, entries: &[(PathBuf, Entry)]) -> Result<()> {
        let ops = entries
            .iter()
            .map(|(path, entry)| put_op(path, entry))
            .collect::<Result<Vec<_>>>()?;
        self.rows.batch(ops)
    }

    /// Apply a mixed run of upserts and removals in one transaction.
    ///
    /// A removal deletes only the named row; callers emit one removal per
    /// descendant.
    ///
    /// # Errors
    /// Same as [`TreeAdapter::put`]; nothing is applied on error.
    pub fn apply(&self, changes: &[Change]) -> Result<()> {
        let ops = changes
            .iter()
            .map(|change| match change {
                Change::Upsert { path, entry } => put_op(path, entry),
                Change::Remove { path } => Ok(BatchOp::Del {
                    key: row_key(path)?,
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        self.rows.batch(ops)
    }

    /// # Errors
    /// Returns `InvalidKey` or a storage error.
    pub fn del(&self, path: &Path) -> Result<()> {
        self.rows.del(&row_key(path)?)
    }

    /// # Errors
    /// Returns `NotFound` if nothing is stored at `path`.
    pub fn get(&self, path: &Path) -> Result<Entry> {
        self.try_get(path)?
            .ok_or_else(|| Error::NotFound(path.display().to_string()))
    }

    /// # Errors
    /// Returns `Codec`, `InvalidKey` or a storage error.
    pub fn try_get(&self, path: &Path) -> Result<Option<Entry>> {
        let key = codec::encode_path(path)?;
        if key.is_empty() {
            return Ok(None);
        }
        self.rows
            .try_get(&key)?
            .map(|value| decode_row(&value))
            .transpose()
    }

    /// Direct children of `path` (the root is the empty path), sorted by key.
    ///
    /// # Errors
    /// Returns `Codec`, `IndexInconsistency` or a storage error.
    pub fn get_children(&self, path: &Path) -> Result<Vec<(PathBuf, Entry)>> {
        let parent = parent_hash(&codec::encode_path(path)?);
        let mut rows = self.rows.get_by(PARENT_INDEX, parent.as_bytes())?;
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter()
            .map(|(key, value)| Ok((codec::decode_path(&key)?, decode_row(&value)?)))
            .collect()
    }

    /// Remove `path` and every descendant; returns the number of rows.
    ///
    /// # Errors
    /// Returns `InvalidKey` or a storage error.
    pub fn del_sub_tree(&self, path: &Path) -> Result<usize> {
        let (start, end) = codec::subtree_range(&codec::encode_path(path)?);
        let removed = self.rows.del_range(&start, end.as_deref())?;
        debug!(path = %path.display(), removed, "deleted subtree");
        Ok(removed)
    }

    /// Visit `path` and its descendants in key order until `visit` breaks.
    ///
    /// # Errors
    /// Returns `Codec`, `InvalidKey` or a storage error.
    pub fn scan_sub_tree(
        &self,
        path: &Path,
        mut visit: impl FnMut(&Path, &Entry) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut cursor = self.sub_tree_cursor(path)?;
        while let Some(page) = cursor.next_page()? {
            for (row_path, entry) in page {
                if visit(&row_path, &entry).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Paged stream of `path` and its descendants.
    ///
    /// # Errors
    /// Returns `InvalidKey` for a non-relative path.
    pub fn sub_tree_cursor(&self, path: &Path) -> Result<TreeCursor> {
        let (start, end) = codec::subtree_range(&codec::encode_path(path)?);
        Ok(TreeCursor {
            inner: self.rows.cursor(&start, end.as_deref()),
        })
    }

    /// # Errors
    /// Returns a storage error.
    pub fn is_empty(&self) -> Result<bool> {
        self.rows.is_empty()
    }

    /// # Errors
    /// Returns a storage error.
    pub fn len(&self) -> Result<usize> {
        self.rows.count()
    }
}

/// Decoded pages of `(path, entry)` in key order.
#[derive(Debug)]
pub struct TreeCursor {
    inner: RowCursor,
}

impl TreeCursor {
    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        Self {
            inner: self.inner.with_page_size(page_size),
        }
    }

    /// # Errors
    /// Returns `Codec` or a storage error.
    pub fn next_page(&mut self) -> Result<Option<Vec<(PathBuf, Entry)>>> {
        let Some(page) = self.inner.next_page()? else {
            return Ok(None);
        };
        page.into_iter()
            .map(|(key, value)| Ok((codec::decode_path(&key)?, decode_row(&value)?)))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

/// Hash of the parent key of `key`; the root's children hash the empty key.
#[must_use]
pub fn parent_hash(key: &[u8]) -> ContentHash {
    ContentHash::from_bytes(key)
}

fn row_key(path: &Path) -> Result<Vec<u8>> {
    let key = codec::encode_path(path)?;
    if key.is_empty() {
        return Err(Error::InvalidKey("the root is not stored".into()));
    }
    Ok(key)
}

fn put_op(path: &Path, entry: &Entry) -> Result<BatchOp> {
    let key = row_key(path)?;
    let parent = path.parent().unwrap_or(Path::new(""));
    let mut value = parent_hash(&codec::encode_path(parent)?).as_bytes().to_vec();
    value.extend_from_slice(&entry.to_bytes()?);
    Ok(BatchOp::Put { key, value })
}

fn decode_row(value: &[u8]) -> Result<Entry> {
    let payload = value
        .get(HASH_LEN..)
        .ok_or_else(|| Error::Codec("tree row shorter than its parent hash".into()))?;
    Entry::from_bytes(payload)
}
