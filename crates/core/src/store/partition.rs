//! Namespaced views over one LMDB database
//!
//! Key layout of a partition named `ns`:
//!
//! ```text
//! tuple(ns) ‖ 0x00            header sentinel
//! tuple(ns) ‖ 0x01 ‖ key      user rows
//! tuple(ns) ‖ 0xFF            footer sentinel
//! ```
//!
//! Header and footer bracket the partition's whole key range and are written
//! in one transaction by [`Partition::prepare`]. Every other operation
//! verifies both before touching user rows.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use tracing::debug;

use crate::codec;
use crate::error::{Error, Result};

/// Default LMDB map size (1 GiB).
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Rows returned per read transaction by a [`Cursor`].
pub const DEFAULT_PAGE_SIZE: usize = 256;

const HEADER_TAG: u8 = 0x00;
const ROWS_TAG: u8 = 0x01;
const FOOTER_TAG: u8 = 0xFF;
const SENTINEL_MAGIC: &[u8] = b"vsync.partition.v1:";

/// One write operation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

impl BatchOp {
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Del { key } => key,
        }
    }
}

/// The LMDB environment every partition lives in.
///
/// Uses LMDB (via heed) for ordered keys, atomic write transactions and
/// ascending range iteration.
#[derive(Clone)]
pub struct Store {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl Store {
    /// Open or create a store at the given directory.
    ///
    /// # Errors
    /// Returns an error if the environment cannot be opened or created.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    /// Open or create a store with an explicit LMDB map size.
    ///
    /// # Errors
    /// Returns an error if the environment cannot be opened or created.
    #[allow(unsafe_code)]
    pub fn open_with_map_size(path: &Path, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;

        // SAFETY: The unsafe is required by heed for memory-mapped I/O. The
        // only requirement is that the database file is not modified
        // externally while the Env is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let db: Database<Bytes, Bytes> = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name("partitions")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, db })
    }

    /// A view over the partition named `namespace`.
    ///
    /// The partition must be [prepared](Partition::prepare) before use.
    #[must_use]
    pub fn partition(&self, namespace: &str) -> Partition {
        Partition {
            env: self.env.clone(),
            db: self.db,
            namespace: Arc::from(namespace),
            prefix: Arc::from(codec::encode_tuple(&[namespace.as_bytes()])),
        }
    }
}

/// A namespaced, sentinel-guarded ordered key/value view.
#[derive(Clone)]
pub struct Partition {
    env: Env,
    db: Database<Bytes, Bytes>,
    namespace: Arc<str>,
    prefix: Arc<[u8]>,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Partition {
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Write the header/footer pair if it is not already valid.
    ///
    /// Both sentinels go into one write transaction. LMDB serializes writers,
    /// so concurrent callers converge on a single valid pair and later calls
    /// are no-ops.
    ///
    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn prepare(&self) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        if self.check(&wtxn).is_ok() {
            return Ok(());
        }

        let sentinel = self.sentinel();
        self.db.put(&mut wtxn, &self.tagged(HEADER_TAG), &sentinel)?;
        self.db.put(&mut wtxn, &self.tagged(FOOTER_TAG), &sentinel)?;
        wtxn.commit()?;

        debug!(namespace = %self.namespace, "prepared partition");
        Ok(())
    }

    /// Get a value, failing with [`Error::NotFound`] if absent.
    ///
    /// # Errors
    /// Returns `NoHeader`, `NotFound` or a storage error.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.try_get(key)?
            .ok_or_else(|| Error::NotFound(format!("{}:{}", self.namespace, hex::encode(key))))
    }

    /// Get a value, resolving `None` if absent.
    ///
    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read(|view| view.get(key))
    }

    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.transact(|txn| txn.put(key, value))
    }

    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.transact(|txn| txn.del(key).map(|_| ()))
    }

    /// Apply all operations atomically.
    ///
    /// # Errors
    /// Returns `NoHeader`, `InvalidKey` or a storage error; nothing is applied.
    pub fn batch(&self, ops: &[BatchOp]) -> Result<()> {
        self.transact(|txn| {
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => txn.put(key, value)?,
                    BatchOp::Del { key } => {
                        txn.del(key)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Delete every key in `[start, end)`; `None` means "to the end".
    ///
    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn del_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<usize> {
        self.transact(|txn| txn.del_range(start, end))
    }

    /// Paged ascending iteration over `[start, end)`.
    #[must_use]
    pub fn cursor(&self, start: &[u8], end: Option<&[u8]>) -> Cursor {
        Cursor {
            partition: self.clone(),
            next: Bound::Included(self.user_key(start)),
            end: self.user_end(end),
            page_size: DEFAULT_PAGE_SIZE,
            done: false,
        }
    }

    /// Run `f` inside one write transaction, committing only if it succeeds.
    ///
    /// # Errors
    /// Returns `NoHeader`, the closure's error, or a storage error.
    pub fn transact<T>(&self, f: impl FnOnce(&mut PartitionTxn<'_, '_>) -> Result<T>) -> Result<T> {
        let mut wtxn = self.env.write_txn()?;
        self.check(&wtxn)?;
        let out = {
            let mut txn = PartitionTxn {
                txn: &mut wtxn,
                partition: self,
            };
            f(&mut txn)?
        };
        wtxn.commit()?;
        Ok(out)
    }

    /// Run `f` against a consistent read snapshot.
    ///
    /// # Errors
    /// Returns `NoHeader`, the closure's error, or a storage error.
    pub fn read<T>(&self, f: impl FnOnce(&PartitionView<'_, '_>) -> Result<T>) -> Result<T> {
        let rtxn = self.env.read_txn()?;
        self.check(&rtxn)?;
        let view = PartitionView {
            txn: &rtxn,
            partition: self,
        };
        f(&view)
    }

    fn check(&self, txn: &RoTxn<'_>) -> Result<()> {
        let sentinel = self.sentinel();
        let header = self.db.get(txn, &self.tagged(HEADER_TAG))?;
        let footer = self.db.get(txn, &self.tagged(FOOTER_TAG))?;
        match (header, footer) {
            (Some(h), Some(f)) if h == sentinel.as_slice() && f == sentinel.as_slice() => Ok(()),
            _ => Err(Error::NoHeader {
                namespace: self.namespace.to_string(),
            }),
        }
    }

    fn sentinel(&self) -> Vec<u8> {
        let mut value = SENTINEL_MAGIC.to_vec();
        value.extend_from_slice(self.namespace.as_bytes());
        value
    }

    fn tagged(&self, tag: u8) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + 1);
        key.extend_from_slice(&self.prefix);
        key.push(tag);
        key
    }

    fn user_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = self.tagged(ROWS_TAG);
        full.extend_from_slice(key);
        full
    }

    fn user_end(&self, end: Option<&[u8]>) -> Vec<u8> {
        match end {
            Some(end) => self.user_key(end),
            None => self.tagged(ROWS_TAG + 1),
        }
    }

    fn strip<'k>(&self, full: &'k [u8]) -> &'k [u8] {
        &full[self.prefix.len() + 1..]
    }

    fn collect(
        &self,
        txn: &RoTxn<'_>,
        lower: Bound<&[u8]>,
        upper: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let bounds = (lower, Bound::Excluded(upper));
        let mut rows = Vec::new();
        for item in self.db.range(txn, &bounds)? {
            let (key, value) = item?;
            rows.push((self.strip(key).to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }
        Ok(rows)
    }
}

/// Read-only access to one partition inside a read transaction.
pub struct PartitionView<'t, 'e> {
    txn: &'t RoTxn<'e>,
    partition: &'t Partition,
}

impl PartitionView<'_, '_> {
    /// # Errors
    /// Returns a storage error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let full = self.partition.user_key(key);
        Ok(self
            .partition
            .db
            .get(&*self.txn, &full)?
            .map(<[u8]>::to_vec))
    }

    /// All rows in `[start, end)`.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let lower = self.partition.user_key(start);
        let upper = self.partition.user_end(end);
        self.partition
            .collect(&*self.txn, Bound::Included(lower.as_slice()), &upper, usize::MAX)
    }
}

/// Read-write access to one partition inside a write transaction.
pub struct PartitionTxn<'t, 'e> {
    txn: &'t mut RwTxn<'e>,
    partition: &'t Partition,
}

impl PartitionTxn<'_, '_> {
    /// Reads observe earlier writes of the same transaction.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let full = self.partition.user_key(key);
        Ok(self
            .partition
            .db
            .get(&*self.txn, &full)?
            .map(<[u8]>::to_vec))
    }

    /// # Errors
    /// Returns `InvalidKey` for an empty key, or a storage error.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidKey("empty key".into()));
        }
        let full = self.partition.user_key(key);
        self.partition.db.put(self.txn, &full, value)?;
        Ok(())
    }

    /// Returns whether the key existed.
    ///
    /// # Errors
    /// Returns `InvalidKey` for an empty key, or a storage error.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::InvalidKey("empty key".into()));
        }
        let full = self.partition.user_key(key);
        Ok(self.partition.db.delete(self.txn, &full)?)
    }

    /// # Errors
    /// Returns a storage error.
    pub fn del_range(&mut self, start: &[u8], end: Option<&[u8]>) -> Result<usize> {
        let lower = self.partition.user_key(start);
        let upper = self.partition.user_end(end);
        let bounds = (Bound::Included(lower.as_slice()), Bound::Excluded(upper.as_slice()));
        Ok(self.partition.db.delete_range(self.txn, &bounds)?)
    }

    /// All rows in `[start, end)`, including this transaction's writes.
    ///
    /// # Errors
    /// Returns a storage error.
    pub fn range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let lower = self.partition.user_key(start);
        let upper = self.partition.user_end(end);
        self.partition
            .collect(&*self.txn, Bound::Included(lower.as_slice()), &upper, usize::MAX)
    }
}

/// Paged ascending range reader.
///
/// Each page is read in its own short read transaction, so no transaction is
/// held between pages. The next page resumes strictly after the last key
/// returned: rows written behind the cursor are never revisited and rows
/// written ahead of it are observed.
#[derive(Debug)]
pub struct Cursor {
    partition: Partition,
    next: Bound<Vec<u8>>,
    end: Vec<u8>,
    page_size: usize,
    done: bool,
}

impl Cursor {
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The next page of `(key, value)` rows, or `None` when exhausted.
    ///
    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn next_page(&mut self) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
        if self.done {
            return Ok(None);
        }

        let partition = self.partition.clone();
        let lower = match &self.next {
            Bound::Included(key) => Bound::Included(key.as_slice()),
            Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let rows = partition.read(|view| {
            view.partition
                .collect(view.txn, lower, &self.end, self.page_size)
        })?;

        if rows.len() < self.page_size {
            self.done = true;
        }
        match rows.last() {
            Some((key, _)) => {
                self.next = Bound::Excluded(partition.user_key(key));
                Ok(Some(rows))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_with_map_size(dir.path(), 16 * 1024 * 1024).unwrap();
        (dir, store)
    }

    #[test]
    fn test_operations_require_prepare() {
        let (_dir, store) = open();
        let partition = store.partition("tree");

        let err = partition.put(b"k", b"v").unwrap_err();
        assert!(matches!(err, Error::NoHeader { .. }));
        assert!(matches!(
            partition.try_get(b"k").unwrap_err(),
            Error::NoHeader { .. }
        ));

        partition.prepare().unwrap();
        partition.put(b"k", b"v").unwrap();
        assert_eq!(partition.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let (_dir, store) = open();
        let partition = store.partition("tree");
        partition.prepare().unwrap();
        partition.put(b"k", b"v").unwrap();
        partition.prepare().unwrap();
        assert_eq!(partition.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_concurrent_prepare_converges() {
        let (_dir, store) = open();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let partition = store.partition("shared");
                std::thread::spawn(move || partition.prepare())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let partition = store.partition("shared");
        partition.put(b"k", b"v").unwrap();
        partition.prepare().unwrap();
        assert_eq!(partition.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_missing_footer_is_no_header() {
        let (_dir, store) = open();
        let partition = store.partition("tree");
        partition.prepare().unwrap();

        let mut wtxn = store.env.write_txn().unwrap();
        store
            .db
            .delete(&mut wtxn, &partition.tagged(FOOTER_TAG))
            .unwrap();
        wtxn.commit().unwrap();

        assert!(matches!(
            partition.get(b"k").unwrap_err(),
            Error::NoHeader { .. }
        ));
        partition.prepare().unwrap();
        assert!(partition.try_get(b"k").unwrap().is_none());
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let (_dir, store) = open();
        let a = store.partition("a");
        let ab = store.partition("ab");
        a.prepare().unwrap();
        ab.prepare().unwrap();

        a.put(b"key", b"from-a").unwrap();
        ab.put(b"key", b"from-ab").unwrap();

        assert_eq!(a.get(b"key").unwrap(), b"from-a");
        assert_eq!(ab.get(b"key").unwrap(), b"from-ab");

        let mut cursor = a.cursor(b"", None);
        let page = cursor.next_page().unwrap().unwrap();
        assert_eq!(page, vec![(b"key".to_vec(), b"from-a".to_vec())]);
        assert!(cursor.next_page().unwrap().is_none());
    }

    #[test]
    fn test_batch_is_atomic() {
        let (_dir, store) = open();
        let partition = store.partition("tree");
        partition.prepare().unwrap();

        let err = partition
            .batch(&[
                BatchOp::Put {
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                },
                BatchOp::Put {
                    key: Vec::new(),
                    value: b"2".to_vec(),
                },
            ])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        assert!(partition.try_get(b"a").unwrap().is_none());
    }

    #[test]
    fn test_cursor_pages_and_del_range() {
        let (_dir, store) = open();
        let partition = store.partition("tree");
        partition.prepare().unwrap();

        let ops: Vec<BatchOp> = (0u8..10)
            .map(|i| BatchOp::Put {
                key: vec![b'k', i],
                value: vec![i],
            })
            .collect();
        partition.batch(&ops).unwrap();

        let mut cursor = partition.cursor(b"k", None).with_page_size(4);
        let mut seen = Vec::new();
        while let Some(page) = cursor.next_page().unwrap() {
            assert!(page.len() <= 4);
            seen.extend(page.into_iter().map(|(_, v)| v[0]));
        }
        assert_eq!(seen, (0u8..10).collect::<Vec<_>>());

        let removed = partition.del_range(&[b'k', 2], Some([b'k', 5].as_slice())).unwrap();
        assert_eq!(removed, 3);
        let left = partition.read(|view| view.range(b"", None)).unwrap();
        assert_eq!(left.len(), 7);
    }
}
