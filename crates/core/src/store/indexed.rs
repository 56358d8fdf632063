//! Secondary indexes maintained in the same transaction as the rows
//!
//! Every mutation is inflated before it is written: the row's previous value
//! is read inside the write transaction, each registered reduce function runs
//! over the old and the new value, and the differing index rows are deleted
//! and inserted alongside the primary row. Index rows are therefore always
//! the exact image of the reduce functions over the live rows.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::partition::{BatchOp, Partition, PartitionTxn};
use crate::codec;
use crate::error::{Error, Result};
use crate::hash::ContentHash;

/// Maps a `(primary key, value)` row to its indexed value.
///
/// `None` leaves the row out of the index.
pub type Reduce = Arc<dyn Fn(&[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync>;

const ROW_SPACE: u8 = b'r';
const INDEX_SPACE: u8 = b'i';
const MARKER_SPACE: u8 = b'm';

/// A [`Partition`] with named secondary indexes.
#[derive(Clone)]
pub struct IndexedPartition {
    partition: Partition,
    indexes: Arc<RwLock<BTreeMap<String, Reduce>>>,
}

impl std::fmt::Debug for IndexedPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedPartition")
            .field("partition", &self.partition)
            .field("indexes", &self.index_names())
            .finish()
    }
}

impl IndexedPartition {
    #[must_use]
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            indexes: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// # Errors
    /// Returns a storage error if the sentinels cannot be written.
    pub fn prepare(&self) -> Result<()> {
        self.partition.prepare()
    }

    #[must_use]
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Register an index.
    ///
    /// A no-op if `name` is already registered. If the partition has no
    /// marker for `name`, every existing row is indexed in one transaction
    /// and the marker is written with it. An existing marker is trusted:
    /// writes through a handle that lacks a persisted index are refused, so
    /// no row can reach the partition without its index rows.
    ///
    /// # Errors
    /// Returns `NoHeader` or a storage error; the index stays unregistered.
    pub fn index(&self, name: &str, reduce: Reduce) -> Result<()> {
        if self
            .indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
        {
            return Ok(());
        }

        let backfilled = self.partition.transact(|txn| {
            let marker = marker_key(name);
            if txn.get(&marker)?.is_some() {
                return Ok(None);
            }
            let rows = txn.range(&[ROW_SPACE], Some([ROW_SPACE + 1].as_slice()))?;
            let mut count = 0usize;
            for (key, value) in &rows {
                let pk = &key[1..];
                if let Some(indexed) = reduce(pk, value) {
                    txn.put(&index_key(name, &indexed, pk), pk)?;
                    count += 1;
                }
            }
            txn.put(&marker, &[])?;
            Ok(Some(count))
        })?;

        if let Some(count) = backfilled {
            debug!(partition = self.partition.namespace(), index = name, count, "back-filled index");
        }

        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), reduce);
        Ok(())
    }

    /// Remove every row of an index and its marker, then deregister it.
    ///
    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.partition.transact(|txn| {
            let (start, end) = index_prefix_range(name, None);
            txn.del_range(&start, end.as_deref())?;
            txn.del(&marker_key(name))?;
            Ok(())
        })?;
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    /// # Errors
    /// Returns `NoHeader`, `NotFound` or a storage error.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.try_get(key)?.ok_or_else(|| {
            Error::NotFound(format!(
                "{}:{}",
                self.partition.namespace(),
                String::from_utf8_lossy(key)
            ))
        })
    }

    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.partition.try_get(&row_key(key))
    }

    /// # Errors
    /// Returns `NoHeader`, `IndexInconsistency` or a storage error.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.batch(vec![BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    /// # Errors
    /// Returns `NoHeader`, `IndexInconsistency` or a storage error.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.batch(vec![BatchOp::Del { key: key.to_vec() }])
    }

    /// Apply rows and their index maintenance in one transaction.
    ///
    /// Operations apply in order, so a later operation on the same key sees
    /// the earlier one.
    ///
    /// # Errors
    /// Returns `NoHeader`, `InvalidKey`, `IndexInconsistency` or a storage
    /// error. On error nothing is written.
    pub fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let indexes = self.snapshot_indexes();
        self.partition.transact(|txn| {
            check_markers(txn, &indexes)?;
            for op in &ops {
                if op.key().is_empty() {
                    return Err(Error::InvalidKey("empty primary key".into()));
                }
                match op {
                    BatchOp::Put { key, value } => inflate_put(txn, &indexes, key, value)?,
                    BatchOp::Del { key } => inflate_del(txn, &indexes, key)?,
                }
            }
            Ok(())
        })
    }

    /// Delete every row in `[start, end)` together with its index rows.
    ///
    /// # Errors
    /// Returns `NoHeader`, `IndexInconsistency` or a storage error.
    pub fn del_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<usize> {
        let indexes = self.snapshot_indexes();
        let (lo, hi) = row_range(start, end);
        self.partition.transact(|txn| {
            check_markers(txn, &indexes)?;
            let rows = txn.range(&lo, Some(hi.as_slice()))?;
            for (key, value) in &rows {
                let pk = &key[1..];
                for (name, reduce) in &indexes {
                    if let Some(indexed) = reduce(pk, value) {
                        txn.del(&index_key(name, &indexed, pk))?;
                    }
                }
            }
            txn.del_range(&lo, Some(hi.as_slice()))?;
            Ok(rows.len())
        })
    }

    /// Rows whose indexed value equals `value`, in primary-key hash order.
    ///
    /// # Errors
    /// Returns `NoHeader`, `IndexInconsistency` or a storage error.
    pub fn get_by(&self, name: &str, value: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (start, end) = index_prefix_range(name, Some(value));
        self.resolve(&start, end.as_deref())
    }

    /// Rows whose indexed value lies in `[lo, hi)`, ordered by indexed value.
    ///
    /// # Errors
    /// Returns `NoHeader`, `IndexInconsistency` or a storage error.
    pub fn get_by_range(
        &self,
        name: &str,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = index_value_prefix(name, lo);
        let end = match hi {
            Some(hi) => Some(index_value_prefix(name, hi)),
            None => index_prefix_range(name, None).1,
        };
        self.resolve(&start, end.as_deref())
    }

    /// Paged ascending iteration over primary rows in `[start, end)`.
    #[must_use]
    pub fn cursor(&self, start: &[u8], end: Option<&[u8]>) -> RowCursor {
        let (lo, hi) = row_range(start, end);
        RowCursor {
            inner: self.partition.cursor(&lo, Some(hi.as_slice())),
        }
    }

    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn is_empty(&self) -> Result<bool> {
        let mut cursor = self.cursor(&[], None).with_page_size(1);
        Ok(cursor.next_page()?.is_none())
    }

    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn count(&self) -> Result<usize> {
        let mut cursor = self.cursor(&[], None);
        let mut total = 0;
        while let Some(page) = cursor.next_page()? {
            total += page.len();
        }
        Ok(total)
    }

    fn resolve(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.partition.read(|view| {
            let hits = view.range(start, end)?;
            let mut rows = Vec::with_capacity(hits.len());
            for (index_key, pk) in hits {
                let value = view.get(&row_key(&pk))?.ok_or_else(|| {
                    Error::IndexInconsistency(format!(
                        "index row {} points at a missing row",
                        hex::encode(&index_key)
                    ))
                })?;
                rows.push((pk, value));
            }
            Ok(rows)
        })
    }

    fn snapshot_indexes(&self) -> Vec<(String, Reduce)> {
        self.indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, reduce)| (name.clone(), Arc::clone(reduce)))
            .collect()
    }
}

/// Paged reader over primary rows, yielding `(primary key, value)`.
#[derive(Debug)]
pub struct RowCursor {
    inner: super::partition::Cursor,
}

impl RowCursor {
    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        Self {
            inner: self.inner.with_page_size(page_size),
        }
    }

    /// # Errors
    /// Returns `NoHeader` or a storage error.
    pub fn next_page(&mut self) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
        Ok(self.inner.next_page()?.map(|page| {
            page.into_iter()
                .map(|(mut key, value)| {
                    key.remove(0);
                    (key, value)
                })
                .collect()
        }))
    }
}

/// Fail if the partition carries an index this handle does not maintain.
fn check_markers(txn: &PartitionTxn<'_, '_>, indexes: &[(String, Reduce)]) -> Result<()> {
    let markers = txn.range(&[MARKER_SPACE], Some([MARKER_SPACE + 1].as_slice()))?;
    for (key, _) in markers {
        if !indexes.iter().any(|(name, _)| marker_key(name) == key) {
            return Err(Error::IndexInconsistency(format!(
                "persisted index {} is not registered on this handle",
                hex::encode(&key)
            )));
        }
    }
    Ok(())
}

fn inflate_put(
    txn: &mut PartitionTxn<'_, '_>,
    indexes: &[(String, Reduce)],
    pk: &[u8],
    value: &[u8],
) -> Result<()> {
    let key = row_key(pk);
    let old = txn.get(&key).map_err(inflate_error)?;
    for (name, reduce) in indexes {
        let before = old.as_deref().and_then(|old| reduce(pk, old));
        let after = reduce(pk, value);
        if before == after {
            continue;
        }
        if let Some(before) = before {
            txn.del(&index_key(name, &before, pk)).map_err(inflate_error)?;
        }
        if let Some(after) = after {
            txn.put(&index_key(name, &after, pk), pk).map_err(inflate_error)?;
        }
    }
    txn.put(&key, value)
}

fn inflate_del(
    txn: &mut PartitionTxn<'_, '_>,
    indexes: &[(String, Reduce)],
    pk: &[u8],
) -> Result<()> {
    let key = row_key(pk);
    let Some(old) = txn.get(&key).map_err(inflate_error)? else {
        return Ok(());
    };
    for (name, reduce) in indexes {
        if let Some(before) = reduce(pk, &old) {
            txn.del(&index_key(name, &before, pk)).map_err(inflate_error)?;
        }
    }
    txn.del(&key)?;
    Ok(())
}

fn inflate_error(err: Error) -> Error {
    match err {
        Error::NoHeader { .. } | Error::IndexInconsistency(_) => err,
        other => Error::IndexInconsistency(other.to_string()),
    }
}

fn row_key(pk: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(pk.len() + 1);
    key.push(ROW_SPACE);
    key.extend_from_slice(pk);
    key
}

fn row_range(start: &[u8], end: Option<&[u8]>) -> (Vec<u8>, Vec<u8>) {
    let lo = row_key(start);
    let hi = match end {
        Some(end) => row_key(end),
        None => vec![ROW_SPACE + 1],
    };
    (lo, hi)
}

fn marker_key(name: &str) -> Vec<u8> {
    let mut key = vec![MARKER_SPACE];
    codec::encode_component(&mut key, name.as_bytes());
    key
}

fn index_value_prefix(name: &str, value: &[u8]) -> Vec<u8> {
    let mut key = vec![INDEX_SPACE];
    codec::encode_component(&mut key, name.as_bytes());
    codec::encode_component(&mut key, value);
    key
}

fn index_key(name: &str, value: &[u8], pk: &[u8]) -> Vec<u8> {
    let mut key = index_value_prefix(name, value);
    key.extend_from_slice(ContentHash::from_bytes(pk).as_bytes());
    key
}

/// Range of all index rows of `name`, or of those for one value.
fn index_prefix_range(name: &str, value: Option<&[u8]>) -> (Vec<u8>, Option<Vec<u8>>) {
    let start = match value {
        Some(value) => index_value_prefix(name, value),
        None => {
            let mut key = vec![INDEX_SPACE];
            codec::encode_component(&mut key, name.as_bytes());
            key
        }
    };
    let end = codec::prefix_end(&start);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn first_byte() -> Reduce {
        Arc::new(|_key: &[u8], value: &[u8]| value.first().map(|b| vec![*b]))
    }

    fn open(dir: &std::path::Path) -> IndexedPartition {
        let store = Store::open_with_map_size(dir, 16 * 1024 * 1024).unwrap();
        let rows = IndexedPartition::new(store.partition("rows"));
        rows.prepare().unwrap();
        rows
    }

    fn keys(rows: &[(Vec<u8>, Vec<u8>)]) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = rows.iter().map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_index_tracks_updates() {
        let dir = tempfile::tempdir().unwrap();
        let rows = open(dir.path());
        rows.index("first", first_byte()).unwrap();

        rows.put(b"k1", b"apple").unwrap();
        rows.put(b"k2", b"avocado").unwrap();
        rows.put(b"k3", b"banana").unwrap();
        assert_eq!(
            keys(&rows.get_by("first", b"a").unwrap()),
            vec![b"k1".to_vec(), b"k2".to_vec()]
        );

        rows.put(b"k2", b"blueberry").unwrap();
        rows.del(b"k1").unwrap();
        assert!(rows.get_by("first", b"a").unwrap().is_empty());
        assert_eq!(
            keys(&rows.get_by("first", b"b").unwrap()),
            vec![b"k2".to_vec(), b"k3".to_vec()]
        );
    }

    #[test]
    fn test_sparse_reduce() {
        let dir = tempfile::tempdir().unwrap();
        let rows = open(dir.path());
        rows.index("first", first_byte()).unwrap();

        rows.put(b"empty", b"").unwrap();
        rows.put(b"full", b"x").unwrap();
        let all = rows.get_by_range("first", &[], None).unwrap();
        assert_eq!(keys(&all), vec![b"full".to_vec()]);
    }

    #[test]
    fn test_backfill_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let rows = open(dir.path());
        rows.put(b"k1", b"apple").unwrap();
        rows.put(b"k2", b"cherry").unwrap();

        rows.index("first", first_byte()).unwrap();
        assert_eq!(keys(&rows.get_by("first", b"c").unwrap()), vec![b"k2".to_vec()]);

        rows.drop_index("first").unwrap();
        assert!(rows.index_names().is_empty());
        let leftover = rows
            .partition()
            .read(|view| view.range(&[INDEX_SPACE], Some([INDEX_SPACE + 1].as_slice())))
            .unwrap();
        assert!(leftover.is_empty());
        assert!(rows.partition().try_get(&marker_key("first")).unwrap().is_none());
    }

    #[test]
    fn test_unregistered_handle_cannot_write_past_an_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_with_map_size(dir.path(), 16 * 1024 * 1024).unwrap();
        let indexed = IndexedPartition::new(store.partition("rows"));
        indexed.prepare().unwrap();
        indexed.index("first", first_byte()).unwrap();
        indexed.put(b"k1", b"apple").unwrap();

        let bare = IndexedPartition::new(store.partition("rows"));
        assert!(matches!(
            bare.put(b"k2", b"avocado"),
            Err(Error::IndexInconsistency(_))
        ));
        assert!(matches!(
            bare.del_range(b"k", None),
            Err(Error::IndexInconsistency(_))
        ));
        assert!(bare.try_get(b"k2").unwrap().is_none());

        bare.index("first", first_byte()).unwrap();
        bare.put(b"k2", b"avocado").unwrap();
        assert_eq!(
            keys(&indexed.get_by("first", b"a").unwrap()),
            vec![b"k1".to_vec(), b"k2".to_vec()]
        );
    }

    #[test]
    fn test_get_by_range_orders_by_value() {
        let dir = tempfile::tempdir().unwrap();
        let rows = open(dir.path());
        rows.index("first", first_byte()).unwrap();

        rows.put(b"z", b"a").unwrap();
        rows.put(b"y", b"b").unwrap();
        rows.put(b"x", b"c").unwrap();
        rows.put(b"w", b"d").unwrap();

        let hits = rows.get_by_range("first", b"b", Some(b"d".as_slice())).unwrap();
        let pks: Vec<Vec<u8>> = hits.into_iter().map(|(k, _)| k).collect();
        assert_eq!(pks, vec![b"y".to_vec(), b"x".to_vec()]);
    }

    #[test]
    fn test_failed_batch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let rows = open(dir.path());
        rows.index("first", first_byte()).unwrap();

        let err = rows
            .batch(vec![
                BatchOp::Put {
                    key: b"good".to_vec(),
                    value: b"g".to_vec(),
                },
                BatchOp::Put {
                    key: Vec::new(),
                    value: b"bad".to_vec(),
                },
            ])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        assert!(rows.try_get(b"good").unwrap().is_none());
        assert!(rows.get_by("first", b"g").unwrap().is_empty());
    }

    #[test]
    fn test_del_range_removes_index_rows() {
        let dir = tempfile::tempdir().unwrap();
        let rows = open(dir.path());
        rows.index("first", first_byte()).unwrap();

        for key in [b"a1", b"a2", b"b1"] {
            rows.put(key, b"v").unwrap();
        }
        let removed = rows.del_range(b"a", Some(b"b".as_slice())).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(keys(&rows.get_by("first", b"v").unwrap()), vec![b"b1".to_vec()]);
        assert_eq!(rows.count().unwrap(), 1);
    }

    #[test]
    fn test_cursor_yields_primary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let rows = open(dir.path());
        rows.index("first", first_byte()).unwrap();
        assert!(rows.is_empty().unwrap());

        rows.put(b"b", b"2").unwrap();
        rows.put(b"a", b"1").unwrap();

        let mut cursor = rows.cursor(&[], None).with_page_size(1);
        let mut seen = Vec::new();
        while let Some(page) = cursor.next_page().unwrap() {
            seen.extend(page);
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec())
            ]
        );
    }
}
