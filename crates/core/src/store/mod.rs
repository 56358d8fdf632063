//! Ordered key/value storage on LMDB
//!
//! [`Partition`] is a sentinel-guarded namespace inside one LMDB database;
//! [`IndexedPartition`] layers transactional secondary indexes on top.

pub mod indexed;
pub mod partition;

pub use indexed::{IndexedPartition, Reduce};
pub use partition::{BatchOp, Cursor, Partition, PartitionTxn, PartitionView, Store};
