//! Ordered key/value store contract consumed by the transaction layer.
//!
//! The engine behind [`KvStore`] owns durability and versioning; the core only relies on
//! snapshot reads at a [`CommitSeq`], atomic application of a [`WriteBatch`], and
//! numeric merge operands for counters. [`MemKv`] is the in-process engine used by
//! default.

use std::collections::btree_map::{self, BTreeMap};

use crate::types::{CommitSeq, Result, UmbraError};

mod mem;
mod snapshots;
mod txn;

pub use mem::MemKv;
pub use snapshots::SnapshotPins;
pub use txn::{KvTxn, TrackedWrites};

/// Length of an encoded counter value.
pub const COUNTER_LEN: usize = 8;

/// Storage engine contract.
///
/// All reads are evaluated against an explicit snapshot sequence so that callers can
/// hold a consistent view while other batches are applied.
pub trait KvStore: Send + Sync {
    /// Pins the latest committed sequence so versions visible at it are retained,
    /// and returns it.
    fn pin_latest(&self) -> Result<CommitSeq>;

    /// Releases a pin previously returned by [`KvStore::pin_latest`].
    fn unpin(&self, seq: CommitSeq);

    /// Returns the latest committed sequence.
    fn latest_seq(&self) -> CommitSeq;

    /// Point read at `at`.
    fn get(&self, key: &[u8], at: CommitSeq) -> Result<Option<Vec<u8>>>;

    /// Ordered scan of every live key starting with `prefix`, as visible at `at`.
    fn scan_prefix(&self, prefix: &[u8], at: CommitSeq) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically applies `batch` and returns the sequence assigned to it.
    fn apply(&self, batch: WriteBatch) -> Result<CommitSeq>;

    /// Removes every key. Used when a database is deleted.
    fn clear(&self) -> Result<()>;

    /// Closes the store; later operations fail with [`UmbraError::ResourceClosed`].
    fn close(&self);

    /// Whether [`KvStore::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// A single buffered mutation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BatchOp {
    /// Overwrite the value.
    Put(Vec<u8>),
    /// Remove the key.
    Delete,
    /// Add a signed delta to an `i64` counter, applied against the latest value.
    Merge(i64),
}

/// Ordered set of mutations applied atomically by [`KvStore::apply`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a put, replacing any earlier op on the key.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.insert(key, BatchOp::Put(value));
    }

    /// Buffers a delete, replacing any earlier op on the key.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.insert(key, BatchOp::Delete);
    }

    /// Buffers a counter merge, folding it into any earlier op on the key.
    pub fn merge(&mut self, key: Vec<u8>, delta: i64) -> Result<()> {
        match self.ops.entry(key) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(BatchOp::Merge(delta));
            }
            btree_map::Entry::Occupied(mut slot) => {
                let folded = match slot.get() {
                    BatchOp::Merge(existing) => BatchOp::Merge(existing.wrapping_add(delta)),
                    BatchOp::Put(value) => {
                        let base = decode_counter(Some(value))?;
                        BatchOp::Put(encode_counter(base.wrapping_add(delta)).to_vec())
                    }
                    BatchOp::Delete => BatchOp::Put(encode_counter(delta).to_vec()),
                };
                slot.insert(folded);
            }
        }
        Ok(())
    }

    /// Returns the buffered op for `key`.
    pub fn op(&self, key: &[u8]) -> Option<&BatchOp> {
        self.ops.get(key)
    }

    /// Iterates buffered ops whose key starts with `prefix`, in key order.
    pub fn ops_with_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a BatchOp)> + 'a {
        self.ops
            .range(prefix.to_vec()..)
            .take_while(move |(key, _)| key.starts_with(prefix))
    }

    /// Number of buffered keys.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, yielding ops in key order.
    pub fn into_ops(self) -> impl Iterator<Item = (Vec<u8>, BatchOp)> {
        self.ops.into_iter()
    }
}

/// Encodes a counter value.
pub fn encode_counter(value: i64) -> [u8; COUNTER_LEN] {
    value.to_be_bytes()
}

/// Decodes a counter value; an absent value reads as zero.
pub fn decode_counter(bytes: Option<&[u8]>) -> Result<i64> {
    match bytes {
        None => Ok(0),
        Some(bytes) if bytes.len() == COUNTER_LEN => {
            let mut buf = [0u8; COUNTER_LEN];
            buf.copy_from_slice(bytes);
            Ok(i64::from_be_bytes(buf))
        }
        Some(_) => Err(UmbraError::Corruption("counter value has wrong length")),
    }
}
