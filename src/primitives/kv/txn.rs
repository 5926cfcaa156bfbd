use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::{decode_counter, encode_counter, BatchOp, KvStore, WriteBatch};
use crate::types::{CommitSeq, Result, UmbraError};

/// Keys a transaction wrote in tracked mode.
///
/// Only tracked writes take part in commit-time conflict detection; bookkeeping such as
/// counters and statistics metadata is written untracked.
#[derive(Clone, Debug, Default)]
pub struct TrackedWrites {
    /// Keys created or updated.
    pub modified: FxHashSet<Vec<u8>>,
    /// Keys deleted.
    pub deleted: FxHashSet<Vec<u8>>,
    /// Keys whose creation must be exclusive among concurrent transactions.
    pub exclusive: FxHashSet<Vec<u8>>,
}

impl TrackedWrites {
    /// Whether no tracked write was recorded.
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.deleted.is_empty() && self.exclusive.is_empty()
    }

    /// `self` modified a key that `other` deleted.
    pub fn modify_delete_conflict(&self, other: &TrackedWrites) -> bool {
        intersects(&self.modified, &other.deleted)
    }

    /// `self` deleted a key that `other` modified.
    pub fn delete_modify_conflict(&self, other: &TrackedWrites) -> bool {
        intersects(&self.deleted, &other.modified)
    }

    /// Both sides exclusively wrote the same key.
    pub fn exclusive_create_conflict(&self, other: &TrackedWrites) -> bool {
        intersects(&self.exclusive, &other.exclusive)
    }
}

fn intersects(a: &FxHashSet<Vec<u8>>, b: &FxHashSet<Vec<u8>>) -> bool {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().any(|key| large.contains(key))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum KvTxnState {
    Open,
    Committed,
    RolledBack,
}

/// Store transaction: snapshot reads overlaid with a private write buffer.
///
/// The snapshot is pinned in the store for the lifetime of the transaction.
pub struct KvTxn {
    store: Arc<dyn KvStore>,
    snapshot: CommitSeq,
    writes: WriteBatch,
    tracked: TrackedWrites,
    state: KvTxnState,
}

impl KvTxn {
    /// Opens a transaction reading at the store's latest committed sequence.
    pub fn begin(store: Arc<dyn KvStore>) -> Result<Self> {
        let snapshot = store.pin_latest()?;
        Ok(Self {
            store,
            snapshot,
            writes: WriteBatch::new(),
            tracked: TrackedWrites::default(),
            state: KvTxnState::Open,
        })
    }

    /// Sequence this transaction reads at.
    pub fn snapshot(&self) -> CommitSeq {
        self.snapshot
    }

    /// Point read through the write buffer.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.writes.op(key) {
            Some(BatchOp::Put(value)) => Ok(Some(value.clone())),
            Some(BatchOp::Delete) => Ok(None),
            Some(BatchOp::Merge(delta)) => {
                let base = self.store.get(key, self.snapshot)?;
                let value = decode_counter(base.as_deref())?.wrapping_add(*delta);
                Ok(Some(encode_counter(value).to_vec()))
            }
            None => self.store.get(key, self.snapshot),
        }
    }

    /// Whether `key` is live in this transaction's view.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Reads a merge counter; absent counters read as zero.
    pub fn counter(&self, key: &[u8]) -> Result<i64> {
        decode_counter(self.get(key)?.as_deref())
    }

    /// Ordered scan of `prefix` through the write buffer.
    pub fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> = self
            .store
            .scan_prefix(prefix, self.snapshot)?
            .into_iter()
            .collect();
        for (key, op) in self.writes.ops_with_prefix(prefix) {
            match op {
                BatchOp::Put(value) => {
                    rows.insert(key.clone(), value.clone());
                }
                BatchOp::Delete => {
                    rows.remove(key);
                }
                BatchOp::Merge(delta) => {
                    let base = decode_counter(rows.get(key).map(Vec::as_slice))?;
                    rows.insert(key.clone(), encode_counter(base.wrapping_add(*delta)).to_vec());
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    /// Buffers a put that does not take part in conflict detection.
    pub fn put_untracked(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.put(key, value);
    }

    /// Buffers a delete that does not take part in conflict detection.
    pub fn delete_untracked(&mut self, key: Vec<u8>) {
        self.writes.delete(key);
    }

    /// Buffers a counter increment.
    pub fn merge_untracked(&mut self, key: Vec<u8>, delta: i64) -> Result<()> {
        self.writes.merge(key, delta)
    }

    /// Buffers a put recorded as a modification; `exclusive` marks a create that no
    /// concurrent transaction may repeat.
    pub fn put_tracked(&mut self, key: Vec<u8>, value: Vec<u8>, exclusive: bool) {
        self.tracked.deleted.remove(&key);
        if exclusive {
            self.tracked.exclusive.insert(key.clone());
        }
        self.tracked.modified.insert(key.clone());
        self.writes.put(key, value);
    }

    /// Records `key` as modified without writing it, so a concurrent delete conflicts.
    pub fn touch_tracked(&mut self, key: Vec<u8>) {
        if !self.tracked.deleted.contains(&key) {
            self.tracked.modified.insert(key);
        }
    }

    /// Buffers a delete recorded for conflict detection.
    pub fn delete_tracked(&mut self, key: Vec<u8>) {
        self.tracked.modified.remove(&key);
        self.tracked.exclusive.remove(&key);
        self.tracked.deleted.insert(key.clone());
        self.writes.delete(key);
    }

    /// Buffers a delete that no concurrent transaction may repeat: a second deleter of
    /// `key` fails validation with an exclusive-write conflict.
    pub fn delete_tracked_exclusive(&mut self, key: Vec<u8>) {
        self.tracked.modified.remove(&key);
        self.tracked.exclusive.insert(key.clone());
        self.tracked.deleted.insert(key.clone());
        self.writes.delete(key);
    }

    /// Tracked writes recorded so far.
    pub fn tracked(&self) -> &TrackedWrites {
        &self.tracked
    }

    /// Whether the write buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Applies the buffered writes atomically. Returns `None` when there was nothing
    /// to write.
    pub fn commit(&mut self) -> Result<Option<CommitSeq>> {
        if self.state != KvTxnState::Open {
            return Err(UmbraError::Invalid("store transaction already finished"));
        }
        self.state = KvTxnState::Committed;
        if self.writes.is_empty() {
            return Ok(None);
        }
        let batch = std::mem::take(&mut self.writes);
        self.store.apply(batch).map(Some)
    }

    /// Discards the buffered writes.
    pub fn rollback(&mut self) {
        if self.state == KvTxnState::Open {
            self.writes = WriteBatch::new();
            self.state = KvTxnState::RolledBack;
        }
    }
}

impl Drop for KvTxn {
    fn drop(&mut self) {
        self.store.unpin(self.snapshot);
    }
}

impl std::fmt::Debug for KvTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvTxn")
            .field("snapshot", &self.snapshot)
            .field("buffered", &self.writes.len())
            .field("state", &self.state)
            .finish()
    }
}
