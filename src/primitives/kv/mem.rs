use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{decode_counter, encode_counter, BatchOp, KvStore, SnapshotPins, WriteBatch};
use crate::types::{CommitSeq, Result, UmbraError};

#[derive(Clone, Debug)]
struct Version {
    seq: CommitSeq,
    /// `None` marks a tombstone.
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct MemState {
    latest: CommitSeq,
    data: BTreeMap<Vec<u8>, Vec<Version>>,
}

/// In-memory multi-version store.
///
/// Every key holds a chain of versions ordered by commit sequence. Readers pin the
/// sequence they read at; when a batch touches a key, versions no pinned reader can
/// observe are pruned from that key's chain.
#[derive(Default)]
pub struct MemKv {
    state: RwLock<MemState>,
    pins: Mutex<SnapshotPins>,
    closed: AtomicBool,
}

impl MemKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys at the latest sequence.
    pub fn live_keys(&self) -> usize {
        let state = self.state.read();
        state
            .data
            .values()
            .filter(|chain| chain.last().is_some_and(|v| v.value.is_some()))
            .count()
    }

    /// Total retained versions across all keys.
    pub fn retained_versions(&self) -> usize {
        self.state.read().data.values().map(Vec::len).sum()
    }

    /// Makes a closed store usable again with its contents intact, the in-memory
    /// counterpart of reopening the same files.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UmbraError::ResourceClosed("kv store"));
        }
        Ok(())
    }
}

fn visible(chain: &[Version], at: CommitSeq) -> Option<&Version> {
    chain.iter().rev().find(|version| version.seq <= at)
}

/// Drops versions older than the newest one visible at `horizon`.
fn prune(chain: &mut Vec<Version>, horizon: CommitSeq) {
    if let Some(keep_from) = chain.iter().rposition(|version| version.seq <= horizon) {
        if keep_from > 0 {
            chain.drain(..keep_from);
        }
    }
}

/// A chain reduced to one tombstone that every pinned reader already sees.
fn is_dead(chain: &[Version], horizon: CommitSeq) -> bool {
    matches!(chain, [only] if only.value.is_none() && only.seq <= horizon)
}

impl KvStore for MemKv {
    fn pin_latest(&self) -> Result<CommitSeq> {
        self.ensure_open()?;
        let state = self.state.read();
        let seq = state.latest;
        self.pins.lock().pin(seq);
        Ok(seq)
    }

    fn unpin(&self, seq: CommitSeq) {
        self.pins.lock().unpin(seq);
    }

    fn latest_seq(&self) -> CommitSeq {
        self.state.read().latest
    }

    fn get(&self, key: &[u8], at: CommitSeq) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(state
            .data
            .get(key)
            .and_then(|chain| visible(chain, at))
            .and_then(|version| version.value.clone()))
    }

    fn scan_prefix(&self, prefix: &[u8], at: CommitSeq) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let state = self.state.read();
        let mut out = Vec::new();
        for (key, chain) in state.data.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(value) = visible(chain, at).and_then(|v| v.value.as_ref()) {
                out.push((key.clone(), value.clone()));
            }
        }
        Ok(out)
    }

    fn apply(&self, batch: WriteBatch) -> Result<CommitSeq> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let seq = state.latest + 1;
        let (horizon, pinned) = {
            let pins = self.pins.lock();
            (pins.oldest().unwrap_or(seq).min(seq), pins.active())
        };
        let ops = batch.len();
        // Resolve merges before touching any chain so a corrupt counter fails the whole batch.
        let mut resolved = Vec::with_capacity(ops);
        for (key, op) in batch.into_ops() {
            let value = match op {
                BatchOp::Put(value) => Some(value),
                BatchOp::Delete => None,
                BatchOp::Merge(delta) => {
                    let current = state
                        .data
                        .get(&key)
                        .and_then(|chain| chain.last())
                        .and_then(|v| v.value.as_deref());
                    let base = decode_counter(current)?;
                    Some(encode_counter(base.wrapping_add(delta)).to_vec())
                }
            };
            resolved.push((key, value));
        }
        // Only the chains this batch touches are pruned.
        for (key, value) in resolved {
            match state.data.entry(key) {
                Entry::Vacant(entry) => {
                    // A tombstone for a key no snapshot holds is never observable.
                    if value.is_some() {
                        entry.insert(vec![Version { seq, value }]);
                    }
                }
                Entry::Occupied(mut entry) => {
                    let chain = entry.get_mut();
                    chain.push(Version { seq, value });
                    prune(chain, horizon);
                    if is_dead(chain, horizon) {
                        entry.remove();
                    }
                }
            }
        }
        state.latest = seq;
        trace!(seq, ops, horizon, pinned, "kv.apply");
        Ok(seq)
    }

    fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.write().data.clear();
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
