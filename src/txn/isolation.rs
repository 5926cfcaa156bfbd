use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::record::TxnRecord;
use crate::types::{CommitSeq, Conflict, Result, TxnId, UmbraError};

#[derive(Default)]
struct IsolationSets {
    /// Open transactions and the snapshot each one reads at.
    uncommitted: BTreeMap<TxnId, CommitSeq>,
    /// Validated transactions whose writes are being applied.
    committing: BTreeMap<TxnId, Arc<TxnRecord>>,
    /// Committed transactions keyed by their (unique) end sequence.
    committed: BTreeMap<CommitSeq, Arc<TxnRecord>>,
}

impl IsolationSets {
    fn oldest_open_snapshot(&self) -> Option<CommitSeq> {
        let uncommitted = self.uncommitted.values().copied().min();
        let committing = self
            .committing
            .values()
            .map(|record| record.snapshot_start())
            .min();
        match (uncommitted, committing) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Purges committed records no open transaction can still conflict with.
    fn purge_committed(&mut self) -> Vec<TxnId> {
        let cleanup_until = match self.oldest_open_snapshot() {
            Some(oldest) => oldest,
            None => match self.committed.keys().next_back() {
                Some(newest) => newest.saturating_add(1),
                None => return Vec::new(),
            },
        };
        let retained = self.committed.split_off(&cleanup_until);
        let purged = std::mem::replace(&mut self.committed, retained);
        purged.into_values().map(|record| record.id()).collect()
    }

    /// Committing records followed by committed ones that ended after `snapshot_start`.
    fn may_conflict(&self, snapshot_start: CommitSeq) -> Vec<Arc<TxnRecord>> {
        let mut out: Vec<Arc<TxnRecord>> = self.committing.values().cloned().collect();
        out.extend(
            self.committed
                .range(snapshot_start.saturating_add(1)..)
                .map(|(_, record)| Arc::clone(record)),
        );
        out
    }
}

/// Point-in-time view of the isolation sets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IsolationSnapshot {
    /// Open transactions that have not requested commit.
    pub uncommitted: usize,
    /// Transactions between validation and promotion.
    pub committing: usize,
    /// Committed records still retained for conflict checks.
    pub committed: usize,
    /// Oldest snapshot any open transaction reads at.
    pub oldest_open_snapshot: Option<CommitSeq>,
}

/// Commit-time conflict validator for optimistic transactions.
///
/// Tracks every transaction from open to purge in three sets guarded by one mutex.
/// Validation and promotion never perform I/O while holding it.
pub struct IsolationManager {
    sets: Mutex<IsolationSets>,
    cleanup_running: AtomicBool,
}

impl IsolationManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(IsolationSets::default()),
            cleanup_running: AtomicBool::new(false),
        }
    }

    /// Registers transaction `id` as open. `snapshot` is evaluated while the sets are
    /// locked so no record the transaction could conflict with is purged in between.
    pub fn open(&self, id: TxnId, snapshot: impl FnOnce() -> CommitSeq) -> CommitSeq {
        let mut sets = self.sets.lock();
        let seq = snapshot();
        sets.uncommitted.insert(id, seq);
        trace!(txn = id, snapshot = seq, "isolation.open");
        seq
    }

    /// Fallible variant of [`IsolationManager::open`]: `begin` produces a value together
    /// with the snapshot it reads at. Nothing is registered if `begin` fails.
    pub fn try_open<T>(
        &self,
        id: TxnId,
        begin: impl FnOnce() -> Result<(T, CommitSeq)>,
    ) -> Result<T> {
        let mut sets = self.sets.lock();
        let (value, seq) = begin()?;
        sets.uncommitted.insert(id, seq);
        trace!(txn = id, snapshot = seq, "isolation.open");
        Ok(value)
    }

    /// Checks `record` against every concurrent transaction and, if it passes, moves it
    /// from uncommitted to committing.
    ///
    /// Returns the may-conflict set: every committing record plus every committed record
    /// whose end sequence is strictly greater than `record`'s start. On a conflict the
    /// sets are left unchanged and the transaction remains abortable.
    pub fn validate_and_start_commit(
        &self,
        record: &Arc<TxnRecord>,
    ) -> Result<Vec<Arc<TxnRecord>>> {
        let id = record.id();
        let mut sets = self.sets.lock();
        if !sets.uncommitted.contains_key(&id) {
            return Err(UmbraError::Invalid("transaction is not open"));
        }
        if !record.has_tracked_write() {
            sets.uncommitted.remove(&id);
            sets.committing.insert(id, Arc::clone(record));
            trace!(txn = id, "isolation.commit.exempt");
            return Ok(Vec::new());
        }
        let candidates = sets.may_conflict(record.snapshot_start());
        let ours = &record.writes().tracked;
        for candidate in &candidates {
            let theirs = &candidate.writes().tracked;
            let conflict = if ours.modify_delete_conflict(theirs) {
                Some(Conflict::ModifyDelete)
            } else if ours.delete_modify_conflict(theirs) {
                Some(Conflict::DeleteModify)
            } else if ours.exclusive_create_conflict(theirs) {
                Some(Conflict::ExclusiveCreate)
            } else {
                None
            };
            if let Some(conflict) = conflict {
                debug!(
                    txn = id,
                    against = candidate.id(),
                    ?conflict,
                    "isolation.commit.conflict"
                );
                return Err(conflict.into());
            }
        }
        sets.uncommitted.remove(&id);
        sets.committing.insert(id, Arc::clone(record));
        trace!(txn = id, candidates = candidates.len(), "isolation.commit.validated");
        Ok(candidates)
    }

    /// Promotes a committing record to committed with the store-assigned `snapshot_end`.
    pub fn committed(&self, record: &Arc<TxnRecord>, snapshot_end: CommitSeq) -> Result<()> {
        let id = record.id();
        let mut sets = self.sets.lock();
        if !sets.committing.contains_key(&id) {
            return Err(UmbraError::Invalid("transaction is not committing"));
        }
        if sets.committed.contains_key(&snapshot_end) || !record.set_snapshot_end(snapshot_end) {
            return Err(UmbraError::Invalid("commit sequence already assigned"));
        }
        sets.committing.remove(&id);
        sets.committed.insert(snapshot_end, Arc::clone(record));
        trace!(txn = id, snapshot_end, "isolation.committed");
        Ok(())
    }

    /// Forgets transaction `id` if it never reached committed, then purges committed
    /// records nobody can conflict with anymore. Returns the purged transaction ids.
    pub fn closed(&self, id: TxnId) -> Vec<TxnId> {
        {
            let mut sets = self.sets.lock();
            sets.uncommitted.remove(&id);
            sets.committing.remove(&id);
        }
        self.cleanup_committed()
    }

    /// Purges every committed record ending before the oldest open snapshot (or all of
    /// them when nothing is open). A concurrent call returns immediately with nothing.
    pub fn cleanup_committed(&self) -> Vec<TxnId> {
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Vec::new();
        }
        let purged = self.sets.lock().purge_committed();
        self.cleanup_running.store(false, Ordering::Release);
        if !purged.is_empty() {
            trace!(purged = purged.len(), "isolation.cleanup");
        }
        purged
    }

    /// Ids of transactions that are open or committing.
    pub fn not_committed(&self) -> Vec<TxnId> {
        let sets = self.sets.lock();
        sets.uncommitted
            .keys()
            .chain(sets.committing.keys())
            .copied()
            .collect()
    }

    /// Number of committed records currently retained.
    pub fn committed_count(&self) -> usize {
        self.sets.lock().committed.len()
    }

    /// Captures the sizes of the isolation sets.
    pub fn snapshot(&self) -> IsolationSnapshot {
        let sets = self.sets.lock();
        IsolationSnapshot {
            uncommitted: sets.uncommitted.len(),
            committing: sets.committing.len(),
            committed: sets.committed.len(),
            oldest_open_snapshot: sets.oldest_open_snapshot(),
        }
    }
}

impl Default for IsolationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IsolationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationManager")
            .field("sets", &self.snapshot())
            .finish()
    }
}
