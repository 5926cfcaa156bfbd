use std::sync::OnceLock;

use rustc_hash::FxHashSet;

use crate::primitives::kv::TrackedWrites;
use crate::types::{AttributeIid, CommitSeq, HasEdge, TxnId};

/// Everything a transaction wrote, frozen when it requests commit.
#[derive(Clone, Debug, Default)]
pub struct WriteSummary {
    /// Tracked store keys used for conflict detection.
    pub tracked: TrackedWrites,
    /// Attributes this transaction created.
    pub attributes_created: FxHashSet<AttributeIid>,
    /// Attributes this transaction deleted.
    pub attributes_deleted: FxHashSet<AttributeIid>,
    /// `has` edges this transaction created.
    pub has_created: FxHashSet<HasEdge>,
    /// `has` edges this transaction deleted.
    pub has_deleted: FxHashSet<HasEdge>,
}

impl WriteSummary {
    /// Whether any tracked key was written. Transactions without one are exempt from
    /// conflict checking.
    pub fn has_tracked_write(&self) -> bool {
        !self.tracked.is_empty()
    }

    /// Whether a concurrent transaction could have skewed the statistics counters
    /// maintained by this one.
    pub fn may_miscount(&self) -> bool {
        !(self.attributes_created.is_empty()
            && self.attributes_deleted.is_empty()
            && self.has_created.is_empty()
            && self.has_deleted.is_empty())
    }
}

/// Isolation bookkeeping for one transaction.
///
/// Shared between the isolation sets and the statistics corrector. `snapshot_end` is set
/// exactly once, when the record is promoted to committed.
#[derive(Debug)]
pub struct TxnRecord {
    id: TxnId,
    snapshot_start: CommitSeq,
    writes: WriteSummary,
    snapshot_end: OnceLock<CommitSeq>,
}

impl TxnRecord {
    /// Creates the record of a transaction that read at `snapshot_start`.
    pub fn new(id: TxnId, snapshot_start: CommitSeq, writes: WriteSummary) -> Self {
        Self {
            id,
            snapshot_start,
            writes,
            snapshot_end: OnceLock::new(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Sequence the transaction read at.
    pub fn snapshot_start(&self) -> CommitSeq {
        self.snapshot_start
    }

    /// Sequence assigned to the transaction's writes, once committed.
    pub fn snapshot_end(&self) -> Option<CommitSeq> {
        self.snapshot_end.get().copied()
    }

    /// Frozen write summary.
    pub fn writes(&self) -> &WriteSummary {
        &self.writes
    }

    /// Shorthand for [`WriteSummary::has_tracked_write`].
    pub fn has_tracked_write(&self) -> bool {
        self.writes.has_tracked_write()
    }

    /// Shorthand for [`WriteSummary::may_miscount`].
    pub fn may_miscount(&self) -> bool {
        self.writes.may_miscount()
    }

    /// Returns `false` if the end sequence had already been set.
    pub(crate) fn set_snapshot_end(&self, seq: CommitSeq) -> bool {
        self.snapshot_end.set(seq).is_ok()
    }
}
