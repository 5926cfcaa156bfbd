use std::collections::BTreeMap;

use crate::types::CommitSeq;

/// Reference counts of snapshots currently pinned by open readers.
///
/// The oldest pinned snapshot is the horizon below which superseded versions can
/// be dropped.
#[derive(Clone, Debug, Default)]
pub struct SnapshotPins {
    pins: BTreeMap<CommitSeq, u32>,
}

impl SnapshotPins {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one reader at `seq`.
    pub fn pin(&mut self, seq: CommitSeq) {
        let counter = self.pins.entry(seq).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    /// Releases one reader at `seq`. Unknown sequences are ignored.
    pub fn unpin(&mut self, seq: CommitSeq) {
        if let Some(counter) = self.pins.get_mut(&seq) {
            if *counter > 1 {
                *counter -= 1;
            } else {
                self.pins.remove(&seq);
            }
        }
    }

    /// Oldest pinned snapshot, if any reader is active.
    pub fn oldest(&self) -> Option<CommitSeq> {
        self.pins.keys().next().copied()
    }

    /// Total number of active pins.
    pub fn active(&self) -> u64 {
        self.pins.values().map(|count| u64::from(*count)).sum()
    }
}
