use std::sync::Arc;

use parking_lot::RwLockReadGuard;
use tracing::{debug, trace, warn};

use super::Database;
use crate::primitives::kv::KvTxn;
use crate::storage::keys;
use crate::txn::{TxnRecord, WriteSummary};
use crate::types::{
    AttributeIid, CommitSeq, HasEdge, Result, ThingIid, TxnId, TypeId, UmbraError,
};

/// Whether a transaction may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Snapshot reads only.
    Read,
    /// Reads and writes, validated at commit.
    Write,
}

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting operations.
    Active,
    /// Writes are durable and visible to later transactions.
    Committed,
    /// Commit was attempted past validation and failed.
    Failed,
    /// Discarded without committing.
    RolledBack,
}

/// A transaction over a [`Database`].
///
/// Reads observe the snapshot taken when the transaction opened, overlaid with the
/// transaction's own writes. Writes are buffered and applied atomically by
/// [`Transaction::commit`], which first validates them against every concurrent
/// transaction and fails with [`UmbraError::Isolation`] on a conflict. A conflict is
/// never retried automatically.
///
/// Dropping a transaction without committing rolls it back.
///
/// # Example
///
/// ```rust
/// use umbra::{AttributeIid, Database, DatabaseOptions, ThingIid, TransactionKind, TypeId};
///
/// let db = Database::create(DatabaseOptions::in_memory())?;
/// let person = ThingIid::new(TypeId(1), 1);
/// let name = AttributeIid::new(TypeId(2), "alice");
/// let mut tx = db.transaction(TransactionKind::Write)?;
/// tx.insert_thing(person)?;
/// tx.put_attribute(name.clone(), false)?;
/// tx.put_has(umbra::HasEdge::new(person, name))?;
/// tx.commit()?;
///
/// let tx = db.transaction(TransactionKind::Read)?;
/// assert_eq!(tx.vertex_count(TypeId(2))?, 1);
/// assert_eq!(tx.has_edge_count(TypeId(1), TypeId(2))?, 1);
/// # drop(tx);
/// # db.close()?;
/// # Ok::<(), umbra::UmbraError>(())
/// ```
pub struct Transaction<'db> {
    db: &'db Database,
    id: TxnId,
    kind: TransactionKind,
    kv: KvTxn,
    graph: WriteSummary,
    state: TxState,
    /// Whether a committed marker was written for this transaction.
    marked: bool,
    /// Registered with the isolation manager.
    registered: bool,
    _schema: Option<RwLockReadGuard<'db, ()>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn open(
        db: &'db Database,
        id: TxnId,
        kind: TransactionKind,
        schema: Option<RwLockReadGuard<'db, ()>>,
    ) -> Result<Self> {
        let kv = match kind {
            TransactionKind::Read => KvTxn::begin(Arc::clone(&db.store))?,
            TransactionKind::Write => {
                let store = Arc::clone(&db.store);
                db.isolation.try_open(id, move || {
                    let kv = KvTxn::begin(store)?;
                    let snapshot = kv.snapshot();
                    Ok((kv, snapshot))
                })?
            }
        };
        trace!(txn = id, ?kind, snapshot = kv.snapshot(), "db.transaction.open");
        Ok(Self {
            db,
            id,
            kind,
            kv,
            graph: WriteSummary::default(),
            state: TxState::Active,
            marked: false,
            registered: kind == TransactionKind::Write,
            _schema: schema,
        })
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Read or write.
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Commit sequence this transaction reads at.
    pub fn snapshot(&self) -> CommitSeq {
        self.kv.snapshot()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(UmbraError::Invalid("transaction is no longer active"));
        }
        if self.kind != TransactionKind::Write {
            return Err(UmbraError::Invalid("write on a read transaction"));
        }
        Ok(())
    }

    /// Inserts an entity or relation instance. Returns `false` if it already exists.
    ///
    /// Concurrent insertion of the same thing fails one of the two commits with
    /// [`crate::Conflict::ExclusiveCreate`].
    pub fn insert_thing(&mut self, iid: ThingIid) -> Result<bool> {
        self.ensure_writable()?;
        let key = keys::thing(&iid);
        if self.kv.contains(&key)? {
            return Ok(false);
        }
        self.kv.put_tracked(key, Vec::new(), true);
        self.kv.merge_untracked(keys::vertex_count(iid.type_id), 1)?;
        Ok(true)
    }

    /// Deletes a thing together with every `has` edge it owns. Returns `false` if it
    /// does not exist.
    ///
    /// Concurrent deletion of the same thing fails one of the two commits with
    /// [`crate::Conflict::ExclusiveCreate`], so its vertex count drops only once.
    pub fn delete_thing(&mut self, iid: ThingIid) -> Result<bool> {
        self.ensure_writable()?;
        let key = keys::thing(&iid);
        if !self.kv.contains(&key)? {
            return Ok(false);
        }
        for (has_key, _) in self.kv.iterate(&keys::has_owner_prefix(&iid))? {
            let edge = keys::decode_has_key(&has_key)?;
            self.delete_has(edge)?;
        }
        self.kv.delete_tracked_exclusive(key);
        self.kv.merge_untracked(keys::vertex_count(iid.type_id), -1)?;
        Ok(true)
    }

    /// Creates an attribute. Returns `false` if it already exists.
    ///
    /// Attributes are identified by type and value, so overlapping transactions may both
    /// create the same one. With `exclusive` set such commits conflict; otherwise both
    /// succeed and the attribute's vertex count is repaired in the background.
    pub fn put_attribute(&mut self, iid: AttributeIid, exclusive: bool) -> Result<bool> {
        self.ensure_writable()?;
        let key = keys::attribute(&iid);
        if self.kv.contains(&key)? {
            return Ok(false);
        }
        self.kv.put_tracked(key, Vec::new(), exclusive);
        self.kv.merge_untracked(keys::vertex_count(iid.type_id), 1)?;
        if !self.graph.attributes_deleted.remove(&iid) {
            self.graph.attributes_created.insert(iid);
        }
        Ok(true)
    }

    /// Deletes an attribute together with every `has` edge pointing at it. Returns
    /// `false` if it does not exist.
    pub fn delete_attribute(&mut self, iid: AttributeIid) -> Result<bool> {
        self.ensure_writable()?;
        let key = keys::attribute(&iid);
        if !self.kv.contains(&key)? {
            return Ok(false);
        }
        for (reverse_key, _) in self.kv.iterate(&keys::has_attribute_prefix(&iid))? {
            let edge = keys::decode_has_reverse_key(&reverse_key)?;
            // The prefix also covers longer values of the same type.
            if edge.attribute == iid {
                self.delete_has(edge)?;
            }
        }
        self.kv.delete_tracked(key);
        self.kv.merge_untracked(keys::vertex_count(iid.type_id), -1)?;
        if !self.graph.attributes_created.remove(&iid) {
            self.graph.attributes_deleted.insert(iid);
        }
        Ok(true)
    }

    /// Connects an owner to an attribute. Returns `false` if the edge already exists.
    ///
    /// # Errors
    ///
    /// [`UmbraError::Invalid`] if either endpoint is missing from this transaction's view.
    pub fn put_has(&mut self, edge: HasEdge) -> Result<bool> {
        self.ensure_writable()?;
        let owner = keys::thing(&edge.owner);
        let attribute = keys::attribute(&edge.attribute);
        if !self.kv.contains(&owner)? || !self.kv.contains(&attribute)? {
            return Err(UmbraError::Invalid("has edge endpoint does not exist"));
        }
        let key = keys::has(&edge);
        if self.kv.contains(&key)? {
            return Ok(false);
        }
        self.kv.put_tracked(key, Vec::new(), false);
        self.kv.put_untracked(keys::has_reverse(&edge), Vec::new());
        // A concurrent delete of either endpoint must conflict with this edge.
        self.kv.touch_tracked(owner);
        self.kv.touch_tracked(attribute);
        self.kv.merge_untracked(
            keys::has_edge_count(edge.owner.type_id, edge.attribute.type_id),
            1,
        )?;
        if !self.graph.has_deleted.remove(&edge) {
            self.graph.has_created.insert(edge);
        }
        Ok(true)
    }

    /// Removes a `has` edge. Returns `false` if it does not exist.
    pub fn delete_has(&mut self, edge: HasEdge) -> Result<bool> {
        self.ensure_writable()?;
        let key = keys::has(&edge);
        if !self.kv.contains(&key)? {
            return Ok(false);
        }
        self.kv.delete_tracked(key);
        self.kv.delete_untracked(keys::has_reverse(&edge));
        self.kv.merge_untracked(
            keys::has_edge_count(edge.owner.type_id, edge.attribute.type_id),
            -1,
        )?;
        if !self.graph.has_created.remove(&edge) {
            self.graph.has_deleted.insert(edge);
        }
        Ok(true)
    }

    /// Whether the thing exists in this transaction's view.
    pub fn contains_thing(&self, iid: &ThingIid) -> Result<bool> {
        self.kv.contains(&keys::thing(iid))
    }

    /// Whether the attribute exists in this transaction's view.
    pub fn contains_attribute(&self, iid: &AttributeIid) -> Result<bool> {
        self.kv.contains(&keys::attribute(iid))
    }

    /// Whether the edge exists in this transaction's view.
    pub fn contains_has(&self, edge: &HasEdge) -> Result<bool> {
        self.kv.contains(&keys::has(edge))
    }

    /// Number of instances of `type_id`. Eventually correct: may be transiently off
    /// while corrections are pending.
    pub fn vertex_count(&self, type_id: TypeId) -> Result<i64> {
        self.kv.counter(&keys::vertex_count(type_id))
    }

    /// Number of `has` edges from `owner` instances to `attribute` instances.
    pub fn has_edge_count(&self, owner: TypeId, attribute: TypeId) -> Result<i64> {
        self.kv.counter(&keys::has_edge_count(owner, attribute))
    }

    /// Validates and applies the buffered writes.
    ///
    /// # Errors
    ///
    /// * [`UmbraError::Isolation`] - a concurrent transaction committed (or is
    ///   committing) conflicting writes. Nothing was applied.
    /// * [`UmbraError::Invalid`] - the transaction is no longer active.
    pub fn commit(mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(UmbraError::Invalid("transaction is no longer active"));
        }
        if self.kind == TransactionKind::Read {
            self.kv.rollback();
            self.state = TxState::Committed;
            return Ok(());
        }
        let mut writes = std::mem::take(&mut self.graph);
        writes.tracked = self.kv.tracked().clone();
        let record = Arc::new(TxnRecord::new(self.id, self.kv.snapshot(), writes));
        let overlapping = match self.db.isolation.validate_and_start_commit(&record) {
            Ok(overlapping) => overlapping,
            Err(err) => {
                self.kv.rollback();
                self.state = TxState::RolledBack;
                return Err(err);
            }
        };
        self.state = TxState::Failed;
        if record.may_miscount() {
            self.marked = true;
            self.db
                .corrector
                .record_correction_metadata(&mut self.kv, &record, &overlapping)?;
        }
        let Some(snapshot_end) = self.kv.commit()? else {
            self.state = TxState::Committed;
            return Ok(());
        };
        self.db.isolation.committed(&record, snapshot_end)?;
        self.state = TxState::Committed;
        debug!(
            txn = self.id,
            snapshot_end,
            overlapping = overlapping.len(),
            "db.transaction.committed"
        );
        if let Err(err) = self.db.corrector.committed(&record) {
            warn!(txn = self.id, error = %err, "db.statistics.notify_failed");
        }
        Ok(())
    }

    /// Discards the buffered writes.
    pub fn rollback(mut self) {
        if self.state == TxState::Active {
            self.kv.rollback();
            self.state = TxState::RolledBack;
        }
    }

    /// Closes the transaction, rolling back if it is still active.
    pub fn close(self) {}
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.kv.rollback();
            self.state = TxState::RolledBack;
        }
        if !self.registered {
            return;
        }
        for purged in self.db.isolation.closed(self.id) {
            self.db.corrector.deleted(purged);
        }
        if self.marked && self.state != TxState::Committed {
            self.db.corrector.deleted(self.id);
        }
        trace!(txn = self.id, state = ?self.state, "db.transaction.closed");
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("snapshot", &self.kv.snapshot())
            .finish()
    }
}
