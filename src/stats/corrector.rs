use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use super::lane::CorrectionLane;
use super::miscount::{decode_causes, encode_causes, Causes, Miscount, MiscountKey};
use super::state::{CorrectorState, StateCell};
use crate::primitives::kv::{decode_counter, KvStore, KvTxn};
use crate::storage::keys::{self, prefix};
use crate::txn::{IsolationManager, TxnRecord};
use crate::types::{Result, TxnId, UmbraError};

/// Tuning for the statistics corrector.
#[derive(Clone, Copy, Debug)]
pub struct CorrectorConfig {
    /// How long [`StatisticsCorrector::close`] waits for queued work.
    pub shutdown_timeout: Duration,
    /// Bound of the correction lane's queue.
    pub queue_capacity: usize,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(60),
            queue_capacity: 16,
        }
    }
}

/// Outcome of one correction pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CorrectionReport {
    /// Evidence records whose correction was applied.
    pub corrected: usize,
    /// Evidence records dropped because no causing transaction committed.
    pub discarded: usize,
    /// Evidence records kept because a causing transaction is still open.
    pub pending: usize,
    /// Transaction-committed markers deleted.
    pub markers_deleted: usize,
}

impl CorrectionReport {
    /// Whether the pass wrote anything.
    pub fn changed(&self) -> bool {
        self.corrected + self.discarded + self.markers_deleted > 0
    }
}

/// The corrector's private view of the store. Never shared with foreground transactions.
struct CorrectorSession {
    store: Arc<dyn KvStore>,
    closed: AtomicBool,
}

impl CorrectorSession {
    fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            closed: AtomicBool::new(false),
        }
    }

    fn begin(&self) -> Result<KvTxn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UmbraError::ResourceClosed("statistics corrector session"));
        }
        KvTxn::begin(Arc::clone(&self.store))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct Shared {
    state: StateCell,
    store: Arc<dyn KvStore>,
    isolation: Arc<IsolationManager>,
    session: RwLock<Option<Arc<CorrectorSession>>>,
    /// Transactions that wrote a committed marker in this incarnation.
    marked: Mutex<FxHashSet<TxnId>>,
    /// Marked transactions that no future evidence can reference.
    purged: Mutex<FxHashSet<TxnId>>,
    pass: Mutex<()>,
    version: AtomicU64,
}

impl Shared {
    fn session(&self) -> Result<Arc<CorrectorSession>> {
        match self.session.read().as_ref() {
            Some(session) => Ok(Arc::clone(session)),
            None if self.state.get() == CorrectorState::Closed => {
                Err(UmbraError::ResourceClosed("statistics corrector session"))
            }
            None => Err(UmbraError::Invalid("statistics corrector is not active")),
        }
    }

    fn open_session(&self) {
        *self.session.write() = Some(Arc::new(CorrectorSession::new(Arc::clone(&self.store))));
    }

    fn correct_miscounts(&self) -> Result<CorrectionReport> {
        let _pass = self.pass.lock();
        if self.state.get() == CorrectorState::Closed {
            return Ok(CorrectionReport::default());
        }
        let session = self.session()?;
        // Captured before the store snapshot: a causing transaction absent from `open`
        // has either failed or its marker is visible below, and every evidence record
        // naming a purged transaction was committed before the purge.
        let open: FxHashSet<TxnId> = self.isolation.not_committed().into_iter().collect();
        let mut deletable = self.purged.lock().clone();
        let mut txn = session.begin()?;

        let mut report = CorrectionReport::default();
        for (key, value) in txn.iterate(&MiscountKey::prefix())? {
            let evidence = MiscountKey::decode(&key)?;
            let causes = decode_causes(&value)?;
            if any_committed(&txn, &causes)? {
                txn.merge_untracked(
                    evidence.miscount.counter_key(),
                    evidence.miscount.correction(),
                )?;
                txn.delete_untracked(key);
                report.corrected += 1;
            } else if causes.iter().all(|id| !open.contains(id)) {
                txn.delete_untracked(key);
                report.discarded += 1;
            } else {
                for id in &causes {
                    deletable.remove(id);
                }
                report.pending += 1;
            }
        }
        for id in &deletable {
            let marker = keys::txn_committed(*id);
            if txn.contains(&marker)? {
                txn.delete_untracked(marker);
                report.markers_deleted += 1;
            }
        }

        if txn.is_empty() {
            txn.rollback();
        } else {
            txn.commit()?;
        }
        self.purged.lock().retain(|id| !deletable.contains(id));
        if report.corrected > 0 {
            let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
            trace!(version, "stats.version.bumped");
        }
        if report.changed() {
            debug!(
                corrected = report.corrected,
                discarded = report.discarded,
                pending = report.pending,
                markers_deleted = report.markers_deleted,
                "stats.correction.pass"
            );
        }
        Ok(report)
    }

    fn delete_all_markers(&self) -> Result<usize> {
        let session = self.session()?;
        let mut txn = session.begin()?;
        let markers = txn.iterate(&keys::txn_committed_prefix())?;
        let deleted = markers.len();
        for (key, _) in markers {
            let id = keys::decode_txn_committed(&key)?;
            trace!(txn = id, "stats.marker.deleted");
            txn.delete_untracked(key);
        }
        if txn.is_empty() {
            txn.rollback();
        } else {
            txn.commit()?;
        }
        self.purged.lock().clear();
        self.marked.lock().clear();
        Ok(deleted)
    }

    fn log_summary(&self) -> Result<()> {
        let session = self.session()?;
        let txn = session.begin()?;
        let mut things = 0i64;
        for (key, value) in txn.iterate(&[prefix::VERTEX_COUNT])? {
            let type_id = keys::decode_vertex_count(&key)?;
            let count = decode_counter(Some(&value))?;
            trace!(type_id = type_id.0, count, "stats.summary.vertices");
            things = things.saturating_add(count);
        }
        let mut has = 0i64;
        for (key, value) in txn.iterate(&[prefix::HAS_EDGE_COUNT])? {
            let (owner, attribute) = keys::decode_has_edge_count(&key)?;
            let count = decode_counter(Some(&value))?;
            trace!(owner = owner.0, attribute = attribute.0, count, "stats.summary.has");
            has = has.saturating_add(count);
        }
        trace!(things, has, "stats.summary");
        Ok(())
    }
}

fn any_committed(txn: &KvTxn, causes: &[TxnId]) -> Result<bool> {
    for id in causes {
        if txn.contains(&keys::txn_committed(*id))? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Asynchronous repair of the vertex and has-edge counters.
///
/// Foreground commits update counters optimistically; when two overlapping transactions
/// create (or delete) the same attribute or edge, both adjust the counter although only
/// one change took effect. The later committer records evidence of that inside its own
/// commit, and correction passes on a background lane apply the missing `±1` once it is
/// known whether the other side committed.
pub struct StatisticsCorrector {
    shared: Arc<Shared>,
    lane: CorrectionLane,
    activation: Mutex<()>,
    config: CorrectorConfig,
}

impl StatisticsCorrector {
    /// Creates an inactive corrector over `store` and spawns its lane.
    pub fn new(
        store: Arc<dyn KvStore>,
        isolation: Arc<IsolationManager>,
        config: CorrectorConfig,
    ) -> Result<Self> {
        let lane = CorrectionLane::spawn("umbra-stats-correction", config.queue_capacity)?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: StateCell::new(CorrectorState::Inactive),
                store,
                isolation,
                session: RwLock::new(None),
                marked: Mutex::new(FxHashSet::default()),
                purged: Mutex::new(FxHashSet::default()),
                pass: Mutex::new(()),
                version: AtomicU64::new(0),
            }),
            lane,
            activation: Mutex::new(()),
            config,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CorrectorState {
        self.shared.state.get()
    }

    /// Counter bumped whenever a pass applied a correction.
    pub fn statistics_version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }

    /// Schedules activation for a freshly created database.
    pub fn mark_activating(&self) -> Result<()> {
        if !self
            .shared
            .state
            .transition(CorrectorState::Inactive, CorrectorState::Activating)
        {
            return Err(UmbraError::Invalid("statistics corrector is not inactive"));
        }
        Ok(())
    }

    /// Schedules activation for a reopened database.
    pub fn mark_reactivating(&self) -> Result<()> {
        if !self
            .shared
            .state
            .transition(CorrectorState::Inactive, CorrectorState::Reactivating)
        {
            return Err(UmbraError::Invalid("statistics corrector is not inactive"));
        }
        Ok(())
    }

    /// Opens the private session and starts accepting corrections.
    pub fn do_activate(&self) -> Result<()> {
        let _guard = self.activation.lock();
        self.activate_locked()
    }

    fn activate_locked(&self) -> Result<()> {
        if self.state() != CorrectorState::Activating {
            return Err(UmbraError::Invalid("statistics corrector is not activating"));
        }
        self.shared.open_session();
        if !self
            .shared
            .state
            .transition(CorrectorState::Activating, CorrectorState::Waiting)
        {
            return Err(UmbraError::ResourceClosed("statistics corrector"));
        }
        debug!("stats.corrector.activated");
        Ok(())
    }

    /// Opens the private session, resolves all evidence left by the previous
    /// incarnation and deletes every committed marker.
    pub fn do_reactivate(&self) -> Result<CorrectionReport> {
        let _guard = self.activation.lock();
        self.reactivate_locked()
    }

    fn reactivate_locked(&self) -> Result<CorrectionReport> {
        if self.state() != CorrectorState::Reactivating {
            return Err(UmbraError::Invalid("statistics corrector is not reactivating"));
        }
        self.shared.open_session();
        if !self
            .shared
            .state
            .transition(CorrectorState::Reactivating, CorrectorState::Waiting)
        {
            return Err(UmbraError::ResourceClosed("statistics corrector"));
        }
        trace!("stats.corrector.cleanup");
        let report = self.shared.correct_miscounts()?;
        let markers = {
            let _pass = self.shared.pass.lock();
            self.shared.delete_all_markers()?
        };
        debug!(
            corrected = report.corrected,
            discarded = report.discarded,
            markers,
            "stats.corrector.reactivated"
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            self.shared.log_summary()?;
        }
        Ok(report)
    }

    fn complete_deferred_activation(&self) -> Result<()> {
        match self.state() {
            CorrectorState::Activating | CorrectorState::Reactivating => {
                let _guard = self.activation.lock();
                match self.state() {
                    CorrectorState::Activating => self.activate_locked(),
                    CorrectorState::Reactivating => self.reactivate_locked().map(|_| ()),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Notification that `record` committed. Queues a correction pass if the record may
    /// have caused a miscount and none is queued already.
    pub fn committed(&self, record: &TxnRecord) -> Result<()> {
        self.complete_deferred_activation()?;
        if !record.may_miscount()
            || !self
                .shared
                .state
                .transition(CorrectorState::Waiting, CorrectorState::CorrectionQueued)
        {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let submitted = self.lane.submit(Box::new(move || {
            if shared
                .state
                .transition(CorrectorState::CorrectionQueued, CorrectorState::Waiting)
            {
                shared.correct_miscounts().map(|_| ())
            } else {
                Ok(())
            }
        }));
        match submitted {
            Err(err) if err.is_benign_close() => {
                debug!(txn = record.id(), "stats.correction.skipped_closed");
                Ok(())
            }
            other => other,
        }
    }

    /// Notification that transaction `id` will never be named by new evidence, either
    /// because its isolation record was purged or because its commit failed.
    pub fn deleted(&self, id: TxnId) {
        if self.shared.marked.lock().remove(&id) {
            self.shared.purged.lock().insert(id);
        }
    }

    /// Writes miscount evidence for `record` against every overlapping transaction,
    /// plus the committed marker for `record`, into `txn`'s own batch.
    pub fn record_correction_metadata(
        &self,
        txn: &mut KvTxn,
        record: &TxnRecord,
        overlapping: &[Arc<TxnRecord>],
    ) -> Result<()> {
        let ours = record.writes();
        let mut evidence: FxHashMap<Miscount, Causes> = FxHashMap::default();
        for other in overlapping {
            let theirs = other.writes();
            for iid in ours
                .attributes_created
                .iter()
                .filter(|iid| theirs.attributes_created.contains(*iid))
            {
                evidence
                    .entry(Miscount::AttributeOvercount(iid.clone()))
                    .or_default()
                    .push(other.id());
            }
            for iid in ours
                .attributes_deleted
                .iter()
                .filter(|iid| theirs.attributes_deleted.contains(*iid))
            {
                evidence
                    .entry(Miscount::AttributeUndercount(iid.clone()))
                    .or_default()
                    .push(other.id());
            }
            for edge in ours
                .has_created
                .iter()
                .filter(|edge| theirs.has_created.contains(*edge))
            {
                evidence
                    .entry(Miscount::HasEdgeOvercount(edge.clone()))
                    .or_default()
                    .push(other.id());
            }
            for edge in ours
                .has_deleted
                .iter()
                .filter(|edge| theirs.has_deleted.contains(*edge))
            {
                evidence
                    .entry(Miscount::HasEdgeUndercount(edge.clone()))
                    .or_default()
                    .push(other.id());
            }
        }
        if !evidence.is_empty() {
            trace!(txn = record.id(), records = evidence.len(), "stats.evidence.recorded");
        }
        for (miscount, causes) in evidence {
            let key = MiscountKey::new(record.id(), miscount);
            txn.put_untracked(key.encode(), encode_causes(&causes));
        }
        txn.put_untracked(keys::txn_committed(record.id()), Vec::new());
        self.shared.marked.lock().insert(record.id());
        Ok(())
    }

    /// Runs one correction pass on the calling thread.
    pub fn correct_miscounts(&self) -> Result<CorrectionReport> {
        self.shared.correct_miscounts()
    }

    /// Waits until every correction queued so far has run.
    pub fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        self.lane.wait_idle(timeout)
    }

    /// Stops the corrector. Queued passes see the closed state and return immediately.
    ///
    /// Fails with [`UmbraError::CorrectorShutdownTimeout`] if the lane does not drain in
    /// time; the database must then be treated as unusable.
    pub fn close(&self) -> Result<()> {
        let previous = self.shared.state.close();
        self.lane.shutdown(self.config.shutdown_timeout)?;
        let _pass = self.shared.pass.lock();
        if let Some(session) = self.shared.session.write().take() {
            session.close();
        }
        if previous != CorrectorState::Closed {
            debug!(?previous, "stats.corrector.closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for StatisticsCorrector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsCorrector")
            .field("state", &self.state())
            .field("statistics_version", &self.statistics_version())
            .finish()
    }
}
