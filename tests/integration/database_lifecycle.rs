//! Database lifecycle tests: create/open validation, reactivation of leftover
//! statistics evidence, schema sessions, configuration files, close and delete.

#![allow(missing_docs)]

mod common;

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use tempfile::NamedTempFile;
use umbra::primitives::kv::{KvTxn, WriteBatch};
use umbra::stats::miscount::{encode_causes, Miscount, MiscountKey};
use umbra::storage::keys;
use umbra::{
    AttributeIid, CommitSeq, ConfigError, Database, DatabaseOptions, KvStore, MemKv, Result,
    TransactionKind, TypeId, UmbraError,
};

const AGE: TypeId = TypeId(3);

fn markers(store: &MemKv) -> Result<usize> {
    Ok(store
        .scan_prefix(&keys::txn_committed_prefix(), store.latest_seq())?
        .len())
}

// ============================================================================
// CREATE / OPEN
// ============================================================================

#[test]
fn open_requires_an_initialised_store() {
    common::init_tracing();
    let store = Arc::new(MemKv::new());
    let err = Database::open(DatabaseOptions::new(store)).unwrap_err();
    assert!(matches!(err, UmbraError::NotInitialised));
}

#[test]
fn create_refuses_an_initialised_store() -> Result<()> {
    let (store, db) = common::fresh()?;
    db.close()?;
    drop(db);
    store.reopen();
    let err = Database::create(DatabaseOptions::new(store)).unwrap_err();
    assert!(matches!(err, UmbraError::AlreadyInitialised));
    Ok(())
}

#[test]
fn open_rejects_a_different_encoding_version() -> Result<()> {
    common::init_tracing();
    let store = Arc::new(MemKv::new());
    {
        let mut txn = KvTxn::begin(store.clone())?;
        txn.put_untracked(keys::encoding_version(), 7u32.to_be_bytes().to_vec());
        txn.commit()?;
    }
    let err = Database::open(DatabaseOptions::new(store)).unwrap_err();
    assert!(matches!(
        err,
        UmbraError::IncompatibleEncoding { found: 7, expected } if expected == keys::ENCODING_VERSION
    ));
    Ok(())
}

#[test]
fn data_and_counts_survive_reopen() -> Result<()> {
    let (store, db) = common::fresh()?;
    {
        let mut tx = db.transaction(TransactionKind::Write)?;
        for value in 0..4 {
            tx.put_attribute(AttributeIid::long(AGE, value), false)?;
        }
        tx.commit()?;
    }
    db.close()?;
    drop(db);

    store.reopen();
    let db = Database::open(DatabaseOptions::new(store))?;
    assert_eq!(common::vertex_count(&db, AGE)?, 4);
    assert_eq!(db.statistics_version(), 0);
    Ok(())
}

// ============================================================================
// REACTIVATION
// ============================================================================

#[test]
fn reopen_resolves_evidence_left_by_previous_run() -> Result<()> {
    let (store, db) = common::fresh()?;
    let age = AttributeIid::long(AGE, 5);
    {
        let mut tx = db.transaction(TransactionKind::Write)?;
        tx.put_attribute(age.clone(), false)?;
        tx.commit()?;
    }
    db.close()?;
    drop(db);
    store.reopen();

    // A run that stopped before its corrections could be applied: the attribute was
    // counted twice, evidence names transaction 100 whose marker is present, and
    // transaction 200 left a marker with nothing pointing at it.
    {
        let mut txn = KvTxn::begin(store.clone())?;
        txn.merge_untracked(keys::vertex_count(AGE), 1)?;
        let evidence = MiscountKey::new(101, Miscount::AttributeOvercount(age));
        txn.put_untracked(evidence.encode(), encode_causes(&[100]));
        txn.put_untracked(keys::txn_committed(100), Vec::new());
        txn.put_untracked(keys::txn_committed(200), Vec::new());
        txn.commit()?;
    }

    let db = Database::open(DatabaseOptions::new(store.clone()))?;
    assert_eq!(common::vertex_count(&db, AGE)?, 1);
    assert_eq!(markers(&store)?, 0);
    assert_eq!(
        store
            .scan_prefix(&MiscountKey::prefix(), store.latest_seq())?
            .len(),
        0
    );
    Ok(())
}

#[test]
fn reopen_discards_evidence_whose_causes_never_committed() -> Result<()> {
    let (store, db) = common::fresh()?;
    let age = AttributeIid::long(AGE, 5);
    {
        let mut tx = db.transaction(TransactionKind::Write)?;
        tx.put_attribute(age.clone(), false)?;
        tx.commit()?;
    }
    db.close()?;
    drop(db);
    store.reopen();

    {
        let mut txn = KvTxn::begin(store.clone())?;
        let evidence = MiscountKey::new(101, Miscount::AttributeOvercount(age));
        txn.put_untracked(evidence.encode(), encode_causes(&[100]));
        txn.commit()?;
    }

    let db = Database::open(DatabaseOptions::new(store.clone()))?;
    assert_eq!(common::vertex_count(&db, AGE)?, 1);
    assert_eq!(db.statistics_version(), 0);
    assert_eq!(
        store
            .scan_prefix(&MiscountKey::prefix(), store.latest_seq())?
            .len(),
        0
    );
    Ok(())
}

#[test]
fn reopen_reports_a_malformed_committed_marker() -> Result<()> {
    let (store, db) = common::fresh()?;
    db.close()?;
    drop(db);
    store.reopen();
    {
        let mut txn = KvTxn::begin(store.clone())?;
        txn.put_untracked(vec![keys::prefix::TXN_COMMITTED, 1, 2], Vec::new());
        txn.commit()?;
    }
    let err = Database::open(DatabaseOptions::new(store)).unwrap_err();
    assert!(matches!(err, UmbraError::Corruption(_)));
    Ok(())
}

// ============================================================================
// SCHEMA SESSIONS
// ============================================================================

#[test]
fn schema_session_waits_for_writers() -> Result<()> {
    common::init_tracing();
    let db = Database::create(
        DatabaseOptions::in_memory().schema_lock_timeout(Duration::from_millis(25)),
    )?;
    let writer = db.transaction(TransactionKind::Write)?;
    let err = db.schema_session().unwrap_err();
    assert!(matches!(err, UmbraError::SchemaLockTimeout(_)));

    writer.rollback();
    let session = db.schema_session()?;
    {
        let mut tx = session.transaction()?;
        tx.put_attribute(AttributeIid::long(AGE, 1), true)?;
        tx.commit()?;
    }
    session.close();
    assert_eq!(common::vertex_count(&db, AGE)?, 1);
    Ok(())
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn options_load_from_toml_file() -> Result<()> {
    common::init_tracing();
    let mut file = NamedTempFile::new()?;
    writeln!(
        file,
        "[database]\nschema_lock_timeout_ms = 40\n\n[statistics]\nqueue_capacity = 2\ncorrector_shutdown_timeout_ms = 5000"
    )?;
    let options = DatabaseOptions::load(Arc::new(MemKv::new()), file.path())?;
    assert_eq!(options.schema_lock_timeout, Duration::from_millis(40));
    assert_eq!(options.correction_queue_capacity, 2);
    assert_eq!(options.corrector_shutdown_timeout, Duration::from_secs(5));

    let db = Database::create(options)?;
    let _writer = db.transaction(TransactionKind::Write)?;
    assert!(matches!(
        db.schema_session(),
        Err(UmbraError::SchemaLockTimeout(timeout)) if timeout == Duration::from_millis(40)
    ));
    Ok(())
}

#[test]
fn options_reject_unknown_keys_and_zero_values() {
    let store: Arc<dyn KvStore> = Arc::new(MemKv::new());
    assert!(matches!(
        DatabaseOptions::from_toml_str(store.clone(), "[database]\nnot_a_field = 1\n"),
        Err(ConfigError::Parse { path: None, .. })
    ));
    assert!(matches!(
        DatabaseOptions::from_toml_str(store.clone(), "[statistics]\nqueue_capacity = 0\n"),
        Err(ConfigError::Invalid { field: "statistics.queue_capacity", .. })
    ));
    assert!(matches!(
        DatabaseOptions::load(store, "/nonexistent/umbra.toml"),
        Err(ConfigError::Read { .. })
    ));
}

// ============================================================================
// CLOSE / DELETE
// ============================================================================

#[test]
fn close_is_idempotent_and_rejects_further_use() -> Result<()> {
    let (_store, db) = common::fresh()?;
    db.close()?;
    db.close()?;
    assert!(matches!(
        db.transaction(TransactionKind::Write),
        Err(UmbraError::DatabaseClosed)
    ));
    assert!(matches!(db.schema_session(), Err(UmbraError::DatabaseClosed)));
    assert!(matches!(
        db.correct_miscounts(),
        Err(UmbraError::DatabaseClosed)
    ));
    Ok(())
}

/// Store whose next evidence scan parks the correction worker until released.
struct StallingStore {
    inner: MemKv,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl StallingStore {
    fn new() -> Self {
        Self {
            inner: MemKv::new(),
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl KvStore for StallingStore {
    fn pin_latest(&self) -> Result<CommitSeq> {
        self.inner.pin_latest()
    }

    fn unpin(&self, seq: CommitSeq) {
        self.inner.unpin(seq)
    }

    fn latest_seq(&self) -> CommitSeq {
        self.inner.latest_seq()
    }

    fn get(&self, key: &[u8], at: CommitSeq) -> Result<Option<Vec<u8>>> {
        self.inner.get(key, at)
    }

    fn scan_prefix(&self, prefix: &[u8], at: CommitSeq) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if prefix == MiscountKey::prefix().as_slice() && self.armed.swap(false, Ordering::AcqRel) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.scan_prefix(prefix, at)
    }

    fn apply(&self, batch: WriteBatch) -> Result<CommitSeq> {
        self.inner.apply(batch)
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[test]
fn close_shuts_the_store_when_corrections_overrun() -> Result<()> {
    common::init_tracing();
    let store = Arc::new(StallingStore::new());
    let db = Database::create(
        DatabaseOptions::new(store.clone())
            .corrector_shutdown_timeout(Duration::from_millis(200)),
    )?;
    store.armed.store(true, Ordering::Release);
    {
        let mut tx = db.transaction(TransactionKind::Write)?;
        tx.put_attribute(AttributeIid::long(AGE, 1), false)?;
        tx.commit()?;
    }
    // The correction pass is now parked inside its evidence scan.
    store.entered.wait();

    let err = db.close().unwrap_err();
    assert!(matches!(err, UmbraError::CorrectorShutdownTimeout(_)));
    assert!(store.is_closed());
    assert!(matches!(
        db.transaction(TransactionKind::Read),
        Err(UmbraError::DatabaseClosed)
    ));

    store.release.wait();
    db.close()?;
    Ok(())
}

#[test]
fn delete_removes_everything() -> Result<()> {
    let (store, db) = common::fresh()?;
    {
        let mut tx = db.transaction(TransactionKind::Write)?;
        tx.put_attribute(AttributeIid::long(AGE, 1), false)?;
        tx.commit()?;
    }
    db.delete()?;
    store.reopen();
    assert_eq!(store.live_keys(), 0);
    assert!(matches!(
        Database::open(DatabaseOptions::new(store)),
        Err(UmbraError::NotInitialised)
    ));
    Ok(())
}
