//! Database lifecycle: creation and reopening, transactions, schema sessions and
//! shutdown, wiring the isolation manager and statistics corrector together.

mod config;
mod schema;
mod transaction;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::primitives::kv::{KvStore, KvTxn};
use crate::stats::{CorrectionReport, StatisticsCorrector};
use crate::storage::keys::{self, ENCODING_VERSION};
use crate::txn::{IsolationManager, IsolationSnapshot};
use crate::types::{Result, TxnId, UmbraError};

pub use config::{ConfigError, DatabaseOptions};
pub use schema::SchemaSession;
pub use transaction::{Transaction, TransactionKind, TxState};

/// An open database.
///
/// Shared by reference between threads; every transaction borrows it.
pub struct Database {
    store: Arc<dyn KvStore>,
    isolation: Arc<IsolationManager>,
    corrector: StatisticsCorrector,
    /// Held shared by write transactions and exclusively by schema sessions.
    schema_lock: RwLock<()>,
    next_txn_id: AtomicU64,
    closed: AtomicBool,
    options: DatabaseOptions,
}

impl Database {
    fn assemble(options: DatabaseOptions) -> Result<Self> {
        let store = Arc::clone(&options.store);
        let isolation = Arc::new(IsolationManager::new());
        let corrector = StatisticsCorrector::new(
            Arc::clone(&store),
            Arc::clone(&isolation),
            options.corrector_config(),
        )?;
        Ok(Self {
            store,
            isolation,
            corrector,
            schema_lock: RwLock::new(()),
            next_txn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            options,
        })
    }

    /// Initialises an empty store and opens it.
    ///
    /// # Errors
    ///
    /// [`UmbraError::AlreadyInitialised`] if the store already holds a database.
    pub fn create(options: DatabaseOptions) -> Result<Self> {
        {
            let mut txn = KvTxn::begin(Arc::clone(&options.store))?;
            if txn.contains(&keys::encoding_version())? {
                return Err(UmbraError::AlreadyInitialised);
            }
            txn.put_untracked(keys::encoding_version(), ENCODING_VERSION.to_be_bytes().to_vec());
            txn.commit()?;
        }
        let db = Self::assemble(options)?;
        db.corrector.mark_activating()?;
        db.corrector.do_activate()?;
        info!(encoding = ENCODING_VERSION, "db.created");
        Ok(db)
    }

    /// Opens a store previously initialised by [`Database::create`].
    ///
    /// Evidence of miscounts left by the previous incarnation is resolved before this
    /// returns, so statistics read afterwards are not based on stale evidence.
    ///
    /// # Errors
    ///
    /// * [`UmbraError::NotInitialised`] - the store holds no database.
    /// * [`UmbraError::IncompatibleEncoding`] - written by another encoding version.
    pub fn open(options: DatabaseOptions) -> Result<Self> {
        let found = {
            let txn = KvTxn::begin(Arc::clone(&options.store))?;
            match txn.get(&keys::encoding_version())? {
                None => return Err(UmbraError::NotInitialised),
                Some(bytes) => decode_version(&bytes)?,
            }
        };
        if found != ENCODING_VERSION {
            return Err(UmbraError::IncompatibleEncoding {
                found,
                expected: ENCODING_VERSION,
            });
        }
        let db = Self::assemble(options)?;
        db.corrector.mark_reactivating()?;
        let report = db.corrector.do_reactivate()?;
        info!(
            encoding = found,
            corrected = report.corrected,
            "db.opened"
        );
        Ok(db)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UmbraError::DatabaseClosed);
        }
        Ok(())
    }

    fn next_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens a transaction.
    ///
    /// Write transactions hold the schema lock in shared mode and wait up to
    /// [`DatabaseOptions::schema_lock_timeout`] while a [`SchemaSession`] is open.
    pub fn transaction(&self, kind: TransactionKind) -> Result<Transaction<'_>> {
        self.ensure_open()?;
        let guard = match kind {
            TransactionKind::Read => None,
            TransactionKind::Write => {
                let timeout = self.options.schema_lock_timeout;
                Some(
                    self.schema_lock
                        .try_read_recursive_for(timeout)
                        .ok_or(UmbraError::SchemaLockTimeout(timeout))?,
                )
            }
        };
        Transaction::open(self, self.next_id(), kind, guard)
    }

    /// Acquires exclusive schema access, waiting for open write transactions to finish.
    pub fn schema_session(&self) -> Result<SchemaSession<'_>> {
        self.ensure_open()?;
        let timeout = self.options.schema_lock_timeout;
        let guard = self
            .schema_lock
            .try_write_for(timeout)
            .ok_or(UmbraError::SchemaLockTimeout(timeout))?;
        Ok(SchemaSession::new(self, guard))
    }

    /// Increases whenever a correction changed the statistics; cached statistics
    /// computed under an older version are stale.
    pub fn statistics_version(&self) -> u64 {
        self.corrector.statistics_version()
    }

    /// Sizes of the isolation sets.
    pub fn isolation_snapshot(&self) -> IsolationSnapshot {
        self.isolation.snapshot()
    }

    /// Runs a correction pass on the calling thread.
    pub fn correct_miscounts(&self) -> Result<CorrectionReport> {
        self.ensure_open()?;
        self.corrector.correct_miscounts()
    }

    /// Waits until every correction queued so far has run. Returns `false` on timeout.
    pub fn wait_for_corrections(&self, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        self.corrector.wait_idle(timeout)
    }

    /// Closes the database and its store.
    ///
    /// The store is closed even when the corrector fails to stop. Later calls only wait
    /// again for a corrector that was still running.
    ///
    /// # Errors
    ///
    /// [`UmbraError::CorrectorShutdownTimeout`] if background corrections did not stop
    /// in time. The database must not be used afterwards.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return self.corrector.close();
        }
        let shutdown = self.corrector.close();
        self.store.close();
        if let Err(err) = shutdown {
            warn!(error = %err, "db.close.corrector_still_running");
            return Err(err);
        }
        info!("db.closed");
        Ok(())
    }

    /// Closes the database and removes all of its data from the store. The store is
    /// closed whether or not the removal happened.
    pub fn delete(self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let result = self.corrector.close().and_then(|()| self.store.clear());
        self.store.close();
        result?;
        info!("db.deleted");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "db.drop.close_failed");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("isolation", &self.isolation.snapshot())
            .field("corrector", &self.corrector)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn decode_version(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| UmbraError::Corruption("encoding version has wrong length"))?;
    let version = u32::from_be_bytes(raw);
    debug!(version, "db.encoding_version");
    Ok(version)
}
