use parking_lot::RwLockWriteGuard;
use tracing::debug;

use super::transaction::{Transaction, TransactionKind};
use super::Database;
use crate::types::Result;

/// Exclusive access for schema changes.
///
/// While a session is alive no data write transaction can open; opening one waits up
/// to the configured schema lock timeout. Transactions opened through the session
/// itself run under its exclusive lock.
pub struct SchemaSession<'db> {
    db: &'db Database,
    _guard: RwLockWriteGuard<'db, ()>,
}

impl<'db> SchemaSession<'db> {
    pub(crate) fn new(db: &'db Database, guard: RwLockWriteGuard<'db, ()>) -> Self {
        debug!("db.schema.session_open");
        Self { db, _guard: guard }
    }

    /// Opens a write transaction under the session's exclusive lock.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.db.ensure_open()?;
        Transaction::open(self.db, self.db.next_id(), TransactionKind::Write, None)
    }

    /// Releases the lock.
    pub fn close(self) {}
}

impl Drop for SchemaSession<'_> {
    fn drop(&mut self) {
        debug!("db.schema.session_closed");
    }
}

impl std::fmt::Debug for SchemaSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaSession").finish_non_exhaustive()
    }
}
