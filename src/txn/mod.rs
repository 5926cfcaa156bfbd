//! Transaction isolation: per-transaction records and the commit-time validator.

mod isolation;
mod record;

pub use isolation::{IsolationManager, IsolationSnapshot};
pub use record::{TxnRecord, WriteSummary};
