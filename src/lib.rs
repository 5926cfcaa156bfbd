//! Umbra: transaction isolation and statistics consistency for an embedded graph
//! store.
//!
//! Write transactions run optimistically against a snapshot and are validated at
//! commit by the [`txn::IsolationManager`]. Per-type vertex counts and has-edge counts
//! are maintained inside each transaction's own batch and repaired asynchronously by
//! the [`stats::StatisticsCorrector`] when overlapping transactions skew them.

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod stats;
pub mod storage;
pub mod txn;
pub mod types;

pub use db::{
    ConfigError, Database, DatabaseOptions, SchemaSession, Transaction, TransactionKind,
    TxState,
};
pub use primitives::kv::{KvStore, MemKv};
pub use stats::CorrectionReport;
pub use txn::IsolationSnapshot;
pub use types::{
    AttributeIid, CommitSeq, Conflict, HasEdge, Result, ThingIid, TxnId, TypeId, UmbraError,
};
