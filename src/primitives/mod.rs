//! Low-level primitives the transaction layer is built on.

/// Ordered key/value store contract, the in-process engine and store transactions.
pub mod kv;
