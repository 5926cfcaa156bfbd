//! Persisted layout of graph data, statistics counters and bookkeeping records.

pub mod keys;
