#![forbid(unsafe_code)]

//! Identifiers shared by the isolation and statistics layers, plus the crate error type.

use std::fmt;

mod error;

pub use error::{Conflict, Result, UmbraError};

/// Identifier handed to every transaction when it opens.
///
/// Strictly increasing within one database incarnation.
pub type TxnId = u64;

/// Commit sequence assigned by the store to every applied write batch.
///
/// Snapshots are expressed in this space: a transaction reading at sequence `s`
/// observes every batch whose sequence is `<= s`.
pub type CommitSeq = u64;

/// Schema type identifier (entity, relation or attribute type).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TypeId(pub u32);

/// Identity of a non-attribute thing (entity or relation instance).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ThingIid {
    /// Type of the thing.
    pub type_id: TypeId,
    /// Per-type unique key.
    pub key: u64,
}

/// Identity of an attribute: attributes are identified by their type and value.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct AttributeIid {
    /// Attribute type.
    pub type_id: TypeId,
    /// Encoded attribute value.
    pub value: Vec<u8>,
}

/// A `has` edge from an owner thing to an attribute.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct HasEdge {
    /// Owning thing.
    pub owner: ThingIid,
    /// Owned attribute.
    pub attribute: AttributeIid,
}

impl ThingIid {
    /// Creates a thing identity.
    pub const fn new(type_id: TypeId, key: u64) -> Self {
        Self { type_id, key }
    }
}

impl AttributeIid {
    /// Creates an attribute identity from an encoded value.
    pub fn new(type_id: TypeId, value: impl Into<Vec<u8>>) -> Self {
        Self {
            type_id,
            value: value.into(),
        }
    }

    /// Convenience constructor for integer-valued attributes.
    pub fn long(type_id: TypeId, value: i64) -> Self {
        Self::new(type_id, value.to_be_bytes().to_vec())
    }
}

impl HasEdge {
    /// Creates a `has` edge.
    pub fn new(owner: ThingIid, attribute: AttributeIid) -> Self {
        Self { owner, attribute }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ThingIid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.key)
    }
}

impl fmt::Display for AttributeIid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.type_id)?;
        for byte in &self.value {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<u32> for TypeId {
    fn from(value: u32) -> Self {
        TypeId(value)
    }
}

impl From<TypeId> for u32 {
    fn from(value: TypeId) -> Self {
        value.0
    }
}
