//! Logical key layout.
//!
//! Every key starts with a one-byte prefix naming its family; the remaining bytes are
//! big-endian so that keys of one family sort by their numeric components.

use crate::types::{AttributeIid, HasEdge, Result, ThingIid, TxnId, TypeId, UmbraError};

/// Encoding version written on creation and checked on open.
pub const ENCODING_VERSION: u32 = 1;

/// Key family prefixes.
pub mod prefix {
    /// System metadata.
    pub const SYSTEM: u8 = 0x00;
    /// Entity/relation instances.
    pub const THING: u8 = 0x10;
    /// Attribute instances.
    pub const ATTRIBUTE: u8 = 0x11;
    /// `has` edges.
    pub const HAS: u8 = 0x12;
    /// `has` edges keyed by attribute first.
    pub const HAS_REVERSE: u8 = 0x13;
    /// Per-type vertex counters.
    pub const VERTEX_COUNT: u8 = 0x20;
    /// Per-(owner type, attribute type) has-edge counters.
    pub const HAS_EDGE_COUNT: u8 = 0x21;
    /// Transaction-committed markers.
    pub const TXN_COMMITTED: u8 = 0x30;
    /// Miscount evidence records.
    pub const MISCOUNT: u8 = 0x31;
}

const SYSTEM_ENCODING_VERSION: u8 = 0x01;

/// Key holding the encoding version.
pub fn encoding_version() -> Vec<u8> {
    vec![prefix::SYSTEM, SYSTEM_ENCODING_VERSION]
}

/// Key of a thing instance.
pub fn thing(iid: &ThingIid) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(prefix::THING);
    encode_thing_into(iid, &mut out);
    out
}

/// Key of an attribute instance.
pub fn attribute(iid: &AttributeIid) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + iid.value.len());
    out.push(prefix::ATTRIBUTE);
    encode_attribute_into(iid, &mut out);
    out
}

/// Key of a `has` edge.
pub fn has(edge: &HasEdge) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + edge.attribute.value.len());
    out.push(prefix::HAS);
    encode_has_into(edge, &mut out);
    out
}

/// Prefix covering every `has` edge owned by `owner`.
pub fn has_owner_prefix(owner: &ThingIid) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(prefix::HAS);
    encode_thing_into(owner, &mut out);
    out
}

/// Decodes a full `has` key.
pub fn decode_has_key(key: &[u8]) -> Result<HasEdge> {
    match key.split_first() {
        Some((&prefix::HAS, rest)) => decode_has(rest),
        _ => Err(UmbraError::Corruption("not a has key")),
    }
}

/// Reverse index entry of a `has` edge: attribute first, then owner.
pub fn has_reverse(edge: &HasEdge) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + edge.attribute.value.len());
    out.push(prefix::HAS_REVERSE);
    encode_attribute_into(&edge.attribute, &mut out);
    encode_thing_into(&edge.owner, &mut out);
    out
}

/// Prefix covering the reverse entries of every edge pointing at `attribute`.
///
/// Attribute values are not length-delimited, so the range also holds entries of
/// longer values that start with the same bytes. Callers compare the decoded
/// attribute.
pub fn has_attribute_prefix(attribute: &AttributeIid) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + attribute.value.len());
    out.push(prefix::HAS_REVERSE);
    encode_attribute_into(attribute, &mut out);
    out
}

/// Decodes a reverse index key. The owner occupies the trailing 12 bytes.
pub fn decode_has_reverse_key(key: &[u8]) -> Result<HasEdge> {
    let rest = match key.split_first() {
        Some((&prefix::HAS_REVERSE, rest)) if rest.len() >= 16 => rest,
        Some((&prefix::HAS_REVERSE, _)) => return Err(UmbraError::Corruption("key truncated")),
        _ => return Err(UmbraError::Corruption("not a has reverse key")),
    };
    let (attribute, owner) = rest.split_at(rest.len() - 12);
    let owner = ThingIid::new(TypeId(read_u32(owner, 0)?), read_u64(owner, 4)?);
    Ok(HasEdge::new(owner, decode_attribute(attribute)?))
}

/// Counter key for the number of instances of `type_id`.
pub fn vertex_count(type_id: TypeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(prefix::VERTEX_COUNT);
    out.extend_from_slice(&type_id.0.to_be_bytes());
    out
}

/// Counter key for the number of `has` edges from `owner` instances to `attribute` instances.
pub fn has_edge_count(owner: TypeId, attribute: TypeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(prefix::HAS_EDGE_COUNT);
    out.extend_from_slice(&owner.0.to_be_bytes());
    out.extend_from_slice(&attribute.0.to_be_bytes());
    out
}

/// Marker recording that `txn` committed.
pub fn txn_committed(txn: TxnId) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(prefix::TXN_COMMITTED);
    out.extend_from_slice(&txn.to_be_bytes());
    out
}

/// Prefix covering every transaction-committed marker.
pub fn txn_committed_prefix() -> Vec<u8> {
    vec![prefix::TXN_COMMITTED]
}

/// Extracts the transaction id from a committed-marker key.
pub fn decode_txn_committed(key: &[u8]) -> Result<TxnId> {
    match key.split_first() {
        Some((&prefix::TXN_COMMITTED, rest)) => read_u64(rest, 0),
        _ => Err(UmbraError::Corruption("not a transaction-committed key")),
    }
}

/// Extracts the type from a vertex counter key.
pub fn decode_vertex_count(key: &[u8]) -> Result<TypeId> {
    match key.split_first() {
        Some((&prefix::VERTEX_COUNT, rest)) => Ok(TypeId(read_u32(rest, 0)?)),
        _ => Err(UmbraError::Corruption("not a vertex count key")),
    }
}

/// Extracts the (owner, attribute) type pair from a has-edge counter key.
pub fn decode_has_edge_count(key: &[u8]) -> Result<(TypeId, TypeId)> {
    match key.split_first() {
        Some((&prefix::HAS_EDGE_COUNT, rest)) => {
            Ok((TypeId(read_u32(rest, 0)?), TypeId(read_u32(rest, 4)?)))
        }
        _ => Err(UmbraError::Corruption("not a has-edge count key")),
    }
}

pub(crate) fn encode_thing_into(iid: &ThingIid, out: &mut Vec<u8>) {
    out.extend_from_slice(&iid.type_id.0.to_be_bytes());
    out.extend_from_slice(&iid.key.to_be_bytes());
}

pub(crate) fn encode_attribute_into(iid: &AttributeIid, out: &mut Vec<u8>) {
    out.extend_from_slice(&iid.type_id.0.to_be_bytes());
    out.extend_from_slice(&iid.value);
}

pub(crate) fn encode_has_into(edge: &HasEdge, out: &mut Vec<u8>) {
    encode_thing_into(&edge.owner, out);
    encode_attribute_into(&edge.attribute, out);
}

/// Decodes an attribute identity occupying the whole of `bytes`.
pub(crate) fn decode_attribute(bytes: &[u8]) -> Result<AttributeIid> {
    let type_id = TypeId(read_u32(bytes, 0)?);
    Ok(AttributeIid::new(type_id, bytes[4..].to_vec()))
}

/// Decodes a `has` edge occupying the whole of `bytes`.
pub(crate) fn decode_has(bytes: &[u8]) -> Result<HasEdge> {
    let owner = ThingIid::new(TypeId(read_u32(bytes, 0)?), read_u64(bytes, 4)?);
    let attribute = decode_attribute(bytes.get(12..).unwrap_or_default())?;
    Ok(HasEdge::new(owner, attribute))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or(UmbraError::Corruption("key truncated"))?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let slice = bytes
        .get(offset..offset + 8)
        .ok_or(UmbraError::Corruption("key truncated"))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Ok(u64::from_be_bytes(buf))
}
