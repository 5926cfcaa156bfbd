//! Persisted evidence that concurrent transactions may have skewed a statistics counter.
//!
//! Key: `[MISCOUNT, kind, recorder id (u64 BE), subject]`. Value: the ids of the
//! transactions whose concurrent commit would make the recorder's counter update wrong,
//! as a concatenation of u64 BE.

use smallvec::SmallVec;

use crate::storage::keys::{self, prefix};
use crate::types::{AttributeIid, HasEdge, Result, TxnId, UmbraError};

/// Causing transaction ids; almost always one or two.
pub type Causes = SmallVec<[TxnId; 4]>;

/// What may have been miscounted, and in which direction.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Miscount {
    /// The attribute was created by a concurrent transaction too; counted twice.
    AttributeOvercount(AttributeIid),
    /// The attribute was deleted by a concurrent transaction too; uncounted twice.
    AttributeUndercount(AttributeIid),
    /// The edge was created by a concurrent transaction too.
    HasEdgeOvercount(HasEdge),
    /// The edge was deleted by a concurrent transaction too.
    HasEdgeUndercount(HasEdge),
}

impl Miscount {
    fn tag(&self) -> u8 {
        match self {
            Miscount::AttributeOvercount(_) => 0,
            Miscount::AttributeUndercount(_) => 1,
            Miscount::HasEdgeOvercount(_) => 2,
            Miscount::HasEdgeUndercount(_) => 3,
        }
    }

    /// Amount to add to the counter once a causing transaction is known to have committed.
    pub fn correction(&self) -> i64 {
        match self {
            Miscount::AttributeOvercount(_) | Miscount::HasEdgeOvercount(_) => -1,
            Miscount::AttributeUndercount(_) | Miscount::HasEdgeUndercount(_) => 1,
        }
    }

    /// Counter the correction applies to.
    pub fn counter_key(&self) -> Vec<u8> {
        match self {
            Miscount::AttributeOvercount(iid) | Miscount::AttributeUndercount(iid) => {
                keys::vertex_count(iid.type_id)
            }
            Miscount::HasEdgeOvercount(edge) | Miscount::HasEdgeUndercount(edge) => {
                keys::has_edge_count(edge.owner.type_id, edge.attribute.type_id)
            }
        }
    }
}

/// Key of one evidence record.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MiscountKey {
    /// Transaction that wrote the record as part of its own commit.
    pub recorder: TxnId,
    /// Subject and direction.
    pub miscount: Miscount,
}

impl MiscountKey {
    /// Creates a key.
    pub fn new(recorder: TxnId, miscount: Miscount) -> Self {
        Self { recorder, miscount }
    }

    /// Prefix covering every evidence record.
    pub fn prefix() -> Vec<u8> {
        vec![prefix::MISCOUNT]
    }

    /// Encodes the key.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.push(prefix::MISCOUNT);
        out.push(self.miscount.tag());
        out.extend_from_slice(&self.recorder.to_be_bytes());
        match &self.miscount {
            Miscount::AttributeOvercount(iid) | Miscount::AttributeUndercount(iid) => {
                keys::encode_attribute_into(iid, &mut out)
            }
            Miscount::HasEdgeOvercount(edge) | Miscount::HasEdgeUndercount(edge) => {
                keys::encode_has_into(edge, &mut out)
            }
        }
        out
    }

    /// Decodes a key produced by [`MiscountKey::encode`].
    pub fn decode(key: &[u8]) -> Result<Self> {
        let (&family, rest) = key
            .split_first()
            .ok_or(UmbraError::Corruption("empty miscount key"))?;
        if family != prefix::MISCOUNT {
            return Err(UmbraError::Corruption("not a miscount key"));
        }
        let (&tag, rest) = rest
            .split_first()
            .ok_or(UmbraError::Corruption("miscount key truncated"))?;
        let recorder = keys::read_u64(rest, 0)?;
        let subject = &rest[8..];
        let miscount = match tag {
            0 => Miscount::AttributeOvercount(keys::decode_attribute(subject)?),
            1 => Miscount::AttributeUndercount(keys::decode_attribute(subject)?),
            2 => Miscount::HasEdgeOvercount(keys::decode_has(subject)?),
            3 => Miscount::HasEdgeUndercount(keys::decode_has(subject)?),
            _ => return Err(UmbraError::Corruption("unknown miscount kind")),
        };
        Ok(Self { recorder, miscount })
    }
}

/// Encodes a list of causing transaction ids.
pub fn encode_causes(causes: &[TxnId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(causes.len() * 8);
    for id in causes {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

/// Decodes a list written by [`encode_causes`].
pub fn decode_causes(bytes: &[u8]) -> Result<Causes> {
    if bytes.len() % 8 != 0 {
        return Err(UmbraError::Corruption("miscount value is not a list of ids"));
    }
    bytes
        .chunks_exact(8)
        .map(|chunk| keys::read_u64(chunk, 0))
        .collect()
}
