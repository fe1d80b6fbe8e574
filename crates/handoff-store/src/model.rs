use proto_handoff::PayloadRef;
use serde::{Deserialize, Serialize};

/// The durable record of an undelivered segment handoff -- spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hint {
    pub hint_id: u64,
    pub dest_peer: String,
    /// Wall-clock seconds since epoch at which the original write was
    /// attempted. Assumed non-negative: it is used as a byte-sortable
    /// index key (see [`crate::keys`]).
    pub timestamp: f64,
    pub avatar_id: u32,
    pub key: String,
    pub version_number: u64,
    pub segment_number: u8,
    pub payload_ref: StoredPayloadRef,
    pub attempts: u32,
    /// Wall-clock seconds since epoch before which a forwarder may not pick
    /// this hint up.
    pub next_attempt_at: f64,
}

/// Serializable mirror of [`proto_handoff::PayloadRef`]; kept distinct so
/// the on-disk schema does not silently change if the wire enum grows a
/// variant that isn't meaningful to persist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoredPayloadRef {
    Inline(Vec<u8>),
    Handle(String),
}

impl From<PayloadRef> for StoredPayloadRef {
    fn from(p: PayloadRef) -> Self {
        match p {
            PayloadRef::Inline(bytes) => StoredPayloadRef::Inline(bytes.to_vec()),
            PayloadRef::Handle(h) => StoredPayloadRef::Handle(h),
        }
    }
}

impl From<StoredPayloadRef> for PayloadRef {
    fn from(p: StoredPayloadRef) -> Self {
        match p {
            StoredPayloadRef::Inline(bytes) => PayloadRef::Inline(bytes.into()),
            StoredPayloadRef::Handle(h) => PayloadRef::Handle(h),
        }
    }
}

impl Hint {
    pub fn natural_key(&self) -> NaturalKey<'_> {
        NaturalKey {
            dest_peer: &self.dest_peer,
            avatar_id: self.avatar_id,
            key: &self.key,
            version_number: self.version_number,
            segment_number: self.segment_number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NaturalKey<'a> {
    pub dest_peer: &'a str,
    pub avatar_id: u32,
    pub key: &'a str,
    pub version_number: u64,
    pub segment_number: u8,
}
