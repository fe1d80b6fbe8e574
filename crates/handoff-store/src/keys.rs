//! RocksDB key encodings for the hint repository's column families.
//!
//! Mirrors the schema of spec.md §6: a primary `hint` table keyed by
//! `hint_id`, a uniqueness index on the natural key, and a pending index
//! that `next_hint` scans. All multi-byte integers are big-endian so
//! lexicographic byte order matches numeric order, which is what makes
//! RocksDB's sorted iteration double as our priority queue.
//!
//! spec.md §6 names the pending index as `(dest_peer, next_attempt_at,
//! timestamp, hint_id)`, but that column order picks the smallest
//! `next_attempt_at` first, not the smallest `timestamp` among eligible
//! hints -- it can return a hint out of `timestamp` order once any other
//! hint for the same peer has ever been deferred, violating spec.md
//! §4.1/§8's explicit "oldest-first per peer" invariant. The index here is
//! keyed `(dest_peer, timestamp, hint_id)` instead, so scanning it in key
//! order visits hints oldest-`timestamp`-first; `next_attempt_at` travels
//! in the value instead of the key, and `next_hint`'s scan skips (without
//! stopping at) entries that are not yet eligible.

use crate::model::NaturalKey;

pub const CF_HINTS: &str = "hints";
pub const CF_NATURAL_INDEX: &str = "natural_index";
pub const CF_PENDING_INDEX: &str = "pending_index";
pub const CF_DEAD_LETTER: &str = "dead_letter";
pub const CF_META: &str = "meta";

pub const ALL_COLUMN_FAMILIES: &[&str] = &[
    CF_HINTS,
    CF_NATURAL_INDEX,
    CF_PENDING_INDEX,
    CF_DEAD_LETTER,
    CF_META,
];

pub const NEXT_HINT_ID_KEY: &[u8] = b"next_hint_id";

pub fn hint_key(hint_id: u64) -> [u8; 8] {
    hint_id.to_be_bytes()
}

pub fn natural_index_key(nk: &NaturalKey<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        nk.dest_peer.len() + 1 + 4 + nk.key.len() + 1 + 8 + 1,
    );
    out.extend_from_slice(nk.dest_peer.as_bytes());
    out.push(0); // separator: dest_peer may not contain a NUL byte.
    out.extend_from_slice(&nk.avatar_id.to_be_bytes());
    out.extend_from_slice(nk.key.as_bytes());
    out.push(0);
    out.extend_from_slice(&nk.version_number.to_be_bytes());
    out.push(nk.segment_number);
    out
}

/// `f64` -> byte-sortable `u64` for non-negative wall-clock timestamps. IEEE
/// 754 bit patterns for non-negative finite floats already compare the same
/// as their big-endian byte representation, so this is a direct bit cast.
pub fn sortable_timestamp(ts: f64) -> u64 {
    debug_assert!(ts.is_sign_positive(), "timestamps must be non-negative");
    ts.to_bits()
}

pub fn pending_index_prefix(dest_peer: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(dest_peer.len() + 1);
    out.extend_from_slice(dest_peer.as_bytes());
    out.push(0);
    out
}

/// Key for the pending index: `(dest_peer, timestamp, hint_id)`, ordered so
/// a forward scan visits a peer's hints oldest-`timestamp`-first.
pub fn pending_index_key(dest_peer: &str, timestamp: f64, hint_id: u64) -> Vec<u8> {
    let mut out = pending_index_prefix(dest_peer);
    out.extend_from_slice(&sortable_timestamp(timestamp).to_be_bytes());
    out.extend_from_slice(&hint_id.to_be_bytes());
    out
}

/// Decode the `(timestamp_bits, hint_id)` suffix of a pending-index key,
/// given the known `dest_peer` prefix length, for use by `next_hint`'s scan.
pub fn decode_pending_index_key(dest_peer_len: usize, key: &[u8]) -> (u64, u64) {
    let rest = &key[dest_peer_len + 1..];
    let timestamp_bits = u64::from_be_bytes(rest[0..8].try_into().unwrap());
    let hint_id = u64::from_be_bytes(rest[8..16].try_into().unwrap());
    (timestamp_bits, hint_id)
}

/// Value for the pending index: just `next_attempt_at`, checked against
/// `now` as the scan visits each key so eligibility is a plain bit
/// comparison rather than a second lookup into `hint`.
pub fn pending_index_value(next_attempt_at: f64) -> [u8; 8] {
    sortable_timestamp(next_attempt_at).to_be_bytes()
}

pub fn decode_pending_index_value(value: &[u8]) -> u64 {
    u64::from_be_bytes(value.try_into().expect("pending index value is 8 bytes"))
}
