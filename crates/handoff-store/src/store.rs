//! The durable, crash-safe hint repository -- spec.md §4.1.
//!
//! Backed by a single RocksDB instance with four column families (plus a
//! `meta` CF for the `hint_id` sequence): live hints, the natural-key
//! uniqueness index, the `(dest_peer, timestamp, hint_id)` pending index
//! that `next_hint` scans, and a dead-letter CF for quarantined records.
//! See `crate::keys` for the exact byte encodings and why the pending
//! index orders by `timestamp` rather than literally following spec.md
//! §6's named column order.

use crate::error::{Error, Result};
use crate::keys::{
    self, ALL_COLUMN_FAMILIES, CF_DEAD_LETTER, CF_HINTS, CF_META, CF_NATURAL_INDEX,
    CF_PENDING_INDEX, NEXT_HINT_ID_KEY,
};
use crate::model::{Hint, NaturalKey, StoredPayloadRef};
use proto_handoff::PayloadRef;
use rocksdb::{Options, WriteBatch, WriteOptions, DB};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `store`/`defer`/`acknowledge`/`quarantine` all commit through this: per
/// spec.md §4.1, "`store` returns only after the hint is fsync-durable" is
/// the ground truth at-least-once delivery derives from, so every mutation
/// of the durable queue pays for an fsync rather than just a WAL append.
fn durable_write_opts() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

/// This binding of RocksDB surfaces out-of-space/quota conditions as a
/// generic IO error string rather than a structured code, so `store`'s
/// `StorageFull` reply (spec.md §6, §7) is detected by matching on the
/// message text of a failed write.
fn is_storage_full_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no space left") || lower.contains("enospc") || lower.contains("disk quota exceeded")
}

fn classify_write_error(err: rocksdb::Error) -> Error {
    if is_storage_full_message(&err.to_string()) {
        Error::StorageFull
    } else {
        Error::Rocks(err)
    }
}

/// Wall-clock seconds since the epoch, matching the `f64-seconds-since-epoch`
/// timestamps carried on the wire (spec.md §6).
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct HintRepository {
    db: DB,
}

impl HintRepository {
    /// Opens (or creates) the repository at `path`, typically
    /// `$STATE_DIR/handoff`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, ALL_COLUMN_FAMILIES.iter())?;
        Ok(Self { db })
    }

    /// Insert-or-replace a hint -- spec.md §4.1. Returns the `hint_id` that
    /// now owns this natural key (either the freshly-inserted one, or the
    /// pre-existing one if the incoming record was stale).
    pub fn store(
        &self,
        dest_peer: &str,
        timestamp: f64,
        avatar_id: u32,
        key: &str,
        version_number: u64,
        segment_number: u8,
        payload_ref: PayloadRef,
    ) -> Result<u64> {
        let natural_key = NaturalKey {
            dest_peer,
            avatar_id,
            key,
            version_number,
            segment_number,
        };
        let natural_index_cf = self.cf(CF_NATURAL_INDEX);

        if let Some(existing_id_bytes) = self
            .db
            .get_pinned_cf(natural_index_cf, keys::natural_index_key(&natural_key))?
        {
            let existing_id = u64::from_be_bytes(existing_id_bytes.as_ref().try_into().map_err(
                |_| Error::Corrupt("natural index value is not 8 bytes".into()),
            )?);
            match self.load_hint(existing_id) {
                Ok(Some(existing)) => {
                    if existing.timestamp >= timestamp {
                        // Monotone timestamp replacement, spec.md §8: the
                        // incoming record is stale. Idempotent no-op; caller
                        // still gets a `successful` reply.
                        return Ok(existing_id);
                    }

                    let mut batch = WriteBatch::default();
                    self.delete_hint_into(&mut batch, &existing)?;
                    let new_id = self.insert_hint_into(
                        &mut batch,
                        dest_peer,
                        timestamp,
                        avatar_id,
                        key,
                        version_number,
                        segment_number,
                        payload_ref,
                    )?;
                    self.db
                        .write_opt(batch, &durable_write_opts())
                        .map_err(classify_write_error)?;
                    metrics::counter!("handoff_hints_stored_total").increment(1);
                    return Ok(new_id);
                }
                Ok(None) | Err(Error::Corrupt(_)) => {
                    // The natural index points at a hint that is gone or
                    // unreadable. Treat the incoming record as authoritative
                    // and overwrite the stale pointer rather than failing the
                    // whole `store` call over a single dangling index entry.
                    tracing::warn!(
                        hint_id = existing_id,
                        "natural index pointed at a missing or corrupt hint; overwriting"
                    );
                    let mut batch = WriteBatch::default();
                    batch.delete_cf(self.cf(CF_HINTS), keys::hint_key(existing_id));
                    let new_id = self.insert_hint_into(
                        &mut batch,
                        dest_peer,
                        timestamp,
                        avatar_id,
                        key,
                        version_number,
                        segment_number,
                        payload_ref,
                    )?;
                    self.db
                        .write_opt(batch, &durable_write_opts())
                        .map_err(classify_write_error)?;
                    metrics::counter!("handoff_hints_stored_total").increment(1);
                    return Ok(new_id);
                }
                Err(other) => return Err(other),
            }
        }

        let mut batch = WriteBatch::default();
        let hint_id = self.insert_hint_into(
            &mut batch,
            dest_peer,
            timestamp,
            avatar_id,
            key,
            version_number,
            segment_number,
            payload_ref,
        )?;
        self.db
            .write_opt(batch, &durable_write_opts())
            .map_err(classify_write_error)?;
        metrics::counter!("handoff_hints_stored_total").increment(1);
        Ok(hint_id)
    }

    /// The oldest-`timestamp` eligible hint for `dest_peer` (one whose
    /// `next_attempt_at <= now`), or `None`. The pending index is keyed
    /// `(dest_peer, timestamp, hint_id)` so a forward scan visits candidates
    /// in the right order already; entries not yet eligible are skipped, not
    /// treated as a stopping point, since a later, not-yet-eligible entry
    /// never blocks an earlier, eligible one (spec.md §4.1/§8). A pending
    /// index entry that turns out to point at a missing or corrupt hint is
    /// cleaned up in place -- the dangling entry is removed, and in the
    /// corrupt case the hint itself is quarantined -- so one bad record can
    /// never wedge the rest of a peer's queue.
    pub fn next_hint(&self, dest_peer: &str) -> Result<Option<Hint>> {
        let cf = self.cf(CF_PENDING_INDEX);
        let prefix = keys::pending_index_prefix(dest_peer);
        let now = now_seconds();

        let iter = self
            .db
            .iterator_cf(cf, rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward));

        for item in iter {
            let (key_bytes, value_bytes) = item?;
            if !key_bytes.starts_with(&prefix) {
                break;
            }

            let (_timestamp_bits, hint_id) = keys::decode_pending_index_key(prefix.len() - 1, &key_bytes);
            let next_attempt_at = f64::from_bits(keys::decode_pending_index_value(&value_bytes));
            if next_attempt_at > now {
                continue;
            }

            match self.load_hint(hint_id) {
                Ok(Some(hint)) => return Ok(Some(hint)),
                Ok(None) => {
                    tracing::warn!(hint_id, "pending index points at a missing hint; dropping entry");
                    self.db
                        .delete_cf_opt(cf, &key_bytes, &durable_write_opts())
                        .map_err(classify_write_error)?;
                    continue;
                }
                Err(Error::Corrupt(msg)) => {
                    tracing::warn!(hint_id, %msg, "pending index points at a corrupt hint; quarantining");
                    self.quarantine(hint_id)?;
                    // `quarantine` decodes the hint to find its pending-index
                    // entry; if the corruption prevented that, remove this
                    // exact key directly so the scan still makes progress.
                    self.db
                        .delete_cf_opt(cf, &key_bytes, &durable_write_opts())
                        .map_err(classify_write_error)?;
                    continue;
                }
                Err(other) => return Err(other),
            }
        }

        Ok(None)
    }

    /// Bumps `next_attempt_at` to `now + delay` and increments `attempts`.
    /// The pending index key is `(dest_peer, timestamp, hint_id)` -- deferral
    /// never changes `timestamp`, so the key is stable and only the value
    /// (`next_attempt_at`) needs overwriting.
    pub fn defer(&self, hint_id: u64, delay: Duration) -> Result<()> {
        let Some(mut hint) = self.load_hint(hint_id)? else {
            return Ok(());
        };

        hint.attempts += 1;
        hint.next_attempt_at = now_seconds() + delay.as_secs_f64();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_PENDING_INDEX),
            keys::pending_index_key(&hint.dest_peer, hint.timestamp, hint.hint_id),
            keys::pending_index_value(hint.next_attempt_at),
        );
        batch.put_cf(self.cf(CF_HINTS), keys::hint_key(hint_id), encode_hint(&hint)?);
        self.db
            .write_opt(batch, &durable_write_opts())
            .map_err(classify_write_error)?;
        metrics::counter!("handoff_hints_deferred_total").increment(1);
        Ok(())
    }

    /// Removes the hint and releases its payload. Idempotent: acknowledging
    /// a missing id is a no-op.
    pub fn acknowledge(&self, hint_id: u64) -> Result<()> {
        let Some(hint) = self.load_hint(hint_id)? else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        self.delete_hint_into(&mut batch, &hint)?;
        self.db
            .write_opt(batch, &durable_write_opts())
            .map_err(classify_write_error)?;
        Ok(())
    }

    /// Moves a hint whose record was found corrupt (spec.md §7
    /// `StoragePermanent`) into the dead-letter column family. Additive to
    /// spec.md's named contract (see `SPEC_FULL.md` §3).
    ///
    /// Reads the raw `hints` CF bytes directly rather than through
    /// `load_hint`, so quarantining a corrupt record doesn't itself fail with
    /// the very `Error::Corrupt` it exists to handle. Index cleanup
    /// (natural-key and pending-index entries) is best-effort: it only
    /// happens if the bytes still decode, since a truly corrupt record may
    /// not carry a recoverable `dest_peer`/`timestamp`/natural key. Idempotent:
    /// quarantining an id with no live record is a no-op.
    pub fn quarantine(&self, hint_id: u64) -> Result<()> {
        let hints_cf = self.cf(CF_HINTS);
        let Some(raw) = self.db.get_pinned_cf(hints_cf, keys::hint_key(hint_id))? else {
            return Ok(());
        };
        let raw = raw.as_ref().to_vec();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DEAD_LETTER), keys::hint_key(hint_id), &raw);
        batch.delete_cf(hints_cf, keys::hint_key(hint_id));

        if let Ok(hint) = decode_hint(hint_id, &raw) {
            batch.delete_cf(
                self.cf(CF_NATURAL_INDEX),
                keys::natural_index_key(&hint.natural_key()),
            );
            batch.delete_cf(
                self.cf(CF_PENDING_INDEX),
                keys::pending_index_key(&hint.dest_peer, hint.timestamp, hint.hint_id),
            );
        }

        self.db
            .write_opt(batch, &durable_write_opts())
            .map_err(classify_write_error)?;
        metrics::counter!("handoff_hints_quarantined_total").increment(1);
        Ok(())
    }

    /// The set of distinct `dest_peer`s with at least one pending hint, for
    /// the startup recovery sweep (spec.md §4.6).
    pub fn distinct_dest_peers(&self) -> Result<Vec<String>> {
        let cf = self.cf(CF_PENDING_INDEX);
        let mut peers = std::collections::BTreeSet::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(nul) = key.iter().position(|b| *b == 0) {
                peers.insert(String::from_utf8_lossy(&key[..nul]).into_owned());
            }
        }
        Ok(peers.into_iter().collect())
    }

    /// Flushes and releases the store. Ownership is consumed, so no further
    /// calls through this handle are possible -- the Rust type system
    /// enforces spec.md §4.1's "subsequent operations fail" requirement at
    /// compile time rather than with a runtime flag.
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(name)
            .unwrap_or_else(|| panic!("column family {name} must exist"))
    }

    fn load_hint(&self, hint_id: u64) -> Result<Option<Hint>> {
        match self.db.get_pinned_cf(self.cf(CF_HINTS), keys::hint_key(hint_id))? {
            Some(bytes) => Ok(Some(decode_hint(hint_id, &bytes)?)),
            None => Ok(None),
        }
    }

    fn next_hint_id(&self) -> Result<u64> {
        let meta = self.cf(CF_META);
        let next = match self.db.get_pinned_cf(meta, NEXT_HINT_ID_KEY)? {
            Some(bytes) => u64::from_be_bytes(
                bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Corrupt("hint_id sequence is corrupt".into()))?,
            ),
            None => 1,
        };
        self.db
            .put_cf_opt(meta, NEXT_HINT_ID_KEY, (next + 1).to_be_bytes(), &durable_write_opts())?;
        Ok(next)
    }

    fn insert_hint_into(
        &self,
        batch: &mut WriteBatch,
        dest_peer: &str,
        timestamp: f64,
        avatar_id: u32,
        key: &str,
        version_number: u64,
        segment_number: u8,
        payload_ref: PayloadRef,
    ) -> Result<u64> {
        let hint_id = self.next_hint_id()?;
        let hint = Hint {
            hint_id,
            dest_peer: dest_peer.to_string(),
            timestamp,
            avatar_id,
            key: key.to_string(),
            version_number,
            segment_number,
            payload_ref: StoredPayloadRef::from(payload_ref),
            attempts: 0,
            next_attempt_at: timestamp,
        };

        batch.put_cf(self.cf(CF_HINTS), keys::hint_key(hint_id), encode_hint(&hint)?);
        batch.put_cf(
            self.cf(CF_NATURAL_INDEX),
            keys::natural_index_key(&hint.natural_key()),
            keys::hint_key(hint_id),
        );
        batch.put_cf(
            self.cf(CF_PENDING_INDEX),
            keys::pending_index_key(dest_peer, timestamp, hint_id),
            keys::pending_index_value(hint.next_attempt_at),
        );
        Ok(hint_id)
    }

    fn delete_hint_into(&self, batch: &mut WriteBatch, hint: &Hint) -> Result<()> {
        batch.delete_cf(self.cf(CF_HINTS), keys::hint_key(hint.hint_id));
        batch.delete_cf(
            self.cf(CF_NATURAL_INDEX),
            keys::natural_index_key(&hint.natural_key()),
        );
        batch.delete_cf(
            self.cf(CF_PENDING_INDEX),
            keys::pending_index_key(&hint.dest_peer, hint.timestamp, hint.hint_id),
        );
        Ok(())
    }
}

fn encode_hint(hint: &Hint) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(hint)?)
}

fn decode_hint(hint_id: u64, bytes: &[u8]) -> Result<Hint> {
    let hint: Hint = serde_json::from_slice(bytes)
        .map_err(|err| Error::Corrupt(format!("hint {hint_id} is malformed: {err}")))?;
    Ok(hint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn open_temp() -> (tempfile::TempDir, HintRepository) {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = HintRepository::open(dir.path()).unwrap();
        (dir, repo)
    }

    fn store_one(repo: &HintRepository, dest_peer: &str, timestamp: f64) -> u64 {
        repo.store(
            dest_peer,
            timestamp,
            7,
            "a/b",
            100,
            2,
            PayloadRef::Inline(Bytes::from_static(b"segment-bytes")),
        )
        .unwrap()
    }

    #[test]
    fn happy_path_round_trip() {
        let (_dir, repo) = open_temp();
        let id = store_one(&repo, "peer-c", 1000.0);

        let hint = repo.next_hint("peer-c").unwrap().unwrap();
        assert_eq!(hint.hint_id, id);
        assert_eq!(hint.timestamp, 1000.0);

        repo.acknowledge(id).unwrap();
        assert!(repo.next_hint("peer-c").unwrap().is_none());
    }

    #[test]
    fn replace_on_newer_timestamp() {
        let (_dir, repo) = open_temp();
        let h1 = store_one(&repo, "peer-c", 1000.0);
        let h2 = repo
            .store(
                "peer-c",
                1001.0,
                7,
                "a/b",
                100,
                2,
                PayloadRef::Handle("segments/0002".into()),
            )
            .unwrap();

        assert_ne!(h1, h2);
        let hint = repo.next_hint("peer-c").unwrap().unwrap();
        assert_eq!(hint.hint_id, h2);
        assert_eq!(hint.timestamp, 1001.0);
    }

    #[test]
    fn stale_resubmission_is_rejected() {
        let (_dir, repo) = open_temp();
        let h1 = store_one(&repo, "peer-c", 1000.0);
        let returned = repo
            .store(
                "peer-c",
                999.0,
                7,
                "a/b",
                100,
                2,
                PayloadRef::Handle("segments/0002".into()),
            )
            .unwrap();

        assert_eq!(returned, h1);
        let hint = repo.next_hint("peer-c").unwrap().unwrap();
        assert_eq!(hint.timestamp, 1000.0);
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let (_dir, repo) = open_temp();
        let id = store_one(&repo, "peer-c", 1000.0);
        repo.acknowledge(id).unwrap();
        repo.acknowledge(id).unwrap();
        assert!(repo.next_hint("peer-c").unwrap().is_none());
    }

    #[test]
    fn defer_moves_hint_behind_now() {
        let (_dir, repo) = open_temp();
        let id = store_one(&repo, "peer-c", now_seconds());
        repo.defer(id, Duration::from_secs(3600)).unwrap();

        assert!(repo.next_hint("peer-c").unwrap().is_none());
    }

    #[test]
    fn defer_increments_attempts_monotonically() {
        let (_dir, repo) = open_temp();
        let id = store_one(&repo, "peer-c", now_seconds() - 10.0);
        repo.defer(id, Duration::from_millis(1)).unwrap();
        repo.defer(id, Duration::from_millis(1)).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let hint = repo.next_hint("peer-c").unwrap().unwrap();
        assert_eq!(hint.attempts, 2);
    }

    #[test]
    fn distinct_dest_peers_covers_all_pending() {
        let (_dir, repo) = open_temp();
        store_one(&repo, "peer-b", 1.0);
        store_one(&repo, "peer-c", 2.0);
        let mut peers = repo.distinct_dest_peers().unwrap();
        peers.sort();
        assert_eq!(peers, vec!["peer-b".to_string(), "peer-c".to_string()]);
    }

    #[test]
    fn quarantine_removes_from_live_queue() {
        let (_dir, repo) = open_temp();
        let id = store_one(&repo, "peer-c", 1000.0);
        repo.quarantine(id).unwrap();
        assert!(repo.next_hint("peer-c").unwrap().is_none());
    }

    /// Reproduces the ordering bug from the maintainer review: hint A
    /// (timestamp 100) gets deferred far into the future before hint B
    /// (timestamp 700, inserted later) becomes eligible. Once both are
    /// eligible, `next_hint` must still return the oldest-`timestamp` one
    /// (A), not whichever happens to have the smaller `next_attempt_at`.
    #[test]
    fn next_hint_picks_oldest_timestamp_among_eligible_not_smallest_next_attempt() {
        let (_dir, repo) = open_temp();
        let now = now_seconds();

        let a = repo
            .store("peer-c", now - 900.0, 1, "a", 1, 0, PayloadRef::Handle("a".into()))
            .unwrap();
        // Defer A so its next_attempt_at jumps far ahead, but still back
        // in the past relative to "now" so it is eligible by the time B is
        // checked below.
        repo.defer(a, Duration::from_millis(1)).unwrap();

        let b = repo
            .store("peer-c", now - 300.0, 1, "b", 1, 0, PayloadRef::Handle("b".into()))
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));

        let hint = repo.next_hint("peer-c").unwrap().unwrap();
        assert_eq!(hint.hint_id, a, "oldest-timestamp hint must win even though it was deferred more recently");
        let _ = b;
    }

    #[test]
    fn next_hint_skips_ineligible_entry_to_return_a_later_eligible_one() {
        let (_dir, repo) = open_temp();
        let now = now_seconds();

        let future = repo
            .store("peer-c", now - 500.0, 1, "future", 1, 0, PayloadRef::Handle("f".into()))
            .unwrap();
        repo.defer(future, Duration::from_secs(3600)).unwrap();

        let eligible = repo
            .store("peer-c", now - 100.0, 1, "eligible", 1, 0, PayloadRef::Handle("e".into()))
            .unwrap();

        let hint = repo.next_hint("peer-c").unwrap().unwrap();
        assert_eq!(hint.hint_id, eligible);
    }

    #[test]
    fn next_hint_quarantines_corrupt_record_and_continues() {
        let (_dir, repo) = open_temp();
        let now = now_seconds();

        let corrupt_id = store_one(&repo, "peer-c", now - 500.0);
        repo.db
            .put_cf_opt(
                repo.cf(CF_HINTS),
                keys::hint_key(corrupt_id),
                b"not json",
                &durable_write_opts(),
            )
            .unwrap();

        let good_id = repo
            .store("peer-c", now - 100.0, 1, "good", 1, 0, PayloadRef::Handle("g".into()))
            .unwrap();

        let hint = repo.next_hint("peer-c").unwrap().unwrap();
        assert_eq!(hint.hint_id, good_id);

        // The corrupt record landed in the dead-letter CF and no longer
        // wedges the peer's queue on a second call either.
        assert!(repo
            .db
            .get_pinned_cf(repo.cf(CF_DEAD_LETTER), keys::hint_key(corrupt_id))
            .unwrap()
            .is_some());
        repo.acknowledge(good_id).unwrap();
        assert!(repo.next_hint("peer-c").unwrap().is_none());
    }

    #[test]
    fn storage_full_message_classifier_matches_known_phrasings() {
        assert!(is_storage_full_message("IO error: No space left on device"));
        assert!(is_storage_full_message("ENOSPC: could not write"));
        assert!(is_storage_full_message("Disk quota exceeded while writing WAL"));
        assert!(!is_storage_full_message("IO error: permission denied"));
    }
}
