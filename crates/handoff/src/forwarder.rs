//! Handoff Forwarder -- spec.md §4.5, §4.6. The protocol engine: pulls
//! hints from the repository, sends `ArchiveSegment`, and resolves replies
//! or timeouts back into `acknowledge`/`defer` calls.

use crate::bus::Bus;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::peer::PeerTable;
use exponential_backoff::Backoff;
use handoff_store::{Hint, HintRepository};
use proto_handoff::{
    ArchiveSegment, ArchiveSegmentReply, ArchiveSegmentResult, Envelope, SegmentKey,
};
use std::collections::HashMap;
use std::time::Instant;

/// One outstanding `ArchiveSegment` send awaiting a reply or timeout
/// (spec.md §4.5 step 3), mirroring the `(key, (PendingState, Instant))`
/// shape `crates/dekaf/src/session.rs`'s `Session::reads` uses for its own
/// pending-request table.
struct InFlight {
    dest_peer: String,
    attempts_at_send: u32,
    timeout_at: Instant,
}

pub struct Forwarder {
    config: Config,
    reply_topic: String,
    in_flight: HashMap<u64, InFlight>,
    backoff: Backoff,
}

impl Forwarder {
    pub fn new(config: Config, reply_topic: String) -> Self {
        let mut backoff = Backoff::new(u32::MAX, config.backoff_base, Some(config.backoff_cap));
        backoff.set_factor(2);
        backoff.set_jitter(config.backoff_jitter);
        Self {
            config,
            reply_topic,
            in_flight: HashMap::new(),
            backoff,
        }
    }

    pub fn in_flight_count(&self, dest_peer: &str) -> usize {
        self.in_flight
            .values()
            .filter(|f| f.dest_peer == dest_peer)
            .count()
    }

    fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        self.backoff
            .next(attempt.max(1))
            .unwrap_or(self.config.backoff_cap)
    }

    /// Tops up in-flight sends for `peer` up to `max_in_flight`, oldest hint
    /// first (spec.md §4.5 step 1-3). Returns how many were sent.
    pub async fn drain_peer(
        &mut self,
        repo: &HintRepository,
        bus: &dyn Bus,
        peer: &str,
    ) -> Result<usize> {
        let mut sent = 0;
        while self.in_flight_count(peer) < self.config.max_in_flight {
            let Some(hint) = repo.next_hint(peer)? else {
                break;
            };
            self.send(bus, &hint).await?;
            sent += 1;
        }
        Ok(sent)
    }

    async fn send(&mut self, bus: &dyn Bus, hint: &Hint) -> Result<()> {
        let message = ArchiveSegment {
            request_id: hint.hint_id as u128,
            dest_peer: hint.dest_peer.clone(),
            timestamp: proto_handoff::OrderedF64(hint.timestamp),
            segment: SegmentKey {
                avatar_id: hint.avatar_id,
                key: hint.key.clone(),
                version_number: hint.version_number,
                segment_number: hint.segment_number,
            },
            payload_ref: hint.payload_ref.clone().into(),
            reply_topic: self.reply_topic.clone(),
        };

        let topic = ArchiveSegment::routing_key(&hint.dest_peer);
        bus.publish(&topic, Envelope::new(topic.clone(), message.encode()))
            .await
            .map_err(|err| Error::Send(err.to_string()))?;

        let now = Instant::now();
        self.in_flight.insert(
            hint.hint_id,
            InFlight {
                dest_peer: hint.dest_peer.clone(),
                attempts_at_send: hint.attempts,
                timeout_at: now + self.config.ack_timeout,
            },
        );
        tracing::debug!(hint_id = hint.hint_id, dest_peer = %hint.dest_peer, "forwarder: sent ArchiveSegment");
        metrics::in_flight_gauge(&hint.dest_peer, self.in_flight_count(&hint.dest_peer));
        Ok(())
    }

    /// Resolves an `ArchiveSegmentReply` -- spec.md §4.5 step 4. A reply
    /// whose `request_id` has no in-flight entry (already timed out, or a
    /// stale duplicate) is discarded.
    pub fn handle_reply(&mut self, repo: &HintRepository, reply: &ArchiveSegmentReply) -> Result<()> {
        let hint_id = reply.request_id as u64;
        let Some(in_flight) = self.in_flight.remove(&hint_id) else {
            tracing::debug!(request_id = reply.request_id, "forwarder: reply for unknown in-flight request ignored");
            return Ok(());
        };
        metrics::in_flight_gauge(&in_flight.dest_peer, self.in_flight_count(&in_flight.dest_peer));

        match reply.result {
            ArchiveSegmentResult::Successful => {
                repo.acknowledge(hint_id)?;
                metrics::hint_forwarded();
                tracing::debug!(hint_id, "forwarder: hint acknowledged after successful delivery");
            }
            ArchiveSegmentResult::ErrorPermanent => {
                tracing::warn!(
                    hint_id,
                    dest_peer = %in_flight.dest_peer,
                    error_message = ?reply.error_message,
                    "forwarder: destination permanently rejected hint; dropping without retry"
                );
                repo.acknowledge(hint_id)?;
                metrics::hint_permanently_rejected();
            }
            ArchiveSegmentResult::ErrorNotReady | ArchiveSegmentResult::ErrorTransient => {
                let delay = self.backoff_delay(in_flight.attempts_at_send + 1);
                tracing::debug!(hint_id, ?delay, "forwarder: transient failure, deferring");
                repo.defer(hint_id, delay)?;
            }
        }
        Ok(())
    }

    /// Drops in-flight sends whose `ack_timeout` has elapsed and defers
    /// them as transient (spec.md §4.5 step 5, §5 "Cancellation and
    /// timeouts"). A subsequently-arriving late reply is matched against
    /// the now-empty in-flight table and discarded by `handle_reply`.
    pub fn expire_timeouts(&mut self, repo: &HintRepository, now: Instant) -> Result<usize> {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now >= f.timeout_at)
            .map(|(id, _)| *id)
            .collect();

        for hint_id in &expired {
            let in_flight = self.in_flight.remove(hint_id).expect("key from own iteration");
            tracing::warn!(hint_id, dest_peer = %in_flight.dest_peer, "forwarder: ack timeout elapsed, deferring");
            let delay = self.backoff_delay(in_flight.attempts_at_send + 1);
            repo.defer(*hint_id, delay)?;
            metrics::in_flight_gauge(&in_flight.dest_peer, self.in_flight_count(&in_flight.dest_peer));
        }
        Ok(expired.len())
    }
}

/// Startup recovery sweep (spec.md §4.6): of all `dest_peer`s with pending
/// hints, returns those already observed `Up` so the dispatcher can begin
/// draining them immediately. Peers not yet `Up` are left for the liveness
/// watcher to surface later; nothing is lost across a crash-restart because
/// the repository, not an in-memory cursor, is the source of truth.
pub fn startup_recovery_sweep(repo: &HintRepository, peers: &PeerTable) -> Result<Vec<String>> {
    Ok(repo
        .distinct_dest_peers()?
        .into_iter()
        .filter(|peer| peers.is_up(peer))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, LocalBus};
    use bytes::Bytes;
    use futures::StreamExt;
    use proto_handoff::PayloadRef;
    use std::time::Duration;

    fn store_one(repo: &HintRepository, dest_peer: &str, timestamp: f64) -> u64 {
        repo.store(
            dest_peer,
            timestamp,
            7,
            "a/b",
            100,
            2,
            PayloadRef::Inline(Bytes::from_static(b"bytes")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn drain_sends_oldest_first_and_acknowledges_on_success() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = HintRepository::open(dir.path()).unwrap();
        let bus = LocalBus::new();
        let mut replies = bus.subscribe(&ArchiveSegment::routing_key("peer-c"));

        let id = store_one(&repo, "peer-c", 1000.0);

        let mut forwarder = Forwarder::new(Config::default(), "handoff_server.reply".into());
        let sent = forwarder.drain_peer(&repo, &bus, "peer-c").await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(forwarder.in_flight_count("peer-c"), 1);

        let envelope = replies.next().await.unwrap();
        let archive = ArchiveSegment::decode(envelope.body).unwrap();
        assert_eq!(archive.request_id, id as u128);

        let reply = ArchiveSegmentReply {
            request_id: id as u128,
            result: ArchiveSegmentResult::Successful,
            error_message: None,
        };
        forwarder.handle_reply(&repo, &reply).unwrap();

        assert_eq!(forwarder.in_flight_count("peer-c"), 0);
        assert!(repo.next_hint("peer-c").unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_error_defers_hint_out_of_the_queue() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = HintRepository::open(dir.path()).unwrap();
        let bus = LocalBus::new();
        let _replies = bus.subscribe(&ArchiveSegment::routing_key("peer-c"));

        let id = store_one(&repo, "peer-c", handoff_store::now_seconds());
        let mut forwarder = Forwarder::new(Config::default(), "handoff_server.reply".into());
        forwarder.drain_peer(&repo, &bus, "peer-c").await.unwrap();

        let reply = ArchiveSegmentReply {
            request_id: id as u128,
            result: ArchiveSegmentResult::ErrorNotReady,
            error_message: None,
        };
        forwarder.handle_reply(&repo, &reply).unwrap();

        // Deferred into the future: not immediately eligible again, but not
        // lost either (the repository, not this forwarder, is ground truth).
        assert!(repo.next_hint("peer-c").unwrap().is_none());
        assert_eq!(forwarder.in_flight_count("peer-c"), 0);
    }

    #[test]
    fn backoff_delay_is_near_base_on_first_attempt_and_bounded_by_cap() {
        let config = Config::default();
        let forwarder = Forwarder::new(config.clone(), "handoff_server.reply".into());

        let first = forwarder.backoff_delay(1);
        assert!(first >= Duration::from_secs(7) && first <= Duration::from_secs(13));

        let late = forwarder.backoff_delay(30);
        assert!(late <= config.backoff_cap);
    }

    #[tokio::test]
    async fn permanent_rejection_acknowledges_without_retry() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = HintRepository::open(dir.path()).unwrap();
        let bus = LocalBus::new();
        let _replies = bus.subscribe(&ArchiveSegment::routing_key("peer-c"));

        let id = store_one(&repo, "peer-c", 1000.0);
        let mut forwarder = Forwarder::new(Config::default(), "handoff_server.reply".into());
        forwarder.drain_peer(&repo, &bus, "peer-c").await.unwrap();

        let reply = ArchiveSegmentReply {
            request_id: id as u128,
            result: ArchiveSegmentResult::ErrorPermanent,
            error_message: Some("segment exists with newer version".into()),
        };
        forwarder.handle_reply(&repo, &reply).unwrap();

        assert!(repo.next_hint("peer-c").unwrap().is_none());
    }

    #[tokio::test]
    async fn timeout_defers_and_late_reply_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = HintRepository::open(dir.path()).unwrap();
        let bus = LocalBus::new();
        let _replies = bus.subscribe(&ArchiveSegment::routing_key("peer-c"));

        let id = store_one(&repo, "peer-c", handoff_store::now_seconds());
        let mut config = Config::default();
        config.ack_timeout = Duration::from_millis(1);
        let mut forwarder = Forwarder::new(config, "handoff_server.reply".into());
        forwarder.drain_peer(&repo, &bus, "peer-c").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = forwarder.expire_timeouts(&repo, Instant::now()).unwrap();
        assert_eq!(expired, 1);

        // A late reply for the now-expired request_id is a no-op.
        let late_reply = ArchiveSegmentReply {
            request_id: id as u128,
            result: ArchiveSegmentResult::Successful,
            error_message: None,
        };
        forwarder.handle_reply(&repo, &late_reply).unwrap();
        assert_eq!(forwarder.in_flight_count("peer-c"), 0);
    }

    #[test]
    fn recovery_sweep_only_returns_up_peers() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = HintRepository::open(dir.path()).unwrap();
        store_one(&repo, "peer-b", 1.0);
        store_one(&repo, "peer-c", 2.0);

        let mut peers = PeerTable::new();
        peers.mark_up("peer-c", Instant::now());

        let ready = startup_recovery_sweep(&repo, &peers).unwrap();
        assert_eq!(ready, vec!["peer-c".to_string()]);
    }
}
