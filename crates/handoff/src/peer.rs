//! In-memory, per-peer liveness state -- spec.md §3 "Peer state". Created
//! on first observation, retained for the process lifetime, never
//! persisted: a restart resets every peer to unknown until a fresh
//! `ProcessStatus` (or the startup recovery sweep) re-establishes it.

use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub last_seen_status: PeerStatus,
    pub last_status_time: Instant,
    pub drain_in_progress: bool,
}

/// Tracks liveness for every `dest_peer` this process has heard of.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &str) -> Option<&PeerInfo> {
        self.peers.get(peer)
    }

    pub fn is_up(&self, peer: &str) -> bool {
        matches!(
            self.peers.get(peer),
            Some(PeerInfo {
                last_seen_status: PeerStatus::Up,
                ..
            })
        )
    }

    /// Marks `peer` `Up` as of `now`. Returns `true` if this is a
    /// transition into `Up` (i.e. drain should begin), `false` if the peer
    /// was already known to be up.
    pub fn mark_up(&mut self, peer: &str, now: Instant) -> bool {
        let transitioned = !self.is_up(peer);
        self.peers.insert(
            peer.to_string(),
            PeerInfo {
                last_seen_status: PeerStatus::Up,
                last_status_time: now,
                drain_in_progress: self.peers.get(peer).is_some_and(|p| p.drain_in_progress),
            },
        );
        transitioned
    }

    /// Marks `peer` `Down` as of `now`, whether from an explicit shutdown
    /// event or `dead_after` heartbeat expiry (spec.md §4.4).
    pub fn mark_down(&mut self, peer: &str, now: Instant) {
        self.peers.insert(
            peer.to_string(),
            PeerInfo {
                last_seen_status: PeerStatus::Down,
                last_status_time: now,
                drain_in_progress: false,
            },
        );
    }

    pub fn set_draining(&mut self, peer: &str, draining: bool) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.drain_in_progress = draining;
        }
    }

    /// Peers observed `Down` (by explicit shutdown, or silence) for longer
    /// than `dead_after` relative to `now`. Checked on every tick
    /// (spec.md §4.4).
    pub fn expire_stale(&mut self, dead_after: std::time::Duration, now: Instant) -> Vec<String> {
        let mut newly_down = Vec::new();
        for (peer, info) in self.peers.iter_mut() {
            if info.last_seen_status == PeerStatus::Up
                && now.duration_since(info.last_status_time) >= dead_after
            {
                info.last_seen_status = PeerStatus::Down;
                info.last_status_time = now;
                info.drain_in_progress = false;
                newly_down.push(peer.clone());
            }
        }
        newly_down
    }

    pub fn up_peers(&self) -> impl Iterator<Item = &str> {
        self.peers
            .iter()
            .filter(|(_, info)| info.last_seen_status == PeerStatus::Up)
            .map(|(peer, _)| peer.as_str())
    }

    pub fn up_peer_count(&self) -> usize {
        self.up_peers().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_up_reports_transition_once() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        assert!(table.mark_up("peer-c", now));
        assert!(!table.mark_up("peer-c", now));
        assert!(table.is_up("peer-c"));
    }

    #[test]
    fn shutdown_marks_peer_down() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        table.mark_up("peer-c", now);
        table.mark_down("peer-c", now);
        assert!(!table.is_up("peer-c"));
    }

    #[test]
    fn silence_past_dead_after_marks_down() {
        let mut table = PeerTable::new();
        let t0 = Instant::now();
        table.mark_up("peer-c", t0);

        let still_up = table.expire_stale(std::time::Duration::from_secs(120), t0);
        assert!(still_up.is_empty());

        let later = t0 + std::time::Duration::from_secs(121);
        let expired = table.expire_stale(std::time::Duration::from_secs(120), later);
        assert_eq!(expired, vec!["peer-c".to_string()]);
        assert!(!table.is_up("peer-c"));
    }
}
