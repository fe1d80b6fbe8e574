//! Peer-Liveness Watcher -- spec.md §4.4. Pure observation: this module
//! never touches the hint repository, only the in-memory [`PeerTable`].

use crate::config::Config;
use crate::peer::PeerTable;
use proto_handoff::{ProcessStatus, ProcessStatusKind};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    /// No actionable transition.
    None,
    /// The peer just came `Up` and the forwarder should begin draining
    /// hints addressed to it.
    PeerRecovered(String),
    /// The peer just went `Down`; the forwarder should suspend drain.
    PeerDown(String),
}

/// Folds one `ProcessStatus` broadcast event into the peer table. The peer
/// identity used throughout this crate is the event's `source_topic`: the
/// mapping from a cluster peer name to a bus topic is an external
/// configuration table (spec.md's "Peer identity" design note), so the core
/// simply treats whatever topic the event arrived on as the peer's
/// identity.
pub fn handle_process_status(
    table: &mut PeerTable,
    status: &ProcessStatus,
    config: &Config,
    now: Instant,
) -> LivenessEvent {
    match status.status {
        ProcessStatusKind::Startup if status.routing_header == config.data_writer_role => {
            if table.mark_up(&status.source_topic, now) {
                tracing::info!(peer = %status.source_topic, "liveness: peer recovered");
                LivenessEvent::PeerRecovered(status.source_topic.clone())
            } else {
                LivenessEvent::None
            }
        }
        ProcessStatusKind::Startup => LivenessEvent::None,
        ProcessStatusKind::Shutdown => {
            tracing::info!(peer = %status.source_topic, "liveness: peer shutdown");
            table.mark_down(&status.source_topic, now);
            LivenessEvent::PeerDown(status.source_topic.clone())
        }
        ProcessStatusKind::Heartbeat => {
            // A heartbeat from a peer already known `Up` simply refreshes
            // `last_status_time` so it doesn't trip `dead_after`; it never
            // transitions a peer that hasn't first sent `startup`.
            if table.is_up(&status.source_topic) {
                table.mark_up(&status.source_topic, now);
            }
            LivenessEvent::None
        }
    }
}

/// Peers that should be transitioned to `Down` because nothing has been
/// heard from them for `dead_after` (spec.md §4.4), checked on every tick.
pub fn handle_tick(table: &mut PeerTable, config: &Config, now: Instant) -> Vec<String> {
    table.expire_stale(config.dead_after, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto_handoff::OrderedF64;

    fn status(source_topic: &str, routing_header: &str, kind: ProcessStatusKind) -> ProcessStatus {
        ProcessStatus {
            source_topic: source_topic.to_string(),
            routing_header: routing_header.to_string(),
            status: kind,
            timestamp: OrderedF64(0.0),
        }
    }

    #[test]
    fn data_writer_startup_triggers_recovery() {
        let mut table = PeerTable::new();
        let config = Config::default();
        let event = handle_process_status(
            &mut table,
            &status("peer-c", "data_writer", ProcessStatusKind::Startup),
            &config,
            Instant::now(),
        );
        assert_eq!(event, LivenessEvent::PeerRecovered("peer-c".to_string()));
        assert!(table.is_up("peer-c"));
    }

    #[test]
    fn non_data_writer_startup_is_ignored() {
        let mut table = PeerTable::new();
        let config = Config::default();
        let event = handle_process_status(
            &mut table,
            &status("peer-c", "gateway", ProcessStatusKind::Startup),
            &config,
            Instant::now(),
        );
        assert_eq!(event, LivenessEvent::None);
        assert!(!table.is_up("peer-c"));
    }

    #[test]
    fn shutdown_suspends_drain() {
        let mut table = PeerTable::new();
        let config = Config::default();
        let now = Instant::now();
        handle_process_status(
            &mut table,
            &status("peer-c", "data_writer", ProcessStatusKind::Startup),
            &config,
            now,
        );
        let event = handle_process_status(
            &mut table,
            &status("peer-c", "data_writer", ProcessStatusKind::Shutdown),
            &config,
            now,
        );
        assert_eq!(event, LivenessEvent::PeerDown("peer-c".to_string()));
        assert!(!table.is_up("peer-c"));
    }
}
