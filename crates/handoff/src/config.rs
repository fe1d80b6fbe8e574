//! Tunables shared by the dispatcher, liveness watcher and forwarder, with
//! the defaults spec.md leaves implicit (§4.2, §4.4, §4.5, §5).
//! `handoff-server` exposes these as `--flag`/`env` pairs via `clap`; this
//! struct is the single place the defaults live.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum concurrently in-flight `ArchiveSegment` sends per peer
    /// (spec.md §4.5 step 3). Default 4.
    pub max_in_flight: usize,
    /// How long the forwarder waits for an `ArchiveSegmentReply` before
    /// treating the send as transient and deferring (spec.md §5). Default
    /// 30s.
    pub ack_timeout: Duration,
    /// How long a peer may go without a `ProcessStatus` event before it is
    /// considered `Down` (spec.md §4.4). Default 120s (≈3x heartbeat).
    pub dead_after: Duration,
    /// Upper bound on the dispatcher's periodic tick (spec.md §4.2). Default
    /// 5s.
    pub tick_interval: Duration,
    /// Base delay for the forwarder's exponential backoff (spec.md §4.5).
    /// Default 10s.
    pub backoff_base: Duration,
    /// Cap on the forwarder's exponential backoff. Default 10 minutes.
    pub backoff_cap: Duration,
    /// Full-jitter fraction applied to backoff delays, e.g. `0.25` for
    /// ±25%. Default 0.25.
    pub backoff_jitter: f32,
    /// Role string identifying a data-writer peer in `ProcessStatus.routing_header`
    /// (spec.md §4.4).
    pub data_writer_role: String,
    /// How long the `Draining` state continues forwarding outstanding hints
    /// after a shutdown signal before the process stops (spec.md §4.2).
    /// Default 30s.
    pub drain_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            ack_timeout: Duration::from_secs(30),
            dead_after: Duration::from_secs(120),
            tick_interval: Duration::from_secs(5),
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(600),
            backoff_jitter: 0.25,
            data_writer_role: "data_writer".to_string(),
            drain_grace: Duration::from_secs(30),
        }
    }
}
