//! Call-site metric helpers (spec.md names no metrics requirement; this is
//! ambient-stack instrumentation per `SPEC_FULL.md` §1.4, using the same
//! `metrics` facade crate `crates/dekaf` instruments with). Counters for
//! storage-side events (`handoff_hints_stored_total`,
//! `handoff_hints_deferred_total`, `handoff_hints_quarantined_total`) live
//! beside their call sites in `handoff-store`; this module covers the
//! protocol-engine events that only the forwarder and liveness watcher can
//! see.

pub fn hint_forwarded() {
    metrics::counter!("handoff_hints_forwarded_total").increment(1);
}

pub fn hint_permanently_rejected() {
    metrics::counter!("handoff_hints_permanently_rejected_total").increment(1);
}

pub fn in_flight_gauge(dest_peer: &str, count: usize) {
    metrics::gauge!("handoff_in_flight", "dest_peer" => dest_peer.to_string()).set(count as f64);
}

pub fn peers_up_gauge(count: usize) {
    metrics::gauge!("handoff_peers_up").set(count as f64);
}
