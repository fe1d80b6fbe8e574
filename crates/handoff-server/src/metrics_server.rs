//! Serves the `metrics` crate's recorder at `/metrics`, mirroring
//! `crates/dekaf/src/metrics_server.rs`'s Prometheus exporter but scoped to
//! just the counters/gauges this daemon emits (no histogram buckets, no
//! allocator stats -- those are dekaf-specific, not named by this spec).

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding metrics listener")?;
    tracing::info!(%addr, "metrics server listening");
    axum::serve(listener, app)
        .await
        .context("serving metrics")?;
    Ok(())
}
