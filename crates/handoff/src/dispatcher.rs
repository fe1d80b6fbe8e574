//! Message Dispatcher -- spec.md §4.2. A single-task cooperative event loop
//! (`tokio::select!` over bus-receive streams and a periodic tick) that
//! owns every other component's state and drives the `Init -> Running ->
//! Draining -> Stopped` process lifecycle. Matches the teacher's pattern of
//! expressing a cooperative poll loop as a `tokio::select!` over an async
//! stream and a timer (`crates/automations/src/server.rs`'s `serve`), on
//! top of the async runtime rather than a literal OS thread.

use crate::bus::Bus;
use crate::config::Config;
use crate::error::Result;
use crate::forwarder::{self, Forwarder};
use crate::intake;
use crate::liveness::{self, LivenessEvent};
use crate::metrics;
use crate::peer::PeerTable;
use futures::StreamExt;
use handoff_store::HintRepository;
use proto_handoff::{
    ArchiveSegmentReply, Envelope, HintedHandoff, OrderedF64, ProcessStatus, ProcessStatusKind,
};
use std::future::Future;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Init,
    Running,
    Draining,
    Stopped,
}

pub struct Dispatcher<B: Bus> {
    bus: B,
    repo: HintRepository,
    config: Config,
    node_name: String,
    reply_topic: String,
    peers: PeerTable,
    forwarder: Forwarder,
    state: ProcessState,
}

impl<B: Bus> Dispatcher<B> {
    pub fn new(bus: B, repo: HintRepository, config: Config, node_name: String) -> Self {
        let reply_topic = format!("handoff_server.reply.{node_name}");
        let forwarder = Forwarder::new(config.clone(), reply_topic.clone());
        Self {
            bus,
            repo,
            config,
            node_name,
            reply_topic,
            peers: PeerTable::new(),
            forwarder,
            state: ProcessState::Init,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    async fn broadcast_status(&self, status: ProcessStatusKind) -> Result<()> {
        let message = ProcessStatus {
            source_topic: self.node_name.clone(),
            routing_header: self.config.data_writer_role.clone(),
            status,
            timestamp: OrderedF64(handoff_store::now_seconds()),
        };
        self.bus
            .publish(ProcessStatus::ROUTING_KEY, Envelope::new(ProcessStatus::ROUTING_KEY, message.encode()))
            .await
            .map_err(|err| crate::error::Error::Send(err.to_string()))
    }

    async fn handle_intake(&mut self, envelope: Envelope) -> Result<()> {
        let request = HintedHandoff::decode(envelope.body)?;
        let reply_topic = request.reply_topic.clone();
        let reply = intake::handle_hinted_handoff(&self.repo, &request);
        self.bus
            .publish(&reply_topic, Envelope::new(reply_topic.clone(), reply.encode()))
            .await
            .map_err(|err| crate::error::Error::Send(err.to_string()))
    }

    async fn handle_status(&mut self, envelope: Envelope) -> Result<()> {
        let status = ProcessStatus::decode(envelope.body)?;
        let event = liveness::handle_process_status(&mut self.peers, &status, &self.config, Instant::now());
        metrics::peers_up_gauge(self.peers.up_peer_count());

        if let LivenessEvent::PeerRecovered(peer) = event {
            self.forwarder.drain_peer(&self.repo, &self.bus, &peer).await?;
        }
        Ok(())
    }

    fn handle_archive_reply(&mut self, envelope: Envelope) -> Result<()> {
        let reply = ArchiveSegmentReply::decode(envelope.body)?;
        self.forwarder.handle_reply(&self.repo, &reply)
    }

    async fn handle_tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let newly_down = self.peers.expire_stale(self.config.dead_after, now);
        for peer in &newly_down {
            tracing::warn!(peer, "dispatcher: peer presumed down after silence, suspending drain");
        }

        self.forwarder.expire_timeouts(&self.repo, now)?;

        let up_peers: Vec<String> = self.peers.up_peers().map(str::to_string).collect();
        for peer in up_peers {
            self.forwarder.drain_peer(&self.repo, &self.bus, &peer).await?;
        }
        metrics::peers_up_gauge(self.peers.up_peer_count());
        Ok(())
    }

    /// Runs the event loop until `shutdown` resolves. On entry, broadcasts
    /// `ProcessStatus{startup}` and runs the startup recovery sweep
    /// (spec.md §4.6); on exit, broadcasts `ProcessStatus{shutdown}` after
    /// at most `config.drain_grace` of continued forwarding with intake
    /// refused (the `Draining` state, spec.md §4.2).
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.state = ProcessState::Running;
        self.broadcast_status(ProcessStatusKind::Startup).await?;

        for peer in forwarder::startup_recovery_sweep(&self.repo, &self.peers)? {
            self.forwarder.drain_peer(&self.repo, &self.bus, &peer).await?;
        }

        let mut intake_stream = self.bus.subscribe(HintedHandoff::ROUTING_KEY);
        let mut status_stream = self.bus.subscribe(ProcessStatus::ROUTING_KEY);
        let mut reply_stream = self.bus.subscribe(&self.reply_topic);
        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut drain_deadline: Option<Instant> = None;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(envelope) = intake_stream.next(), if self.state == ProcessState::Running => {
                    if let Err(err) = self.handle_intake(envelope).await {
                        tracing::error!(?err, "dispatcher: intake handling failed");
                    }
                }
                Some(envelope) = status_stream.next() => {
                    if let Err(err) = self.handle_status(envelope).await {
                        tracing::error!(?err, "dispatcher: status handling failed");
                    }
                }
                Some(envelope) = reply_stream.next() => {
                    if let Err(err) = self.handle_archive_reply(envelope) {
                        tracing::error!(?err, "dispatcher: archive reply handling failed");
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = self.handle_tick().await {
                        tracing::error!(?err, "dispatcher: tick handling failed");
                    }
                    if matches!(drain_deadline, Some(deadline) if Instant::now() >= deadline) {
                        break;
                    }
                }
                () = &mut shutdown, if self.state == ProcessState::Running => {
                    tracing::info!("dispatcher: shutdown signaled, draining outstanding hints");
                    self.state = ProcessState::Draining;
                    drain_deadline = Some(Instant::now() + self.config.drain_grace);
                    if let Err(err) = self.broadcast_status(ProcessStatusKind::Shutdown).await {
                        tracing::error!(?err, "dispatcher: failed to broadcast shutdown status");
                    }
                }
            }
        }

        self.state = ProcessState::Stopped;
        self.repo.close()?;
        Ok(())
    }
}
