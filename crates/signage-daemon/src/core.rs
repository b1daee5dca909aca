//! TransmissionSupervisor: single-owner event loop for the channel registry.
//!
//! All control requests (HTTP, socket, reconcile ticker) arrive as
//! `ControlRequest`s over an mpsc channel and are answered through oneshot
//! replies.  Channel supervisors report back over a second, unbounded event
//! channel.  The loop owns the registry exclusively and never awaits an
//! encoder: requests that depend on a channel finishing something (start,
//! stop) hand their reply to the channel task or park it until the task
//! exits.
//!
//! After every channel state change the loop bumps the daemon revision,
//! refreshes the `DaemonState` snapshot, and pushes the live set to the
//! playlist publisher when live classification changed.
use chrono::Utc;
use futures_util::future::join_all;
use signage_proto::catalog::{self, CatalogError, ChannelCatalog};
use signage_proto::config::Config;
use signage_proto::protocol::{
    Channel, ChannelRuntime, ChannelStatus, DaemonState, LiveState, PlaylistEntry,
    ReconcileReport,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{
    ChannelCommand, ChannelDeps, ChannelEvent, ChannelSupervisor, SpawnedChannel, StartReply,
};
use crate::encoder::EncoderLauncher;
use crate::error::ControlError;
use crate::BroadcastMessage;

// ── ControlRequest ────────────────────────────────────────────────────────────

/// All inputs into the TransmissionSupervisor loop besides channel events.
#[derive(Debug)]
pub enum ControlRequest {
    Start {
        channel: Channel,
        reply: StartReply,
    },
    /// Replies `None` when the channel has no supervisor.
    Stop {
        channel_id: u32,
        reply: oneshot::Sender<Option<ChannelStatus>>,
    },
    Reset {
        channel_id: u32,
        reply: oneshot::Sender<Option<ChannelStatus>>,
    },
    Status {
        channel_id: u32,
        reply: oneshot::Sender<Option<ChannelStatus>>,
    },
    ListStatus {
        reply: oneshot::Sender<Vec<ChannelStatus>>,
    },
    /// Apply a reconcile pass against a fresh catalog listing.
    Reconcile {
        channels: Vec<Channel>,
        reply: oneshot::Sender<ReconcilePlan>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Result of the in-loop part of a reconcile pass.  Clearing stale runtime
/// fields needs catalog writes, which happen outside the loop.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub report: ReconcileReport,
    pub stale: Vec<u32>,
}

/// Live channels as playlist entries, ordered by channel id.
pub fn live_entries(statuses: &[ChannelStatus]) -> Vec<PlaylistEntry> {
    let mut entries: Vec<PlaylistEntry> = statuses
        .iter()
        .filter(|s| s.is_live())
        .filter_map(|s| {
            s.record.as_ref().map(|record| PlaylistEntry {
                channel_id: s.channel_id,
                name: s.name.clone(),
                output_url: record.output.url.clone(),
            })
        })
        .collect();
    entries.sort_by_key(|e| e.channel_id);
    entries
}

// ── registry ──────────────────────────────────────────────────────────────────

struct ChannelEntry {
    generation: u64,
    status: watch::Receiver<ChannelStatus>,
    commands: mpsc::Sender<ChannelCommand>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stopping: bool,
    stop_waiters: Vec<oneshot::Sender<Option<ChannelStatus>>>,
    /// Start requested while the old supervisor was still stopping.
    queued_start: Option<(Channel, StartReply)>,
}

impl ChannelEntry {
    fn snapshot(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }
}

// ── TransmissionSupervisor ────────────────────────────────────────────────────

pub struct TransmissionSupervisor {
    deps: Arc<ChannelDeps>,
    requests: mpsc::Receiver<ControlRequest>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    channels: BTreeMap<u32, ChannelEntry>,
    next_generation: u64,
    root: CancellationToken,
    shutting_down: bool,
    rev: u64,
    state_tx: watch::Sender<DaemonState>,
    live_tx: watch::Sender<Vec<PlaylistEntry>>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    // Weak so that dropping every handle ends the loop.
    weak_requests: mpsc::WeakSender<ControlRequest>,
    shared: Arc<HandleShared>,
}

impl TransmissionSupervisor {
    pub fn new(
        config: &Config,
        catalog: Arc<dyn ChannelCatalog>,
        launcher: Arc<dyn EncoderLauncher>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> (Self, SupervisorHandle) {
        let (requests_tx, requests_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DaemonState::default());
        let (live_tx, _) = watch::channel(Vec::new());

        let handle = SupervisorHandle {
            requests: requests_tx,
            shared: Arc::new(HandleShared {
                catalog: Arc::clone(&catalog),
                config: config.supervisor.clone(),
                broadcast_tx: broadcast_tx.clone(),
                state: state_rx,
            }),
        };

        let deps = Arc::new(ChannelDeps {
            catalog,
            launcher,
            supervisor: config.supervisor.clone(),
            encoder: config.encoder.clone(),
        });

        let supervisor = Self {
            deps,
            requests: requests_rx,
            events_tx,
            events: events_rx,
            channels: BTreeMap::new(),
            next_generation: 0,
            root: CancellationToken::new(),
            shutting_down: false,
            rev: 0,
            state_tx,
            live_tx,
            broadcast_tx,
            weak_requests: handle.requests.downgrade(),
            shared: Arc::clone(&handle.shared),
        };
        (supervisor, handle)
    }

    /// Live set as seen by the playlist publisher.
    pub fn live_receiver(&self) -> watch::Receiver<Vec<PlaylistEntry>> {
        self.live_tx.subscribe()
    }

    /// Run the loop until `shutdown()` is requested or every handle is gone.
    pub async fn run(mut self) {
        info!("TransmissionSupervisor: starting event loop");
        let ticker = self.spawn_reconcile_ticker();

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(ControlRequest::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        info!("TransmissionSupervisor: all handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }

        ticker.abort();
        info!("TransmissionSupervisor: event loop finished");
    }

    fn spawn_reconcile_ticker(&self) -> JoinHandle<()> {
        let requests = self.weak_requests.clone();
        let shared = Arc::clone(&self.shared);
        let interval = self.deps.supervisor.reconcile_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(requests) = requests.upgrade() else {
                    break;
                };
                let handle = SupervisorHandle {
                    requests,
                    shared: Arc::clone(&shared),
                };
                match handle.reconcile().await {
                    Ok(_) => {}
                    Err(ControlError::ShuttingDown) => break,
                    Err(e) => warn!("reconcile: {}", e),
                }
            }
        })
    }

    // ── requests ─────────────────────────────────────────────────────────────

    fn handle_request(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Start { channel, reply } => self.start(channel, reply),
            ControlRequest::Stop { channel_id, reply } => self.stop(channel_id, reply),
            ControlRequest::Reset { channel_id, reply } => match self.channels.get(&channel_id) {
                Some(entry) if !entry.stopping => {
                    let command = ChannelCommand::Reset {
                        reply: Some(forward_status(reply)),
                    };
                    if let Err(e) = entry.commands.try_send(command) {
                        warn!("channel {}: reset not delivered: {}", channel_id, e);
                    }
                }
                Some(entry) => {
                    let _ = reply.send(Some(entry.snapshot()));
                }
                None => {
                    let _ = reply.send(None);
                }
            },
            ControlRequest::Status { channel_id, reply } => {
                let _ = reply.send(self.channels.get(&channel_id).map(ChannelEntry::snapshot));
            }
            ControlRequest::ListStatus { reply } => {
                let _ = reply.send(self.statuses());
            }
            ControlRequest::Reconcile { channels, reply } => {
                let _ = reply.send(self.plan_reconcile(channels));
            }
            // Handled in `run`.
            ControlRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, channel: Channel, reply: StartReply) {
        if self.shutting_down {
            let _ = reply.send(Err(ControlError::ShuttingDown));
            return;
        }

        match self.channels.get_mut(&channel.id) {
            Some(entry) if entry.stopping => {
                debug!("channel {}: start queued behind stop", channel.id);
                if let Some((_, previous)) = entry.queued_start.take() {
                    let _ = previous.send(Ok(entry.snapshot()));
                }
                entry.queued_start = Some((channel, reply));
            }
            Some(entry) => {
                debug!("channel {}: already supervised", channel.id);
                let _ = reply.send(Ok(entry.snapshot()));
            }
            None => self.spawn_channel(channel, Some(reply)),
        }
    }

    fn stop(&mut self, channel_id: u32, reply: oneshot::Sender<Option<ChannelStatus>>) {
        let Some(entry) = self.channels.get_mut(&channel_id) else {
            let _ = reply.send(None);
            return;
        };

        // A later stop overrides an earlier queued start.
        if let Some((_, queued)) = entry.queued_start.take() {
            let _ = queued.send(Ok(entry.snapshot()));
        }
        entry.stop_waiters.push(reply);
        if !entry.stopping {
            info!("channel {}: stop requested", channel_id);
            entry.stopping = true;
            entry.cancel.cancel();
        }
    }

    fn spawn_channel(&mut self, channel: Channel, reply: Option<StartReply>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let channel_id = channel.id;
        let cancel = self.root.child_token();

        let SpawnedChannel {
            status,
            commands,
            join,
        } = ChannelSupervisor::spawn(
            channel,
            generation,
            Arc::clone(&self.deps),
            self.events_tx.clone(),
            cancel.clone(),
            reply,
        );

        self.channels.insert(
            channel_id,
            ChannelEntry {
                generation,
                status,
                commands,
                cancel,
                join,
                stopping: false,
                stop_waiters: Vec::new(),
                queued_start: None,
            },
        );
    }

    fn plan_reconcile(&mut self, channels: Vec<Channel>) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();
        let window = self.deps.supervisor.failed_retry_window();
        let now = Utc::now();
        let listed: BTreeSet<u32> = channels.iter().map(|c| c.id).collect();

        for channel in channels {
            if let Some(entry) = self.channels.get(&channel.id) {
                let status = entry.snapshot();
                let exhausted = status.state == LiveState::Failed && status.retry_at.is_none();
                let failed_for = (now - status.since).to_std().unwrap_or_default();
                if exhausted && !entry.stopping && failed_for >= window {
                    info!(
                        "reconcile: channel {} failed for {:?}, resetting",
                        channel.id, failed_for
                    );
                    if entry
                        .commands
                        .try_send(ChannelCommand::Reset { reply: None })
                        .is_ok()
                    {
                        plan.report.reset.push(channel.id);
                    }
                }
                continue;
            }

            if channel.should_transmit && !channel.contents.is_empty() && !self.shutting_down {
                info!("reconcile: recovering channel {}", channel.id);
                plan.report.recovered.push(channel.id);
                self.spawn_channel(channel, None);
            } else if channel.runtime.is_active() {
                plan.stale.push(channel.id);
            }
        }

        for (id, entry) in self.channels.iter_mut() {
            if !listed.contains(id) && !entry.stopping {
                info!("reconcile: channel {} left the catalog, stopping", id);
                entry.stopping = true;
                entry.cancel.cancel();
                plan.report.stopped.push(*id);
            }
        }

        plan
    }

    // ── channel events ───────────────────────────────────────────────────────

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged {
                channel_id,
                generation,
                status,
            } => {
                if self.channels.get(&channel_id).map(|e| e.generation) != Some(generation) {
                    return;
                }
                debug!("channel {}: now {:?}", channel_id, status.state);
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::ChannelUpdated(status));
                self.state_changed();
            }
            ChannelEvent::Exited {
                channel_id,
                generation,
            } => {
                let current = self.channels.get(&channel_id).map(|e| e.generation);
                if current != Some(generation) {
                    return;
                }
                let Some(entry) = self.channels.remove(&channel_id) else {
                    return;
                };
                let last = entry.snapshot();
                debug!("channel {}: supervisor exited", channel_id);
                for waiter in entry.stop_waiters {
                    let _ = waiter.send(Some(last.clone()));
                }
                if let Some((channel, reply)) = entry.queued_start {
                    if self.shutting_down {
                        let _ = reply.send(Err(ControlError::ShuttingDown));
                    } else {
                        self.spawn_channel(channel, Some(reply));
                    }
                }
                self.state_changed();
            }
        }
    }

    fn statuses(&self) -> Vec<ChannelStatus> {
        self.channels.values().map(ChannelEntry::snapshot).collect()
    }

    fn state_changed(&mut self) {
        self.rev += 1;
        let channels = self.statuses();
        let live = live_entries(&channels);

        let live_changed = self.live_tx.send_if_modified(|current| {
            if *current == live {
                false
            } else {
                *current = live.clone();
                true
            }
        });
        if live_changed {
            info!("live set now {} channel(s)", live.len());
            let _ = self
                .broadcast_tx
                .send(BroadcastMessage::LiveChanged(live.clone()));
        }

        self.state_tx.send_replace(DaemonState {
            rev: self.rev,
            channels,
            live,
        });
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    // ── shutdown ─────────────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        info!(
            "TransmissionSupervisor: shutting down {} channel(s)",
            self.channels.len()
        );
        self.shutting_down = true;
        self.root.cancel();

        let timeout = self.deps.supervisor.shutdown_timeout();
        let joins = self.channels.values_mut().map(|e| &mut e.join);
        if tokio::time::timeout(timeout, join_all(joins)).await.is_err() {
            error!(
                "TransmissionSupervisor: channels still running after {:?}, aborting",
                timeout
            );
            for entry in self.channels.values() {
                entry.join.abort();
            }
        }

        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }

        // Anything left was aborted.
        for (_, entry) in std::mem::take(&mut self.channels) {
            let last = entry.snapshot();
            for waiter in entry.stop_waiters {
                let _ = waiter.send(Some(last.clone()));
            }
            if let Some((_, reply)) = entry.queued_start {
                let _ = reply.send(Err(ControlError::ShuttingDown));
            }
        }
        self.state_changed();
    }
}

/// Adapt a channel's plain status reply to the loop's optional reply.
fn forward_status(
    reply: oneshot::Sender<Option<ChannelStatus>>,
) -> oneshot::Sender<ChannelStatus> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok(status) = rx.await {
            let _ = reply.send(Some(status));
        }
    });
    tx
}

// ── SupervisorHandle ──────────────────────────────────────────────────────────

struct HandleShared {
    catalog: Arc<dyn ChannelCatalog>,
    config: signage_proto::config::SupervisorConfig,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    state: watch::Receiver<DaemonState>,
}

/// Cloneable control API of the transmission supervisor.  Catalog access
/// happens here, on the caller's task, so a slow catalog never stalls the
/// event loop.
#[derive(Clone)]
pub struct SupervisorHandle {
    requests: mpsc::Sender<ControlRequest>,
    shared: Arc<HandleShared>,
}

impl SupervisorHandle {
    /// Latest daemon state snapshot.
    pub fn state(&self) -> DaemonState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.shared.broadcast_tx.subscribe()
    }

    pub async fn request_start(&self, channel_id: u32) -> Result<ChannelStatus, ControlError> {
        let channel = self.catalog(self.shared.catalog.get(channel_id)).await?;
        if channel.contents.is_empty() {
            return Err(ControlError::ContentSequenceEmpty(channel_id));
        }
        self.catalog(self.shared.catalog.set_should_transmit(channel_id, true))
            .await?;

        info!("control: start channel {}", channel_id);
        self.request(|reply| ControlRequest::Start { channel, reply })
            .await?
    }

    /// Completes once the channel's encoder is gone.
    pub async fn request_stop(&self, channel_id: u32) -> Result<ChannelStatus, ControlError> {
        let channel = match self.catalog(self.shared.catalog.get(channel_id)).await {
            Ok(channel) => Some(channel),
            // The channel may have been deleted while still transmitting.
            Err(CatalogError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        if channel.is_some() {
            self.catalog(self.shared.catalog.set_should_transmit(channel_id, false))
                .await?;
        }

        info!("control: stop channel {}", channel_id);
        let stopped = self
            .request(|reply| ControlRequest::Stop { channel_id, reply })
            .await?;
        match (stopped, channel) {
            (Some(status), _) => Ok(status),
            (None, Some(channel)) => {
                self.clear_stale_runtime(&channel).await;
                Ok(ChannelStatus::stopped(&channel))
            }
            (None, None) => Err(ControlError::NotFound(channel_id)),
        }
    }

    pub async fn request_reset(&self, channel_id: u32) -> Result<ChannelStatus, ControlError> {
        info!("control: reset channel {}", channel_id);
        let status = self
            .request(|reply| ControlRequest::Reset { channel_id, reply })
            .await?;
        match status {
            Some(status) => Ok(status),
            None => self.unsupervised_status(channel_id).await,
        }
    }

    pub async fn get_status(&self, channel_id: u32) -> Result<ChannelStatus, ControlError> {
        let status = self
            .request(|reply| ControlRequest::Status { channel_id, reply })
            .await?;
        match status {
            Some(status) => Ok(status),
            None => self.unsupervised_status(channel_id).await,
        }
    }

    /// Statuses of every supervised channel, ordered by id.
    pub async fn list_status(&self) -> Result<Vec<ChannelStatus>, ControlError> {
        self.request(|reply| ControlRequest::ListStatus { reply })
            .await
    }

    pub async fn list_live(&self) -> Result<Vec<PlaylistEntry>, ControlError> {
        Ok(live_entries(&self.list_status().await?))
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, ControlError> {
        let channels = self.catalog(self.shared.catalog.list()).await?;
        let ReconcilePlan { mut report, stale } = self
            .request(|reply| ControlRequest::Reconcile { channels, reply })
            .await?;

        for channel_id in stale {
            let runtime = ChannelRuntime {
                since: Some(Utc::now()),
                ..ChannelRuntime::default()
            };
            match self
                .catalog(self.shared.catalog.write_runtime(channel_id, &runtime))
                .await
            {
                Ok(()) => report.cleared.push(channel_id),
                Err(e) => warn!(
                    "reconcile: could not clear stale runtime of channel {}: {}",
                    channel_id, e
                ),
            }
        }

        if !report.is_empty() {
            info!("reconcile: {:?}", report);
            let _ = self
                .shared
                .broadcast_tx
                .send(BroadcastMessage::Reconciled(report.clone()));
        }
        Ok(report)
    }

    /// Stop every channel and end the event loop.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(ControlRequest::Shutdown { reply: tx })
            .await
            .map_err(|_| ControlError::ShuttingDown)?;
        let timeout = self.shared.config.shutdown_timeout() + Duration::from_secs(1);
        tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| ControlError::Timeout(timeout))?
            .map_err(|_| ControlError::ShuttingDown)
    }

    async fn unsupervised_status(&self, channel_id: u32) -> Result<ChannelStatus, ControlError> {
        let channel = self.catalog(self.shared.catalog.get(channel_id)).await?;
        Ok(ChannelStatus::stopped(&channel))
    }

    async fn clear_stale_runtime(&self, channel: &Channel) {
        if !channel.runtime.is_active() {
            return;
        }
        let runtime = ChannelRuntime {
            since: Some(Utc::now()),
            ..ChannelRuntime::default()
        };
        if let Err(e) = self
            .catalog(self.shared.catalog.write_runtime(channel.id, &runtime))
            .await
        {
            warn!(
                "channel {}: could not clear stale runtime: {}",
                channel.id, e
            );
        }
    }

    async fn catalog<T, F>(&self, call: F) -> Result<T, CatalogError>
    where
        F: std::future::Future<Output = Result<T, CatalogError>>,
    {
        catalog::bounded(self.shared.config.catalog_timeout(), call).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        let timeout = self.shared.config.request_timeout();
        let exchange = async {
            self.requests
                .send(build(tx))
                .await
                .map_err(|_| ControlError::ShuttingDown)?;
            rx.await.map_err(|_| ControlError::ShuttingDown)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ControlError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signage_proto::protocol::{OutputTarget, TransmissionRecord};
    use std::path::PathBuf;

    fn status(id: u32, state: LiveState) -> ChannelStatus {
        let channel = Channel::new(id, format!("ch{}", id), Default::default());
        let mut status = ChannelStatus::stopped(&channel);
        status.state = state;
        status.record = Some(TransmissionRecord {
            channel_id: id,
            output: OutputTarget {
                manifest: PathBuf::from(format!("/hls/ch{}.m3u8", id)),
                segment_pattern: PathBuf::from(format!("/hls/ch{}_%05d.ts", id)),
                url: format!("http://h/hls/ch{}.m3u8", id),
            },
            started_at: Utc::now(),
            last_health_check: None,
            restart_count: 0,
        });
        status
    }

    #[test]
    fn test_live_entries_only_live_ordered_by_id() {
        let statuses = vec![
            status(9, LiveState::Live),
            status(2, LiveState::Starting),
            status(4, LiveState::Live),
            status(5, LiveState::Failed),
        ];
        let live = live_entries(&statuses);
        let ids: Vec<u32> = live.iter().map(|e| e.channel_id).collect();
        assert_eq!(ids, [4, 9]);
        assert_eq!(live[0].output_url, "http://h/hls/ch4.m3u8");
        assert_eq!(live[1].name, "ch9");
    }
}
