//! ChannelSupervisor: one task per transmitting channel.
//!
//! ```text
//!   stopped ──start──► starting ──settled──► live ──item done──► live
//!                         │                    │
//!                         └──── failure ───► failed ──backoff──► starting
//!                                              │
//!                                              └─ retries exhausted: wait for reset
//! ```
//!
//! The task owns the channel's rotation planner, its encoder process and its
//! status.  Everything else sees the status through a `watch` receiver and
//! `ChannelEvent`s on the supervisor's event channel.  Cancelling the task's
//! token stops the encoder and ends the task.
use chrono::Utc;
use signage_proto::catalog::{self, CatalogError, ChannelCatalog};
use signage_proto::config::{EncoderConfig, SupervisorConfig};
use signage_proto::protocol::{
    Channel, ChannelStatus, ContentItem, ContentType, LiveState, OutputTarget, ProcessRef,
    RepeatMode, TransmissionRecord,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoder::{self, EncodeJob, EncoderLauncher, EncoderProcess};
use crate::error::{ControlError, EncoderError, FailureKind};
use crate::rotation::{RotationPlanner, Step};

pub type StartReply = oneshot::Sender<Result<ChannelStatus, ControlError>>;

#[derive(Debug)]
pub enum ChannelCommand {
    /// Clear the failure counter.  A failed channel relaunches immediately.
    Reset {
        reply: Option<oneshot::Sender<ChannelStatus>>,
    },
}

#[derive(Debug)]
pub enum ChannelEvent {
    StateChanged {
        channel_id: u32,
        generation: u64,
        status: ChannelStatus,
    },
    /// The supervisor task has returned; its encoder is gone.
    Exited { channel_id: u32, generation: u64 },
}

/// Collaborators shared by every channel supervisor.
pub struct ChannelDeps {
    pub catalog: Arc<dyn ChannelCatalog>,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub supervisor: SupervisorConfig,
    pub encoder: EncoderConfig,
}

/// Handles the transmission supervisor keeps for a spawned channel.
pub struct SpawnedChannel {
    pub status: watch::Receiver<ChannelStatus>,
    pub commands: mpsc::Sender<ChannelCommand>,
    pub join: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Nothing scheduled (a launch was interrupted by cancellation).
    Idle,
    Settling {
        deadline: Instant,
    },
    Live {
        next_check: Instant,
        /// Still images move on when their display time is up.
        advance_at: Option<Instant>,
    },
    Retry {
        at: Instant,
    },
    Exhausted,
    Finished,
}

impl Phase {
    fn wake_at(&self) -> Option<Instant> {
        match *self {
            Phase::Settling { deadline } => Some(deadline),
            Phase::Live {
                next_check,
                advance_at,
            } => Some(advance_at.map_or(next_check, |at| at.min(next_check))),
            Phase::Retry { at } => Some(at),
            Phase::Idle | Phase::Exhausted | Phase::Finished => None,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn display_time(item: Option<&ContentItem>, default_secs: f64) -> Duration {
    let fallback = Duration::try_from_secs_f64(default_secs).unwrap_or(Duration::from_secs(10));
    item.and_then(|i| i.duration_secs)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(fallback)
}

pub struct ChannelSupervisor {
    channel: Channel,
    generation: u64,
    deps: Arc<ChannelDeps>,
    planner: RotationPlanner,
    output: OutputTarget,
    status: ChannelStatus,
    status_tx: watch::Sender<ChannelStatus>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    commands: mpsc::Receiver<ChannelCommand>,
    cancel: CancellationToken,
    process: Option<Box<dyn EncoderProcess>>,
    current: Option<ContentItem>,
}

impl ChannelSupervisor {
    /// Spawn the supervisor task.  `start_reply` is answered once the first
    /// launch attempt has settled into `starting`, `failed` or `stopped`.
    pub fn spawn(
        channel: Channel,
        generation: u64,
        deps: Arc<ChannelDeps>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        cancel: CancellationToken,
        start_reply: Option<StartReply>,
    ) -> SpawnedChannel {
        let output = encoder::output_target(&deps.encoder, &channel);
        let now = Utc::now();

        let mut status = ChannelStatus::stopped(&channel);
        status.since = now;
        status.record = Some(TransmissionRecord {
            channel_id: channel.id,
            output: output.clone(),
            started_at: now,
            last_health_check: None,
            restart_count: 0,
        });

        let (status_tx, status_rx) = watch::channel(status.clone());
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let channel_id = channel.id;
        let exit_events = events.clone();

        let supervisor = Self {
            channel,
            generation,
            deps,
            planner: RotationPlanner::new(),
            output,
            status,
            status_tx,
            events,
            commands: commands_rx,
            cancel,
            process: None,
            current: None,
        };

        let join = tokio::spawn(async move {
            supervisor.run(start_reply).await;
            let _ = exit_events.send(ChannelEvent::Exited {
                channel_id,
                generation,
            });
        });

        SpawnedChannel {
            status: status_rx,
            commands: commands_tx,
            join,
        }
    }

    async fn run(mut self, start_reply: Option<StartReply>) {
        info!(
            "channel {}: supervisor started ('{}', {:?}, {} items)",
            self.channel.id,
            self.channel.name,
            self.channel.repeat,
            self.channel.contents.len()
        );

        let mut phase = self.advance(false).await;
        if let Some(reply) = start_reply {
            let _ = reply.send(Ok(self.status.clone()));
        }

        loop {
            if phase == Phase::Finished {
                break;
            }
            let wake = phase.wake_at();
            let cancel = self.cancel.clone();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.stop().await;
                    break;
                }

                cmd = self.commands.recv() => match cmd {
                    Some(ChannelCommand::Reset { reply }) => {
                        phase = self.reset(phase).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(self.status.clone());
                        }
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },

                _ = sleep_until_opt(wake) => {
                    phase = self.on_timer(phase).await;
                }
            }
        }

        debug!("channel {}: supervisor exiting", self.channel.id);
    }

    async fn on_timer(&mut self, phase: Phase) -> Phase {
        match phase {
            Phase::Settling { .. } => self.check_settled().await,
            Phase::Live {
                next_check,
                advance_at,
            } => {
                let now = Instant::now();
                if advance_at.is_some_and(|at| at <= now) {
                    self.complete_item().await
                } else if next_check <= now {
                    self.health_check(advance_at).await
                } else {
                    phase
                }
            }
            Phase::Retry { .. } => {
                self.status.restart_count += 1;
                if let Some(record) = self.status.record.as_mut() {
                    record.restart_count += 1;
                }
                info!(
                    "channel {}: retrying (attempt {})",
                    self.channel.id,
                    self.status.failure_count + 1
                );
                self.relaunch().await
            }
            other => other,
        }
    }

    // ── rotation ─────────────────────────────────────────────────────────────

    async fn advance(&mut self, refresh: bool) -> Phase {
        if refresh {
            self.refresh_channel().await;
        }
        match self.planner.next(&self.channel.contents, self.channel.repeat) {
            Step::Item(item) => self.launch(item).await,
            Step::EndOfSequence => self.end_of_sequence().await,
        }
    }

    /// Launch the current item again, or the next one if the content list no
    /// longer contains it.
    async fn relaunch(&mut self) -> Phase {
        self.refresh_channel().await;
        let item = self
            .current
            .clone()
            .filter(|item| self.channel.contents.contains(item));
        match item {
            Some(item) => self.launch(item).await,
            None => self.advance(false).await,
        }
    }

    async fn refresh_channel(&mut self) {
        let timeout = self.deps.supervisor.catalog_timeout();
        match catalog::bounded(timeout, self.deps.catalog.get(self.channel.id)).await {
            Ok(channel) => {
                self.status.name = channel.name.clone();
                self.channel = channel;
            }
            Err(CatalogError::NotFound(_)) => debug!(
                "channel {}: gone from catalog, keeping cached definition",
                self.channel.id
            ),
            Err(e) => warn!(
                "channel {}: catalog unavailable ({}), keeping cached definition",
                self.channel.id, e
            ),
        }
    }

    async fn complete_item(&mut self) -> Phase {
        self.stop_encoder().await;
        if let Some(item) = &self.current {
            debug!("channel {}: finished '{}'", self.channel.id, item.source);
        }
        self.status.failure_count = 0;
        self.status.last_error = None;
        self.advance(true).await
    }

    async fn end_of_sequence(&mut self) -> Phase {
        self.stop_encoder().await;

        if self.channel.contents.is_empty() {
            warn!("channel {}: content sequence is empty, stopping", self.channel.id);
            self.status.last_error =
                Some(ControlError::ContentSequenceEmpty(self.channel.id).to_string());
        } else if self.channel.repeat == RepeatMode::PlayOnce {
            info!("channel {}: play-once sequence finished", self.channel.id);
            let timeout = self.deps.supervisor.catalog_timeout();
            if let Err(e) = catalog::bounded(
                timeout,
                self.deps.catalog.set_should_transmit(self.channel.id, false),
            )
            .await
            {
                warn!(
                    "channel {}: could not clear should_transmit: {}",
                    self.channel.id, e
                );
            }
        }

        self.status.process = None;
        self.status.current_item = None;
        self.status.retry_at = None;
        self.status.record = None;
        self.set_state(LiveState::Stopped);
        self.commit().await;
        Phase::Finished
    }

    // ── encoder ──────────────────────────────────────────────────────────────

    async fn launch(&mut self, item: ContentItem) -> Phase {
        let job = EncodeJob::new(&self.channel, item.clone(), self.output.clone());
        self.current = Some(item);

        let timeout = self.deps.supervisor.launch_timeout();
        let launcher = Arc::clone(&self.deps.launcher);
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Phase::Idle,
            result = tokio::time::timeout(timeout, launcher.launch(&job)) => result,
        };

        let process = match result {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => return self.fail(e.into()).await,
            Err(_) => return self.fail(EncoderError::Timeout(timeout).into()).await,
        };

        self.status.process = Some(ProcessRef {
            pid: process.pid(),
            started_at: Utc::now(),
            command: process.command_line(),
        });
        self.status.current_item = Some(job.item.source.clone());
        self.status.retry_at = None;
        self.process = Some(process);

        // Moving to the next item keeps a live channel live.
        if self.status.state != LiveState::Live {
            self.set_state(LiveState::Starting);
        }
        self.commit().await;

        Phase::Settling {
            deadline: Instant::now() + self.deps.supervisor.settle_delay(),
        }
    }

    async fn check_settled(&mut self) -> Phase {
        let settle = self.deps.supervisor.settle_delay();
        let Some(process) = self.process.as_mut() else {
            return self.fail(FailureKind::LivenessTimeout(settle)).await;
        };

        if process.is_alive() {
            return self.go_live().await;
        }

        match process.exit_status() {
            // Short clip already done.
            Some(0) => {
                self.go_live().await;
                self.complete_item().await
            }
            Some(code) => self.fail(FailureKind::ProcessExit(code)).await,
            None => self.fail(FailureKind::LivenessTimeout(settle)).await,
        }
    }

    async fn go_live(&mut self) -> Phase {
        if self.status.state != LiveState::Live {
            info!("channel {}: live at {}", self.channel.id, self.output.url);
            self.set_state(LiveState::Live);
            self.commit().await;
        }

        let now = Instant::now();
        let advance_at = (self.channel.content_type == ContentType::Image).then(|| {
            now + display_time(
                self.current.as_ref(),
                self.deps.supervisor.image_duration_secs,
            )
        });
        Phase::Live {
            next_check: now + self.deps.supervisor.health_interval(),
            advance_at,
        }
    }

    async fn health_check(&mut self, advance_at: Option<Instant>) -> Phase {
        let interval = self.deps.supervisor.health_interval();
        if let Some(record) = self.status.record.as_mut() {
            record.last_health_check = Some(Utc::now());
        }

        let alive = self.process.as_mut().is_some_and(|p| p.is_alive());
        if alive {
            self.status_tx.send_replace(self.status.clone());
            return Phase::Live {
                next_check: Instant::now() + interval,
                advance_at,
            };
        }

        match self.process.as_mut().and_then(|p| p.exit_status()) {
            // Natural end of a clip or stream.
            Some(0) => self.complete_item().await,
            Some(code) => self.fail(FailureKind::ProcessExit(code)).await,
            None => self.fail(FailureKind::LivenessTimeout(interval)).await,
        }
    }

    async fn stop_encoder(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.stop(self.deps.supervisor.stop_grace()).await;
        }
    }

    // ── failure policy ───────────────────────────────────────────────────────

    async fn fail(&mut self, kind: FailureKind) -> Phase {
        self.stop_encoder().await;
        self.status.process = None;
        self.status.failure_count += 1;
        self.status.last_error = Some(kind.to_string());
        self.set_state(LiveState::Failed);

        let failures = self.status.failure_count;
        let max = self.deps.supervisor.max_retries;
        let phase = if failures < max {
            let delay = self.deps.supervisor.backoff(failures);
            self.status.retry_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            warn!(
                "channel {}: {} (failure {}/{}), retrying in {:?}",
                self.channel.id, kind, failures, max, delay
            );
            Phase::Retry {
                at: Instant::now() + delay,
            }
        } else {
            self.status.retry_at = None;
            error!(
                "channel {}: {} (failure {}/{}), giving up until reset",
                self.channel.id, kind, failures, max
            );
            Phase::Exhausted
        };

        self.commit().await;
        phase
    }

    async fn reset(&mut self, phase: Phase) -> Phase {
        info!("channel {}: failure counter reset", self.channel.id);
        self.status.failure_count = 0;
        self.status.last_error = None;

        match phase {
            Phase::Retry { .. } | Phase::Exhausted => {
                self.status.retry_at = None;
                self.status.restart_count += 1;
                if let Some(record) = self.status.record.as_mut() {
                    record.restart_count += 1;
                }
                self.relaunch().await
            }
            other => {
                self.commit().await;
                other
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(process) = &self.process {
            info!(
                "channel {}: stopping encoder (pid={:?})",
                self.channel.id,
                process.pid()
            );
        }
        self.stop_encoder().await;
        self.status.process = None;
        self.status.failure_count = 0;
        self.status.retry_at = None;
        self.status.current_item = None;
        self.status.last_error = None;
        self.status.record = None;
        self.set_state(LiveState::Stopped);
        self.commit().await;
    }

    // ── status ───────────────────────────────────────────────────────────────

    fn set_state(&mut self, state: LiveState) {
        self.status.state = state;
        self.status.since = Utc::now();
    }

    /// Publish the status and write the runtime fields back to the catalog.
    async fn commit(&mut self) {
        self.status_tx.send_replace(self.status.clone());
        let _ = self.events.send(ChannelEvent::StateChanged {
            channel_id: self.channel.id,
            generation: self.generation,
            status: self.status.clone(),
        });

        let timeout = self.deps.supervisor.catalog_timeout();
        let runtime = self.status.runtime();
        match catalog::bounded(
            timeout,
            self.deps.catalog.write_runtime(self.channel.id, &runtime),
        )
        .await
        {
            Ok(()) => {}
            Err(CatalogError::NotFound(id)) => {
                debug!("channel {}: not in catalog, runtime not persisted", id)
            }
            Err(e) => warn!(
                "channel {}: failed to persist runtime state: {}",
                self.channel.id, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_time_falls_back_to_default() {
        assert_eq!(display_time(None, 7.5), Duration::from_millis(7_500));
        let item = ContentItem::with_duration("a.jpg", 2.0);
        assert_eq!(display_time(Some(&item), 7.5), Duration::from_secs(2));
        let zero = ContentItem::with_duration("a.jpg", 0.0);
        assert_eq!(display_time(Some(&zero), 7.5), Duration::from_millis(7_500));
        let negative = ContentItem::with_duration("a.jpg", -3.0);
        assert_eq!(display_time(Some(&negative), 7.5), Duration::from_millis(7_500));
    }

    #[tokio::test]
    async fn test_live_phase_wakes_for_earliest_deadline() {
        let now = Instant::now();
        let phase = Phase::Live {
            next_check: now + Duration::from_secs(2),
            advance_at: Some(now + Duration::from_secs(1)),
        };
        assert_eq!(phase.wake_at(), Some(now + Duration::from_secs(1)));
        assert_eq!(Phase::Exhausted.wake_at(), None);
    }
}
