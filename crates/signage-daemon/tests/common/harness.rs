#![allow(dead_code)]

use async_trait::async_trait;
use signage_daemon::core::{SupervisorHandle, TransmissionSupervisor};
use signage_daemon::encoder::{EncodeJob, EncoderLauncher, EncoderProcess};
use signage_daemon::error::EncoderError;
use signage_daemon::publisher::{PlaylistPublisher, PlaylistView};
use signage_proto::catalog::MemoryCatalog;
use signage_proto::config::Config;
use signage_proto::protocol::{Channel, ChannelStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How the next fake encoder launched for a channel behaves.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Runs until stopped.
    Run,
    /// Exits on its own with `code` after the given time.
    ExitAfter(Duration, i32),
    /// Gone immediately without an exit status.
    Vanish,
    /// Launch reports an error.
    FailLaunch,
    /// Launch blocks for the given time, then runs.
    Hang(Duration),
}

#[derive(Debug, Clone)]
pub struct Launch {
    pub channel_id: u32,
    pub source: String,
    pub pid: u32,
}

#[derive(Default)]
pub struct FakeLauncher {
    scripts: Mutex<HashMap<u32, VecDeque<Behavior>>>,
    defaults: Mutex<HashMap<u32, Behavior>>,
    launches: Mutex<Vec<Launch>>,
    running: Arc<Mutex<HashSet<u32>>>,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    /// Behaviour of every launch for `channel_id` once its script runs out.
    pub fn set_default(&self, channel_id: u32, behavior: Behavior) {
        self.defaults.lock().unwrap().insert(channel_id, behavior);
    }

    /// Behaviours of the next launches for `channel_id`, in order.
    pub fn script(&self, channel_id: u32, behaviors: impl IntoIterator<Item = Behavior>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(channel_id)
            .or_default()
            .extend(behaviors);
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launch_count(&self, channel_id: u32) -> usize {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.channel_id == channel_id)
            .count()
    }

    pub fn sources(&self, channel_id: u32) -> Vec<String> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.channel_id == channel_id)
            .map(|l| l.source.clone())
            .collect()
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.running.lock().unwrap().contains(&pid)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    fn next_behavior(&self, channel_id: u32) -> Behavior {
        if let Some(b) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&channel_id)
            .and_then(VecDeque::pop_front)
        {
            return b;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&channel_id)
            .copied()
            .unwrap_or(Behavior::Run)
    }
}

#[async_trait]
impl EncoderLauncher for FakeLauncher {
    async fn launch(&self, job: &EncodeJob) -> Result<Box<dyn EncoderProcess>, EncoderError> {
        let behavior = match self.next_behavior(job.channel_id) {
            Behavior::FailLaunch => {
                return Err(EncoderError::BinaryMissing("fake-ffmpeg".to_string()))
            }
            Behavior::Hang(d) => {
                tokio::time::sleep(d).await;
                Behavior::Run
            }
            other => other,
        };

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.launches.lock().unwrap().push(Launch {
            channel_id: job.channel_id,
            source: job.item.source.clone(),
            pid,
        });
        self.running.lock().unwrap().insert(pid);

        Ok(Box::new(FakeProcess {
            pid,
            command: format!("fake-ffmpeg -i {} {}", job.item.source, job.output.url),
            started: Instant::now(),
            behavior,
            stopped: None,
            running: Arc::clone(&self.running),
        }))
    }
}

struct FakeProcess {
    pid: u32,
    command: String,
    started: Instant,
    behavior: Behavior,
    stopped: Option<i32>,
    running: Arc<Mutex<HashSet<u32>>>,
}

impl FakeProcess {
    fn natural_exit(&self) -> Option<i32> {
        match self.behavior {
            Behavior::ExitAfter(after, code) if self.started.elapsed() >= after => Some(code),
            _ => None,
        }
    }

    fn reap(&self) {
        self.running.lock().unwrap().remove(&self.pid);
    }
}

#[async_trait]
impl EncoderProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn command_line(&self) -> String {
        self.command.clone()
    }

    fn is_alive(&mut self) -> bool {
        let alive = self.stopped.is_none()
            && match self.behavior {
                Behavior::Vanish => false,
                Behavior::ExitAfter(..) => self.natural_exit().is_none(),
                _ => true,
            };
        if !alive {
            self.reap();
        }
        alive
    }

    fn exit_status(&mut self) -> Option<i32> {
        self.stopped.or_else(|| self.natural_exit())
    }

    async fn stop(&mut self, _grace: Duration) {
        if self.is_alive() {
            self.stopped = Some(143);
        }
        self.reap();
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.reap();
    }
}

// ── harness ──────────────────────────────────────────────────────────────────

/// Timings small enough for tests to observe several transitions.
pub fn fast_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.supervisor.settle_delay_ms = 50;
    config.supervisor.health_interval_ms = 20;
    config.supervisor.stop_grace_ms = 100;
    config.supervisor.launch_timeout_ms = 300;
    config.supervisor.max_retries = 3;
    config.supervisor.backoff_base_ms = 10;
    config.supervisor.backoff_cap_ms = 40;
    config.supervisor.reconcile_interval_secs = 3_600;
    config.supervisor.failed_retry_window_secs = 3_600;
    config.supervisor.image_duration_secs = 0.2;
    config.supervisor.catalog_timeout_ms = 500;
    config.supervisor.request_timeout_ms = 3_000;
    config.encoder.hls_dir = dir.path().join("hls");
    config.encoder.hls_base_url = "http://test.local/hls".to_string();
    config.playlist.path = dir.path().join("channels.m3u");
    config.playlist.debounce_ms = 20;
    config
}

pub struct Harness {
    pub handle: SupervisorHandle,
    pub catalog: Arc<MemoryCatalog>,
    pub launcher: Arc<FakeLauncher>,
    pub playlist: PlaylistView,
    pub config: Config,
    pub dir: TempDir,
    core_task: JoinHandle<()>,
    publisher_task: JoinHandle<()>,
}

impl Harness {
    pub async fn start(channels: Vec<Channel>) -> Self {
        Self::start_with(channels, |_| {}).await
    }

    pub async fn start_with(channels: Vec<Channel>, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(&dir);
        tweak(&mut config);

        let catalog = Arc::new(MemoryCatalog::new());
        for channel in channels {
            catalog.insert(channel).await;
        }
        let launcher = FakeLauncher::new();
        let (broadcast_tx, _) = broadcast::channel(256);

        let (supervisor, handle) = TransmissionSupervisor::new(
            &config,
            catalog.clone(),
            launcher.clone(),
            broadcast_tx,
        );
        let publisher = PlaylistPublisher::new(&config.playlist);
        let playlist = publisher.view();
        let publisher_task = tokio::spawn(publisher.run(supervisor.live_receiver()));
        let core_task = tokio::spawn(supervisor.run());

        Self {
            handle,
            catalog,
            launcher,
            playlist,
            config,
            dir,
            core_task,
            publisher_task,
        }
    }

    /// Poll a channel until `pred` holds or `timeout` elapses.
    pub async fn wait_for(
        &self,
        channel_id: u32,
        timeout: Duration,
        pred: impl Fn(&ChannelStatus) -> bool,
    ) -> ChannelStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.handle.get_status(channel_id).await.unwrap();
            if pred(&status) {
                return status;
            }
            if Instant::now() >= deadline {
                panic!("channel {} never reached expected state: {:?}", channel_id, status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_until(&self, timeout: Duration, what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + timeout;
        while !cond() {
            if Instant::now() >= deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Shut the supervisor down and wait for the final playlist write.  The
    /// scratch directory is handed back so callers can inspect what was left
    /// on disk; it is removed when the returned value drops.
    pub async fn shutdown(self) -> TempDir {
        self.handle.shutdown().await.unwrap();
        self.core_task.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.publisher_task)
            .await
            .unwrap()
            .unwrap();
        self.dir
    }
}
