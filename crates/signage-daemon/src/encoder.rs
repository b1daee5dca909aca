/// Encoder process handle.
///
/// Architecture:
///
/// ```text
///   ChannelSupervisor
///         │  launch(EncodeJob)
///         ▼
///   EncoderLauncher ──► FfmpegLauncher: builds the ffmpeg command line,
///         │                             probes stream sources, spawns
///         ▼
///   EncoderProcess  ──► ChildProcess:   is_alive / exit_status (non-blocking)
///                                       stop(grace) = SIGTERM, wait, SIGKILL
/// ```
///
/// One encoder invocation transmits exactly one content item; the supervisor
/// launches a fresh process for every rotation step.
use async_trait::async_trait;
use signage_proto::config::EncoderConfig;
use signage_proto::platform;
use signage_proto::protocol::{Channel, ContentItem, ContentType, OutputTarget, Rotation};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::error::EncoderError;
use crate::source;

/// Everything needed to transmit one content item of a channel.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub channel_id: u32,
    pub content_type: ContentType,
    pub rotation: Rotation,
    pub item: ContentItem,
    pub output: OutputTarget,
}

impl EncodeJob {
    pub fn new(channel: &Channel, item: ContentItem, output: OutputTarget) -> Self {
        Self {
            channel_id: channel.id,
            content_type: channel.content_type,
            rotation: channel.rotation,
            item,
            output,
        }
    }
}

/// A fully resolved command line.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Encoder stderr is appended here when set.
    pub log_path: Option<PathBuf>,
}

impl EncoderCommand {
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(' ') {
                out.push_str(&format!("\"{}\"", arg));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

// ── capability traits ─────────────────────────────────────────────────────────

#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    /// Start an encoder for `job`.  Launch failures are reported here, never
    /// deferred to the first liveness probe.
    async fn launch(&self, job: &EncodeJob) -> Result<Box<dyn EncoderProcess>, EncoderError>;
}

#[async_trait]
pub trait EncoderProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn command_line(&self) -> String;

    /// Non-blocking existence probe.
    fn is_alive(&mut self) -> bool;

    /// Exit code once the process is gone, `None` while it runs.
    fn exit_status(&mut self) -> Option<i32>;

    /// Ask the process to terminate, wait up to `grace`, then kill it.
    async fn stop(&mut self, grace: Duration);
}

// ── child process ─────────────────────────────────────────────────────────────

/// An OS process spawned from an [`EncoderCommand`].
///
/// The child is killed if the handle is dropped without `stop()`.
pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    command: String,
    status: Option<i32>,
}

pub fn spawn_command(command: &EncoderCommand) -> Result<ChildProcess, EncoderError> {
    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);

    let stderr = match &command.log_path {
        Some(path) => match open_log(path, &command.display()) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!("encoder: cannot open log {}: {}", path.display(), e);
                Stdio::null()
            }
        },
        None => Stdio::null(),
    };
    cmd.stderr(stderr);

    // Own process group: terminal signals aimed at the daemon do not reach
    // the encoder, the supervisor decides when it stops.
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EncoderError::BinaryMissing(command.program.display().to_string())
        } else {
            EncoderError::Spawn(e)
        }
    })?;
    let pid = child.id();
    debug!("encoder: spawned pid={:?} cmd={}", pid, command.display());

    Ok(ChildProcess {
        child,
        pid,
        command: command.display(),
        status: None,
    })
}

fn open_log(path: &Path, command_line: &str) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(
        file,
        "\n=== {} {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        command_line
    )?;
    Ok(file)
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

#[cfg(unix)]
fn request_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_terminate(_pid: u32) {}

#[async_trait]
impl EncoderProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn command_line(&self) -> String {
        self.command.clone()
    }

    fn is_alive(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(exit_code(status));
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("encoder: try_wait failed for pid={:?}: {}", self.pid, e);
                false
            }
        }
    }

    fn exit_status(&mut self) -> Option<i32> {
        self.is_alive();
        self.status
    }

    async fn stop(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        if let Some(pid) = self.pid {
            request_terminate(pid);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.status = Some(exit_code(status));
                debug!("encoder: pid={:?} exited after terminate", self.pid);
                return;
            }
            Ok(Err(e)) => warn!("encoder: wait failed for pid={:?}: {}", self.pid, e),
            Err(_) => warn!(
                "encoder: pid={:?} still running after {:?}, killing",
                self.pid, grace
            ),
        }

        if let Err(e) = self.child.kill().await {
            warn!("encoder: kill failed for pid={:?}: {}", self.pid, e);
        }
        self.is_alive();
    }
}

// ── ffmpeg ────────────────────────────────────────────────────────────────────

/// Where a channel's HLS output lives.  The stem combines the channel name
/// with its id so renamed or same-named channels never share files.
pub fn output_target(config: &EncoderConfig, channel: &Channel) -> OutputTarget {
    let slug = platform::slugify(&channel.name);
    let stem = if slug.is_empty() {
        format!("channel-{}", channel.id)
    } else {
        format!("{}-{}", slug, channel.id)
    };
    OutputTarget {
        manifest: config.hls_dir.join(format!("{}.m3u8", stem)),
        segment_pattern: config.hls_dir.join(format!("{}_%05d.ts", stem)),
        url: format!(
            "{}/{}.m3u8",
            config.hls_base_url.trim_end_matches('/'),
            stem
        ),
    }
}

fn rotation_filter(rotation: Rotation) -> Option<&'static str> {
    match rotation {
        Rotation::Deg0 => None,
        Rotation::Deg90 => Some("transpose=1"),
        Rotation::Deg180 => Some("transpose=2,transpose=2"),
        Rotation::Deg270 => Some("transpose=2"),
    }
}

const FRAME_RATE: u32 = 25;

/// ffmpeg arguments that transmit `job` as HLS.
pub fn ffmpeg_args(job: &EncodeJob, config: &EncoderConfig) -> Vec<String> {
    let mut args: Vec<String> = ["-nostdin", "-hide_banner", "-loglevel", "warning", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    let still = job.content_type == ContentType::Image;
    let source = job.item.source.as_str();
    let framerate = FRAME_RATE.to_string();

    if still {
        push(&["-re", "-loop", "1", "-framerate", &framerate, "-i", source]);
        // Players expect an audio track; stills get silence.
        push(&[
            "-f",
            "lavfi",
            "-i",
            "anullsrc=channel_layout=stereo:sample_rate=44100",
            "-map",
            "0:v:0",
            "-map",
            "1:a:0",
        ]);
    } else if job.item.is_remote() {
        push(&[
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_delay_max",
            "5",
        ]);
        if job.content_type == ContentType::Video {
            push(&["-re"]);
        }
        push(&["-i", source]);
    } else {
        push(&["-re", "-i", source]);
    }

    if let Some(filter) = rotation_filter(job.rotation) {
        push(&["-vf", filter]);
    }

    let gop = (config.segment_secs.max(1) * FRAME_RATE).to_string();
    push(&[
        "-c:v",
        "libx264",
        "-preset",
        &config.preset,
        "-tune",
        "zerolatency",
        "-pix_fmt",
        "yuv420p",
        "-g",
        &gop,
    ]);
    if let Some(bitrate) = &config.video_bitrate {
        push(&["-b:v", bitrate]);
    }
    push(&["-c:a", "aac", "-ar", "44100", "-b:a", "128k", "-ac", "2"]);

    let hls_time = config.segment_secs.max(1).to_string();
    let list_size = config.list_size.to_string();
    let segments = job.output.segment_pattern.display().to_string();
    let manifest = job.output.manifest.display().to_string();
    push(&[
        "-f",
        "hls",
        "-hls_time",
        &hls_time,
        "-hls_list_size",
        &list_size,
        "-hls_flags",
        "delete_segments+append_list+omit_endlist+discont_start",
        "-hls_segment_filename",
        &segments,
        &manifest,
    ]);
    args
}

pub struct FfmpegLauncher {
    binary: Option<PathBuf>,
    config: EncoderConfig,
    log_dir: Option<PathBuf>,
    client: reqwest::Client,
}

impl FfmpegLauncher {
    pub fn new(config: EncoderConfig, log_dir: Option<PathBuf>) -> Self {
        let binary = config
            .ffmpeg_path
            .clone()
            .or_else(platform::find_ffmpeg_binary);
        match &binary {
            Some(path) => info!("encoder: using ffmpeg at {}", path.display()),
            None => warn!("encoder: ffmpeg not found; channels will fail to launch"),
        }
        Self {
            binary,
            config,
            log_dir,
            client: source::probe_client(),
        }
    }

    pub fn command_for(&self, job: &EncodeJob) -> Result<EncoderCommand, EncoderError> {
        let program = self
            .binary
            .clone()
            .ok_or_else(|| EncoderError::BinaryMissing("ffmpeg".to_string()))?;

        let source = job.item.source.trim();
        if source.is_empty() {
            return Err(EncoderError::InvalidCommand("empty content source".to_string()));
        }
        if !job.item.is_remote() && !Path::new(source).exists() {
            return Err(EncoderError::InvalidCommand(format!(
                "input does not exist: {}",
                source
            )));
        }

        Ok(EncoderCommand {
            program,
            args: ffmpeg_args(job, &self.config),
            log_path: self
                .log_dir
                .as_ref()
                .map(|dir| dir.join(format!("encoder_{}.log", job.channel_id))),
        })
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(&self, job: &EncodeJob) -> Result<Box<dyn EncoderProcess>, EncoderError> {
        let command = self.command_for(job)?;

        if job.item.is_remote() && self.config.probe_stream_sources {
            source::probe(&self.client, &job.item.source, self.config.probe_timeout()).await?;
        }

        if let Some(dir) = job.output.manifest.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let process = spawn_command(&command)?;
        info!(
            "encoder: channel {} transmitting '{}' (pid={:?})",
            job.channel_id,
            job.item.source,
            process.pid()
        );
        Ok(Box::new(process))
    }
}
