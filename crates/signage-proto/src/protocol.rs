use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a control client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Start { channel_id: u32 },
    Stop { channel_id: u32 },
    /// Clear the failure counter of a channel and retry it.
    Reset { channel_id: u32 },
    Status { channel_id: u32 },
    ListLive,
    GetState,
    Reconcile,
}

/// Messages sent from the daemon to control clients (broadcasts and replies)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    Channel {
        status: ChannelStatus,
    },
    Live {
        entries: Vec<PlaylistEntry>,
    },
    Reconcile {
        report: ReconcileReport,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Image,
    Video,
    Streaming,
}

/// Clockwise rotation applied to the encoded picture.  Serialized as degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(format!("unsupported rotation {}° (expected 0, 90, 180 or 270)", other)),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(r: Rotation) -> u16 {
        r.degrees()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Loop,
    #[serde(alias = "play-once")]
    PlayOnce,
    Shuffle,
}

/// Transmission state of a channel as tracked by its supervisor.
///
/// Transitions:
///   Stopped -> Starting -> Live -> Stopped | Failed
///   Failed -> Starting (retry) | Stopped (manual stop)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    #[default]
    Stopped,
    Starting,
    Live,
    Failed,
}

/// One entry of a channel's rotation: a file path or a stream URL.
///
/// Accepts either a bare string or `{ source, duration_secs }` in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "ContentItemRepr")]
pub struct ContentItem {
    pub source: String,
    /// Display duration for still images.  Falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContentItemRepr {
    Bare(String),
    Full {
        source: String,
        #[serde(default)]
        duration_secs: Option<f64>,
    },
}

impl From<ContentItemRepr> for ContentItem {
    fn from(repr: ContentItemRepr) -> Self {
        match repr {
            ContentItemRepr::Bare(source) => ContentItem {
                source,
                duration_secs: None,
            },
            ContentItemRepr::Full {
                source,
                duration_secs,
            } => ContentItem {
                source,
                duration_secs,
            },
        }
    }
}

impl ContentItem {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            duration_secs: None,
        }
    }

    pub fn with_duration(source: impl Into<String>, secs: f64) -> Self {
        Self {
            source: source.into(),
            duration_secs: Some(secs),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }
}

/// Opaque reference to the encoder process currently attached to a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRef {
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub command: String,
}

/// Transient fields the daemon writes back into the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChannelRuntime {
    #[serde(default)]
    pub live_state: LiveState,
    #[serde(default)]
    pub process: Option<ProcessRef>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl ChannelRuntime {
    /// True when the record claims a running encoder (possibly stale).
    pub fn is_active(&self) -> bool {
        self.live_state != LiveState::Stopped || self.process.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub repeat: RepeatMode,
    #[serde(default)]
    pub contents: Vec<ContentItem>,
    /// Desired state: the daemon keeps this channel transmitting.
    #[serde(default)]
    pub should_transmit: bool,
    #[serde(default)]
    pub runtime: ChannelRuntime,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(id: u32, name: impl Into<String>, content_type: ContentType) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            content_type,
            rotation: Rotation::default(),
            repeat: RepeatMode::default(),
            contents: Vec::new(),
            should_transmit: false,
            runtime: ChannelRuntime::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_contents<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contents = sources.into_iter().map(ContentItem::new).collect();
        self
    }

    pub fn with_repeat(mut self, repeat: RepeatMode) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }
}

/// Where a channel's encoder writes its HLS output and where players find it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputTarget {
    pub manifest: PathBuf,
    pub segment_pattern: PathBuf,
    pub url: String,
}

/// Bookkeeping for a channel while its supervisor is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransmissionRecord {
    pub channel_id: u32,
    pub output: OutputTarget,
    pub started_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

/// Point-in-time view of one channel, as reported by the control API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelStatus {
    pub channel_id: u32,
    pub name: String,
    pub state: LiveState,
    pub since: DateTime<Utc>,
    pub failure_count: u32,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub current_item: Option<String>,
    #[serde(default)]
    pub process: Option<ProcessRef>,
    #[serde(default)]
    pub record: Option<TransmissionRecord>,
    /// When the next automatic retry fires (failed channels only).
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ChannelStatus {
    /// Status of a channel that has no supervisor attached.
    pub fn stopped(channel: &Channel) -> Self {
        Self {
            channel_id: channel.id,
            name: channel.name.clone(),
            state: LiveState::Stopped,
            since: channel.runtime.since.unwrap_or(channel.updated_at),
            failure_count: 0,
            restart_count: 0,
            current_item: None,
            process: None,
            record: None,
            retry_at: None,
            last_error: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == LiveState::Live
    }

    pub fn runtime(&self) -> ChannelRuntime {
        ChannelRuntime {
            live_state: self.state,
            process: self.process.clone(),
            failure_count: self.failure_count,
            since: Some(self.since),
        }
    }
}

/// One line pair of the published playlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub channel_id: u32,
    pub name: String,
    pub output_url: String,
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    /// Channels that should transmit but had no supervisor.
    pub recovered: Vec<u32>,
    /// Failed channels reset after the retry window.
    pub reset: Vec<u32>,
    /// Supervised channels that disappeared from the catalog.
    pub stopped: Vec<u32>,
    /// Unsupervised channels whose stale runtime fields were cleared.
    pub cleared: Vec<u32>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty()
            && self.reset.is_empty()
            && self.stopped.is_empty()
            && self.cleared.is_empty()
    }
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    #[serde(default)]
    pub rev: u64,
    pub channels: Vec<ChannelStatus>,
    #[serde(default)]
    pub live: Vec<PlaylistEntry>,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::Command(Command::Start { channel_id: 5 });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Start { channel_id }) => assert_eq!(channel_id, 5),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let encoded = Message::Command(Command::ListLive).encode().unwrap();
        assert!(Message::decode(&encoded[..3]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_hello_encode_decode() {
        let state = DaemonState {
            rev: 42,
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                ..
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_channel_from_catalog_json() {
        let json = r#"{
            "id": 3,
            "name": "Lobby",
            "content_type": "image",
            "rotation": 90,
            "repeat": "play-once",
            "contents": ["a.jpg", { "source": "b.jpg", "duration_secs": 4.5 }]
        }"#;
        let channel: Channel = serde_json::from_str(json).unwrap();
        assert_eq!(channel.rotation, Rotation::Deg90);
        assert_eq!(channel.repeat, RepeatMode::PlayOnce);
        assert_eq!(channel.contents[0], ContentItem::new("a.jpg"));
        assert_eq!(channel.contents[1].duration_secs, Some(4.5));
        assert!(!channel.should_transmit);
        assert_eq!(channel.runtime.live_state, LiveState::Stopped);
    }

    #[test]
    fn test_rotation_rejects_odd_angles() {
        let err = serde_json::from_str::<Rotation>("45").unwrap_err();
        assert!(err.to_string().contains("unsupported rotation"));
        assert_eq!(serde_json::to_string(&Rotation::Deg270).unwrap(), "270");
    }
}
