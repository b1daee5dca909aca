use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub playlist: PlaylistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// JSON channel catalog shared with the web layer.
    #[serde(default = "default_catalog_file")]
    pub catalog_file: PathBuf,
    /// Per-channel encoder logs land here.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// How the encoder is invoked and where its HLS output goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Explicit ffmpeg binary.  When unset the binary is discovered at startup.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default = "default_hls_dir")]
    pub hls_dir: PathBuf,
    /// Public base URL under which `hls_dir` is served (no trailing slash).
    #[serde(default = "default_hls_base_url")]
    pub hls_base_url: String,
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u32,
    #[serde(default = "default_list_size")]
    pub list_size: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default)]
    pub video_bitrate: Option<String>,
    /// Check that stream sources answer before launching the encoder on them.
    #[serde(default = "default_probe_stream_sources")]
    pub probe_stream_sources: bool,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Timing and retry policy of the channel supervisors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Time an encoder gets to produce output before its first liveness probe.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    /// Consecutive failures after which a channel stays failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// How long reconcile leaves an exhausted channel failed before resetting it.
    #[serde(default = "default_failed_retry_window_secs")]
    pub failed_retry_window_secs: u64,
    #[serde(default = "default_image_duration_secs")]
    pub image_duration_secs: f64,
    #[serde(default = "default_catalog_timeout_ms")]
    pub catalog_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistConfig {
    #[serde(default = "default_playlist_path")]
    pub path: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_group_title")]
    pub group_title: String,
}

impl SupervisorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn failed_retry_window(&self) -> Duration {
        Duration::from_secs(self.failed_retry_window_secs)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Upper bound for stopping every channel at daemon exit.
    pub fn shutdown_timeout(&self) -> Duration {
        self.stop_grace() + self.catalog_timeout() + Duration::from_secs(1)
    }

    /// Delay before retry number `failures` (1-based): base doubling per
    /// consecutive failure, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

impl EncoderConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl PlaylistConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            catalog_file: default_catalog_file(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            hls_dir: default_hls_dir(),
            hls_base_url: default_hls_base_url(),
            segment_secs: default_segment_secs(),
            list_size: default_list_size(),
            preset: default_preset(),
            video_bitrate: None,
            probe_stream_sources: default_probe_stream_sources(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            health_interval_ms: default_health_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            launch_timeout_ms: default_launch_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            failed_retry_window_secs: default_failed_retry_window_secs(),
            image_duration_secs: default_image_duration_secs(),
            catalog_timeout_ms: default_catalog_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            path: default_playlist_path(),
            debounce_ms: default_debounce_ms(),
            group_title: default_group_title(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_catalog_file() -> PathBuf {
    platform::data_dir().join("channels.json")
}

fn default_log_dir() -> PathBuf {
    platform::log_dir()
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_hls_dir() -> PathBuf {
    platform::data_dir().join("hls")
}

fn default_hls_base_url() -> String {
    "http://127.0.0.1/hls".to_string()
}

fn default_segment_secs() -> u32 {
    4
}

fn default_list_size() -> u32 {
    6
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_probe_stream_sources() -> bool {
    true
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_settle_delay_ms() -> u64 {
    3_000
}

fn default_health_interval_ms() -> u64 {
    2_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_launch_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_failed_retry_window_secs() -> u64 {
    600
}

fn default_image_duration_secs() -> f64 {
    10.0
}

fn default_catalog_timeout_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_playlist_path() -> PathBuf {
    platform::data_dir().join("channels.m3u")
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_group_title() -> String {
    "Signage".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            tracing::info!("Wrote default config to {:?}", config_path);
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(p) = std::env::var("SIGNAGE_CONFIG") {
            return PathBuf::from(p);
        }
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert!(config.daemon.catalog_file.ends_with("signage/channels.json"));
        assert_eq!(config.supervisor.max_retries, 5);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [supervisor]
            settle_delay_ms = 500
            max_retries = 2

            [playlist]
            group_title = "Lobby"
            "#,
        )
        .unwrap();
        assert_eq!(config.supervisor.settle_delay(), Duration::from_millis(500));
        assert_eq!(config.supervisor.max_retries, 2);
        assert_eq!(config.supervisor.stop_grace_ms, 5_000);
        assert_eq!(config.playlist.group_title, "Lobby");
        assert_eq!(config.playlist.debounce_ms, 250);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let sup = SupervisorConfig {
            backoff_base_ms: 100,
            backoff_cap_ms: 1_000,
            ..SupervisorConfig::default()
        };
        assert_eq!(sup.backoff(1), Duration::from_millis(100));
        assert_eq!(sup.backoff(2), Duration::from_millis(200));
        assert_eq!(sup.backoff(4), Duration::from_millis(800));
        assert_eq!(sup.backoff(5), Duration::from_millis(1_000));
        assert_eq!(sup.backoff(60), Duration::from_millis(1_000));
    }
}
