//! Channel catalog: the repository the web layer edits and the daemon reads.
//!
//! The daemon only ever writes the transient fields (`runtime` and
//! `should_transmit`); channel definitions and content lists belong to the
//! web layer.  Nothing here assumes exclusive access to the backing store.
use crate::protocol::{Channel, ChannelRuntime};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("channel {0} not found in catalog")]
    NotFound(u32),
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("catalog did not answer within {0:?}")]
    Timeout(Duration),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl CatalogError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CatalogError::NotFound(_))
    }
}

#[async_trait]
pub trait ChannelCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<Channel>, CatalogError>;

    async fn get(&self, id: u32) -> Result<Channel, CatalogError> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or(CatalogError::NotFound(id))
    }

    async fn write_runtime(&self, id: u32, runtime: &ChannelRuntime) -> Result<(), CatalogError>;

    async fn set_should_transmit(&self, id: u32, value: bool) -> Result<(), CatalogError>;
}

/// Run a catalog call with an upper bound on how long it may take.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, CatalogError>
where
    F: std::future::Future<Output = Result<T, CatalogError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(CatalogError::Timeout(timeout)))
}

// ── JSON file catalog ─────────────────────────────────────────────────────────

/// Catalog stored as a JSON array of channels.  Every call re-reads the file
/// so edits made by the web layer are picked up immediately.
///
/// The channel file belongs to the web layer and is never written here.  The
/// transient fields live in a sidecar (`<name>.runtime.json`) owned by the
/// daemon and are laid over the channel records on every read; a sidecar
/// entry wins over the same fields in the channel file.
pub struct JsonCatalog {
    path: PathBuf,
    runtime_path: PathBuf,
    write_lock: Mutex<()>,
}

/// Daemon-owned fields of one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RuntimeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    should_transmit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runtime: Option<ChannelRuntime>,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            runtime_path: path.with_extension("runtime.json"),
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn runtime_path(&self) -> &Path {
        &self.runtime_path
    }

    async fn read_channels(&self) -> Result<Vec<Channel>, CatalogError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_runtime(&self) -> Result<BTreeMap<u32, RuntimeEntry>, CatalogError> {
        match tokio::fs::read_to_string(&self.runtime_path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => Ok(entries),
                Err(e) => {
                    warn!(
                        "Ignoring unreadable runtime file {:?}: {}",
                        self.runtime_path, e
                    );
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_runtime_file(
        &self,
        entries: &BTreeMap<u32, RuntimeEntry>,
    ) -> Result<(), CatalogError> {
        if let Some(parent) = self.runtime_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.runtime_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.runtime_path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Update one channel's sidecar entry.  Entries of channels that left the
    /// channel file are dropped on the way.
    async fn modify<F>(&self, id: u32, f: F) -> Result<(), CatalogError>
    where
        F: FnOnce(&mut RuntimeEntry) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let ids: BTreeSet<u32> = self.read_channels().await?.iter().map(|c| c.id).collect();
        if !ids.contains(&id) {
            return Err(CatalogError::NotFound(id));
        }
        let mut entries = self.read_runtime().await?;
        entries.retain(|id, _| ids.contains(id));
        f(entries.entry(id).or_default());
        self.write_runtime_file(&entries).await
    }
}

#[async_trait]
impl ChannelCatalog for JsonCatalog {
    async fn list(&self) -> Result<Vec<Channel>, CatalogError> {
        let mut channels = self.read_channels().await?;
        let mut entries = self.read_runtime().await?;
        for channel in &mut channels {
            if let Some(entry) = entries.remove(&channel.id) {
                if let Some(value) = entry.should_transmit {
                    channel.should_transmit = value;
                }
                if let Some(runtime) = entry.runtime {
                    channel.runtime = runtime;
                }
            }
        }
        Ok(channels)
    }

    async fn write_runtime(&self, id: u32, runtime: &ChannelRuntime) -> Result<(), CatalogError> {
        let runtime = runtime.clone();
        self.modify(id, move |e| e.runtime = Some(runtime)).await
    }

    async fn set_should_transmit(&self, id: u32, value: bool) -> Result<(), CatalogError> {
        self.modify(id, move |e| e.should_transmit = Some(value)).await
    }
}

// ── in-memory catalog ─────────────────────────────────────────────────────────

/// Catalog kept in memory.  Used when the daemon is embedded and by tests;
/// `set_available(false)` makes every call fail like an unreachable store.
#[derive(Default)]
pub struct MemoryCatalog {
    channels: RwLock<BTreeMap<u32, Channel>>,
    unavailable: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, channel: Channel) {
        self.channels.write().await.insert(channel.id, channel);
    }

    pub async fn remove(&self, id: u32) -> Option<Channel> {
        self.channels.write().await.remove(&id)
    }

    /// Replace a channel's definition the way the web layer would, keeping
    /// the transient fields the daemon owns.
    pub async fn edit<F>(&self, id: u32, f: F) -> bool
    where
        F: FnOnce(&mut Channel),
    {
        let mut map = self.channels.write().await;
        match map.get_mut(&id) {
            Some(channel) => {
                f(channel);
                channel.updated_at = chrono::Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CatalogError::Unavailable("memory catalog offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChannelCatalog for MemoryCatalog {
    async fn list(&self) -> Result<Vec<Channel>, CatalogError> {
        self.check()?;
        Ok(self.channels.read().await.values().cloned().collect())
    }

    async fn get(&self, id: u32) -> Result<Channel, CatalogError> {
        self.check()?;
        self.channels
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CatalogError::NotFound(id))
    }

    async fn write_runtime(&self, id: u32, runtime: &ChannelRuntime) -> Result<(), CatalogError> {
        self.check()?;
        let mut map = self.channels.write().await;
        let channel = map.get_mut(&id).ok_or(CatalogError::NotFound(id))?;
        channel.runtime = runtime.clone();
        Ok(())
    }

    async fn set_should_transmit(&self, id: u32, value: bool) -> Result<(), CatalogError> {
        self.check()?;
        let mut map = self.channels.write().await;
        let channel = map.get_mut(&id).ok_or(CatalogError::NotFound(id))?;
        channel.should_transmit = value;
        Ok(())
    }
}
