//! Playlist publisher: keeps the M3U file in step with the live set.
//!
//! The publisher is the only writer of the playlist file.  It follows the
//! supervisor's live-set `watch` channel, waits out the debounce window so a
//! burst of transitions produces a single write, and swaps the new file in
//! with a rename.  The last rendered playlist is shared with the HTTP layer.
use serde::Serialize;
use signage_proto::config::PlaylistConfig;
use signage_proto::playlist::render_m3u;
use signage_proto::protocol::PlaylistEntry;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::PublishError;

#[derive(Debug, Clone, Serialize)]
pub struct PublishedPlaylist {
    pub hash: String,
    pub entries: Vec<PlaylistEntry>,
    #[serde(skip)]
    pub content: String,
}

impl PublishedPlaylist {
    fn render(entries: &[PlaylistEntry], group_title: &str) -> Self {
        let content = render_m3u(entries, group_title);
        Self {
            hash: content_hash(&content),
            entries: entries.to_vec(),
            content,
        }
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Read side of the publisher, cheap to clone.
#[derive(Clone)]
pub struct PlaylistView(Arc<RwLock<PublishedPlaylist>>);

impl PlaylistView {
    pub async fn get(&self) -> PublishedPlaylist {
        self.0.read().await.clone()
    }
}

pub struct PlaylistPublisher {
    path: PathBuf,
    group_title: String,
    debounce: Duration,
    written_hash: Option<String>,
    view: PlaylistView,
}

impl PlaylistPublisher {
    pub fn new(config: &PlaylistConfig) -> Self {
        let initial = PublishedPlaylist::render(&[], &config.group_title);
        Self {
            path: config.path.clone(),
            group_title: config.group_title.clone(),
            debounce: config.debounce(),
            written_hash: None,
            view: PlaylistView(Arc::new(RwLock::new(initial))),
        }
    }

    pub fn view(&self) -> PlaylistView {
        self.view.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render `entries` and replace the playlist file.  Returns `false` when
    /// the file already holds exactly this content.
    pub async fn publish(&mut self, entries: &[PlaylistEntry]) -> Result<bool, PublishError> {
        let playlist = PublishedPlaylist::render(entries, &self.group_title);

        if self.written_hash.as_deref() == Some(playlist.hash.as_str())
            && tokio::fs::try_exists(&self.path).await.unwrap_or(false)
        {
            debug!("playlist unchanged ({}), skipping write", playlist.hash);
            return Ok(false);
        }

        self.write_atomic(&playlist.content)
            .await
            .map_err(|source| PublishError {
                path: self.path.display().to_string(),
                source,
            })?;

        info!(
            "playlist published: {} channel(s) to {}",
            playlist.entries.len(),
            self.path.display()
        );
        self.written_hash = Some(playlist.hash.clone());
        *self.view.0.write().await = playlist;
        Ok(true)
    }

    async fn write_atomic(&self, content: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("m3u.tmp");
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    /// Follow the live set until its sender is dropped, then write the final
    /// state once more and return.
    pub async fn run(mut self, mut live: watch::Receiver<Vec<PlaylistEntry>>) {
        let retry_delay = self.debounce.max(Duration::from_secs(1));

        loop {
            tokio::time::sleep(self.debounce).await;
            let entries = live.borrow_and_update().clone();
            if let Err(e) = self.publish(&entries).await {
                warn!("{} (keeping previous playlist)", e);
                tokio::time::sleep(retry_delay).await;
                if live.has_changed().is_err() {
                    warn!("live set closed with playlist write still failing");
                    break;
                }
                continue;
            }

            if live.changed().await.is_err() {
                let entries = live.borrow().clone();
                if let Err(e) = self.publish(&entries).await {
                    warn!("final {}", e);
                }
                break;
            }
        }

        debug!("playlist publisher stopped");
    }
}
