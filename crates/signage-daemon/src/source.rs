/// Reachability check for stream sources.
///
/// ffmpeg on an unreachable URL hangs in its own reconnect loop until the
/// settle delay fails it; probing first turns that into an immediate launch
/// error with a readable reason.  Only the response head is awaited, the body
/// of a live stream is never read.
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::EncoderError;

pub fn probe_client() -> Client {
    Client::builder()
        // HLS origins and Icecast mounts commonly redirect
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .unwrap_or_else(|e| {
            warn!("source: falling back to default HTTP client: {}", e);
            Client::new()
        })
}

pub async fn probe(client: &Client, url: &str, timeout: Duration) -> Result<(), EncoderError> {
    debug!("source: probing {}", url);
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| {
            EncoderError::SourceUnreachable(format!("{}: no answer within {:?}", url, timeout))
        })?
        .map_err(|e| EncoderError::SourceUnreachable(format!("{}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(EncoderError::SourceUnreachable(format!("{}: HTTP {}", url, status)));
    }
    Ok(())
}
