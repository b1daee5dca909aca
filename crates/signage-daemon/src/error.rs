use signage_proto::catalog::CatalogError;
use std::time::Duration;

/// Why the encoder could not be started for an item.
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder binary not found: {0}")]
    BinaryMissing(String),
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("invalid encoder command: {0}")]
    InvalidCommand(String),
    #[error("stream source unreachable: {0}")]
    SourceUnreachable(String),
    #[error("encoder launch exceeded {0:?}")]
    Timeout(Duration),
}

/// Reason a channel left `starting`/`live` for `failed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureKind {
    #[error("launch error: {0}")]
    Launch(String),
    #[error("encoder not alive after {0:?}")]
    LivenessTimeout(Duration),
    #[error("encoder exited with status {0}")]
    ProcessExit(i32),
}

impl From<EncoderError> for FailureKind {
    fn from(e: EncoderError) -> Self {
        FailureKind::Launch(e.to_string())
    }
}

/// Errors returned by the control API.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("channel {0} not found")]
    NotFound(u32),
    #[error("channel {0} has no content to transmit")]
    ContentSequenceEmpty(u32),
    #[error(transparent)]
    Catalog(CatalogError),
    #[error("transmission supervisor is shutting down")]
    ShuttingDown,
    #[error("control request timed out after {0:?}")]
    Timeout(Duration),
}

impl ControlError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControlError::Catalog(e) => e.is_retryable(),
            ControlError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<CatalogError> for ControlError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(id) => ControlError::NotFound(id),
            other => ControlError::Catalog(other),
        }
    }
}

/// Playlist artifact could not be swapped in.
#[derive(Debug, thiserror::Error)]
#[error("failed to write playlist {path}: {source}")]
pub struct PublishError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}
