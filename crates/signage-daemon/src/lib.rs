pub mod channel;
pub mod core;
pub mod encoder;
pub mod error;
pub mod http;
pub mod publisher;
pub mod rotation;
pub mod socket;
pub mod source;

use signage_proto::protocol::{ChannelStatus, PlaylistEntry, ReconcileReport};

/// Fan-out notifications for control-socket clients.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// Daemon state revision changed; clients re-read the snapshot.
    StateUpdated,
    ChannelUpdated(ChannelStatus),
    LiveChanged(Vec<PlaylistEntry>),
    Reconciled(ReconcileReport),
    Log(String),
}
