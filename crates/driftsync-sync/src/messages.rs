//! Sync event types.
//!
//! [`SyncEvent`] is the vocabulary exchanged between an actor and its
//! client, between sibling actors on the local bus, and with the remote peer.

use serde::{Deserialize, Serialize};
use std::fmt;

use driftsync_core::{AckCommitsEvent, CommitsEvent};

use crate::leader::LeaderMessage;

/// Unique identifier for a local actor on the broadcast bus.
///
/// Ordering decides leader-election ties: the lower id wins.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub [u8; 16]);

impl ActorId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a random actor ID.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..8])
    }
}

/// Message size limits.
pub mod limits {
    /// Max commits in one `commits` event sent to the remote.
    pub const MAX_COMMITS_PER_EVENT: usize = 100;
}

/// A participant in a document session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub user_id: String,
    pub client_id: String,
    /// Opaque awareness state (cursor, selection, ...). Never parsed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<serde_json::Value>,
}

impl ClientInfo {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client_id: client_id.into(),
            presence: None,
        }
    }
}

/// Connection state of the remote link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteConnect {
    Offline,
    Connecting,
    Online,
}

/// Catch-up state of the remote link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteRead {
    Loading,
    Ready,
}

/// Error codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Storage or merge failure.
    Internal,
    /// Broadcast or remote transport failure.
    Network,
    /// The persistence layer is reconnecting. Retry later.
    Unavailable,
    /// The peer sent something it should not have.
    BadRequest,
}

/// Events exchanged between actors, clients and remote peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// A batch of commits.
    Commits(CommitsEvent),
    /// Per-ref results of an `add`.
    Ack(AckCommitsEvent),
    /// The sender finished its initial catch-up.
    Ready,
    ClientJoin {
        info: ClientInfo,
    },
    #[serde(rename_all = "camelCase")]
    ClientLeave {
        user_id: String,
        client_id: String,
    },
    ClientPresence {
        info: ClientInfo,
    },
    RemoteState {
        connect: RemoteConnect,
        read: RemoteRead,
    },
    Error {
        code: ErrorCode,
        message: String,
        fatal: bool,
    },
}

impl SyncEvent {
    /// Build a non-fatal error event.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        SyncEvent::Error {
            code,
            message: message.into(),
            fatal: false,
        }
    }
}

/// Payload of the local broadcast bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusMessage {
    Sync(SyncEvent),
    Leader(LeaderMessage),
}

/// A bus message with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ActorId,
    pub message: BusMessage,
}
