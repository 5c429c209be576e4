//! Client sync status.

use serde::{Deserialize, Serialize};

use driftsync_sync::{RemoteConnect, RemoteRead};

/// Progress of the initial local load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalRead {
    Loading,
    Ready,
}

/// State of locally created commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalSave {
    /// Everything created locally has been acknowledged.
    Ready,
    /// Commits are waiting for an ack.
    Saving,
    /// The last save failed. Unacked commits can be retried.
    Error,
}

/// Where a client stands with its local store and the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub local_read: LocalRead,
    pub local_save: LocalSave,
    pub remote_connect: RemoteConnect,
    pub remote_read: RemoteRead,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            local_read: LocalRead::Loading,
            local_save: LocalSave::Ready,
            remote_connect: RemoteConnect::Offline,
            remote_read: RemoteRead::Loading,
        }
    }
}
