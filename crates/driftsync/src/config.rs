//! Client configuration.

use driftsync_sync::{ActorConfig, ActorId};

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Who is editing. Shared by every client of the same user.
    pub user_id: String,
    /// This client instance. Unique per tab, window or process.
    pub client_id: String,
    /// Actor configuration.
    pub actor: ActorConfig,
}

impl ClientConfig {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client_id: client_id.into(),
            actor: ActorConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("anonymous", ActorId::random().to_hex())
    }
}
