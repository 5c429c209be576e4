//! # driftsync Sync
//!
//! Local coordination and remote replication for driftsync documents.
//!
//! ## Overview
//!
//! Every client instance runs a [`LocalActor`]. Actors that share one local
//! store find each other on a [`Broadcast`] bus, fan out newly stored
//! commits, and elect a single leader. Only the leader opens a
//! [`RemoteConnection`]: it pushes local commits upstream and writes remote
//! commits into the shared store before announcing them locally.
//!
//! ## Key Types
//!
//! - [`SyncEvent`] - Events exchanged with clients, siblings and the remote
//! - [`LocalActor`] / [`ActorHandle`] - Per-client coordinator task
//! - [`LeaderElection`] - Clock-free election state machine
//! - [`Broadcast`], [`RemoteConnector`] - Transport seams
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftsync_store::MemoryDocStore;
//! use driftsync_sync::memory::{MemoryBus, MemoryRemoteServer};
//! use driftsync_sync::{ActorConfig, ActorId, ClientInfo, LocalActor, RemoteConnector};
//!
//! async fn example() {
//!     let server = MemoryRemoteServer::new(MemoryDocStore::new());
//!     let remote: Arc<dyn RemoteConnector> = Arc::new(server);
//!     let bus = MemoryBus::new();
//!
//!     let mut actor = LocalActor::spawn(
//!         MemoryDocStore::new(),
//!         bus.join(ActorId::random()),
//!         Some(remote),
//!         ClientInfo::new("alice", "tab-1"),
//!         ActorConfig::default(),
//!     );
//!
//!     while let Some(event) = actor.next_event().await {
//!         println!("{:?}", event);
//!     }
//!     actor.shutdown().await.unwrap();
//! }
//! ```

pub mod actor;
pub mod error;
pub mod leader;
pub mod messages;
pub mod transport;

pub use actor::{ActorCommand, ActorConfig, ActorHandle, LocalActor};
pub use error::{Result, SyncError};
pub use leader::{LeaderConfig, LeaderElection, LeaderEvent, LeaderMessage};
pub use messages::{
    limits, ActorId, BusMessage, ClientInfo, Envelope, ErrorCode, RemoteConnect, RemoteRead,
    SyncEvent,
};
pub use transport::memory;
pub use transport::{Broadcast, RemoteConnection, RemoteConnector};
