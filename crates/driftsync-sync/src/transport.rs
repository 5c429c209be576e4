//! Transport abstractions for the local bus and the remote link.
//!
//! The local bus connects actors sharing one store (tabs, windows,
//! processes). The remote link connects the elected leader to the server
//! that orders commits across devices. Implementations may use OS
//! broadcast channels, WebSockets, or anything else that delivers messages
//! in order.

use async_trait::async_trait;

use driftsync_core::SyncId;

use crate::error::Result;
use crate::messages::{ActorId, BusMessage, Envelope, SyncEvent};

/// Fan-out channel between local actors.
///
/// A posted message reaches every other participant, never the poster.
#[async_trait]
pub trait Broadcast: Send + Sync {
    /// Get the local actor's identity.
    fn local_actor_id(&self) -> ActorId;

    /// Post a message to every other participant.
    async fn post(&self, message: BusMessage) -> Result<()>;

    /// Receive the next message from any participant.
    async fn recv(&self) -> Result<Envelope>;

    /// Stop receiving. Later `recv` calls fail with `ConnectionClosed`;
    /// `post` keeps working so a departing actor can still hand off.
    async fn close(&self);
}

/// Opens links to the remote peer.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect, asking for every commit after `last_sync_id`.
    async fn connect(&self, last_sync_id: Option<SyncId>) -> Result<Box<dyn RemoteConnection>>;
}

/// One open link to the remote peer.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn send(&self, event: SyncEvent) -> Result<()>;

    /// Receive the next event. `None` means the link dropped.
    async fn recv(&self) -> Option<SyncEvent>;

    async fn close(&self);
}

/// In-memory transports for testing.
///
/// Uses channels to simulate actors and a remote server in one process.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};
    use tokio::sync::{mpsc, Mutex};

    use driftsync_core::CommitsEvent;
    use driftsync_store::DocStore;

    use crate::error::SyncError;
    use crate::messages::ErrorCode;

    const BUS_CAPACITY: usize = 1000;

    /// Shared state for one local bus.
    pub struct MemoryBus {
        senders: RwLock<HashMap<ActorId, mpsc::Sender<Envelope>>>,
    }

    impl MemoryBus {
        /// Create a new memory bus.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create an endpoint attached to this bus.
        pub fn join(self: &Arc<Self>, actor_id: ActorId) -> MemoryBusEndpoint {
            let (tx, rx) = mpsc::channel(BUS_CAPACITY);
            if let Ok(mut senders) = self.senders.write() {
                senders.insert(actor_id, tx);
            }
            MemoryBusEndpoint {
                actor_id,
                bus: Arc::clone(self),
                receiver: Mutex::new(rx),
            }
        }

        /// Number of attached endpoints.
        pub fn len(&self) -> usize {
            self.senders.read().map(|s| s.len()).unwrap_or(0)
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl Default for MemoryBus {
        fn default() -> Self {
            Self {
                senders: RwLock::new(HashMap::new()),
            }
        }
    }

    /// One actor's endpoint on a [`MemoryBus`].
    pub struct MemoryBusEndpoint {
        actor_id: ActorId,
        bus: Arc<MemoryBus>,
        receiver: Mutex<mpsc::Receiver<Envelope>>,
    }

    #[async_trait]
    impl Broadcast for MemoryBusEndpoint {
        fn local_actor_id(&self) -> ActorId {
            self.actor_id
        }

        async fn post(&self, message: BusMessage) -> Result<()> {
            // Clone out so the lock is not held across a full channel.
            let peers: Vec<(ActorId, mpsc::Sender<Envelope>)> = self
                .bus
                .senders
                .read()
                .map_err(|_| SyncError::Transport("bus lock poisoned".into()))?
                .iter()
                .filter(|(peer, _)| **peer != self.actor_id)
                .map(|(peer, sender)| (*peer, sender.clone()))
                .collect();

            let mut failed = None;
            for (peer, sender) in peers {
                let envelope = Envelope {
                    from: self.actor_id,
                    message: message.clone(),
                };
                if sender.send(envelope).await.is_err() {
                    tracing::warn!(from = %self.actor_id, to = %peer, "bus peer gone");
                    failed.get_or_insert(peer);
                }
            }
            let Some(peer) = failed else {
                return Ok(());
            };
            if let Ok(mut senders) = self.bus.senders.write() {
                senders.retain(|_, sender| !sender.is_closed());
            }
            Err(SyncError::Transport(format!("bus peer {peer} is gone")))
        }

        async fn recv(&self) -> Result<Envelope> {
            let mut rx = self.receiver.lock().await;
            rx.recv().await.ok_or(SyncError::ConnectionClosed)
        }

        async fn close(&self) {
            if let Ok(mut senders) = self.bus.senders.write() {
                senders.remove(&self.actor_id);
            }
        }
    }

    type ConnectionId = u64;

    struct ServerState {
        store: Box<dyn DocStore>,
        connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<SyncEvent>>>,
        /// Held while storing and relaying commits, and while a new
        /// connection reads its backlog and registers.
        order: Mutex<()>,
        next_connection: AtomicU64,
        online: AtomicBool,
    }

    impl ServerState {
        fn push(&self, to: ConnectionId, event: SyncEvent) -> Result<()> {
            let connections = self
                .connections
                .read()
                .map_err(|_| SyncError::Transport("server lock poisoned".into()))?;
            let sender = connections.get(&to).ok_or(SyncError::ConnectionClosed)?;
            sender.send(event).map_err(|_| SyncError::ConnectionClosed)
        }

        fn relay(&self, from: ConnectionId, event: &SyncEvent) {
            let Ok(connections) = self.connections.read() else {
                return;
            };
            for (id, sender) in connections.iter() {
                if *id != from {
                    let _ = sender.send(event.clone());
                }
            }
        }

        fn is_registered(&self, id: ConnectionId) -> bool {
            self.connections
                .read()
                .map(|c| c.contains_key(&id))
                .unwrap_or(false)
        }

        fn unregister(&self, id: ConnectionId) {
            if let Ok(mut connections) = self.connections.write() {
                connections.remove(&id);
            }
        }
    }

    /// A remote peer backed by any [`DocStore`].
    ///
    /// Orders commits from every connection, acks the sender and relays
    /// newly stored commits to the other connections. Presence events are
    /// relayed as-is.
    #[derive(Clone)]
    pub struct MemoryRemoteServer {
        state: Arc<ServerState>,
    }

    impl MemoryRemoteServer {
        pub fn new(store: impl DocStore + 'static) -> Self {
            Self {
                state: Arc::new(ServerState {
                    store: Box::new(store),
                    connections: RwLock::new(HashMap::new()),
                    order: Mutex::new(()),
                    next_connection: AtomicU64::new(0),
                    online: AtomicBool::new(true),
                }),
            }
        }

        /// Accept or refuse new connections.
        pub fn set_online(&self, online: bool) {
            self.state.online.store(online, Ordering::SeqCst);
        }

        /// Drop every open connection.
        pub fn disconnect_all(&self) {
            if let Ok(mut connections) = self.state.connections.write() {
                connections.clear();
            }
        }

        /// Number of open connections.
        pub fn connection_count(&self) -> usize {
            self.state
                .connections
                .read()
                .map(|c| c.len())
                .unwrap_or(0)
        }

        /// Every commit the server has ordered.
        pub async fn commits(&self) -> Result<CommitsEvent> {
            Ok(self.state.store.get_commits_event(None).await?)
        }

        async fn handle(&self, from: ConnectionId, event: SyncEvent) -> Result<()> {
            match event {
                SyncEvent::Commits(incoming) => {
                    let _order = self.state.order.lock().await;
                    let commits: Vec<_> = incoming
                        .commits
                        .into_iter()
                        .map(|mut c| {
                            c.server = None;
                            c
                        })
                        .collect();

                    let ack = match self.state.store.add(&commits).await {
                        Ok(ack) => ack,
                        Err(e) => {
                            tracing::warn!(connection = from, error = %e, "remote add failed");
                            return self.state.push(
                                from,
                                SyncEvent::error(ErrorCode::Internal, e.to_string()),
                            );
                        }
                    };

                    let fresh: Vec<_> = commits
                        .into_iter()
                        .filter_map(|mut commit| {
                            let entry = ack.ack_for(&commit.id)?;
                            if entry.server.remote_sync_id != ack.sync_id {
                                return None;
                            }
                            commit.server = Some(entry.server);
                            Some(commit)
                        })
                        .collect();
                    let sync_id = ack.sync_id;

                    self.state.push(from, SyncEvent::Ack(ack))?;
                    if !fresh.is_empty() {
                        self.state.relay(
                            from,
                            &SyncEvent::Commits(CommitsEvent {
                                commits: fresh,
                                sync_id,
                            }),
                        );
                    }
                    Ok(())
                }
                presence @ (SyncEvent::ClientJoin { .. }
                | SyncEvent::ClientLeave { .. }
                | SyncEvent::ClientPresence { .. }) => {
                    self.state.relay(from, &presence);
                    Ok(())
                }
                other => {
                    tracing::debug!(connection = from, event = ?other, "remote ignoring event");
                    Ok(())
                }
            }
        }
    }

    #[async_trait]
    impl RemoteConnector for MemoryRemoteServer {
        async fn connect(&self, last_sync_id: Option<SyncId>) -> Result<Box<dyn RemoteConnection>> {
            if !self.state.online.load(Ordering::SeqCst) {
                return Err(SyncError::RemoteOffline);
            }

            let id = self.state.next_connection.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();

            // Commits stored after the backlog read are relayed to us.
            let _order = self.state.order.lock().await;
            let backlog = self.state.store.get_commits_event(last_sync_id).await?;
            if !backlog.commits.is_empty() {
                let _ = tx.send(SyncEvent::Commits(backlog));
            }
            let _ = tx.send(SyncEvent::Ready);

            self.state
                .connections
                .write()
                .map_err(|_| SyncError::Transport("server lock poisoned".into()))?
                .insert(id, tx);
            tracing::debug!(connection = id, since = ?last_sync_id, "remote connection opened");

            Ok(Box::new(MemoryRemoteConnection {
                id,
                server: self.clone(),
                receiver: Mutex::new(rx),
            }))
        }
    }

    /// A connection to a [`MemoryRemoteServer`].
    pub struct MemoryRemoteConnection {
        id: ConnectionId,
        server: MemoryRemoteServer,
        receiver: Mutex<mpsc::UnboundedReceiver<SyncEvent>>,
    }

    #[async_trait]
    impl RemoteConnection for MemoryRemoteConnection {
        async fn send(&self, event: SyncEvent) -> Result<()> {
            if !self.server.state.is_registered(self.id) {
                return Err(SyncError::ConnectionClosed);
            }
            self.server.handle(self.id, event).await
        }

        async fn recv(&self) -> Option<SyncEvent> {
            self.receiver.lock().await.recv().await
        }

        async fn close(&self) {
            self.server.state.unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryBus, MemoryRemoteServer};
    use super::*;
    use crate::error::SyncError;
    use crate::leader::LeaderMessage;
    use driftsync_core::{Commit, CommitsEvent};
    use driftsync_store::MemoryDocStore;

    fn commits(commits: Vec<Commit>) -> SyncEvent {
        SyncEvent::Commits(CommitsEvent {
            commits,
            sync_id: SyncId::ZERO,
        })
    }

    #[tokio::test]
    async fn test_bus_skips_sender() {
        let bus = MemoryBus::new();
        let a = bus.join(ActorId::from_bytes([0xAA; 16]));
        let b = bus.join(ActorId::from_bytes([0xBB; 16]));
        let c = bus.join(ActorId::from_bytes([0xCC; 16]));

        a.post(BusMessage::Leader(LeaderMessage::Claim)).await.unwrap();

        let from_b = b.recv().await.unwrap();
        let from_c = c.recv().await.unwrap();
        assert_eq!(from_b.from, a.local_actor_id());
        assert_eq!(from_c.message, BusMessage::Leader(LeaderMessage::Claim));

        b.post(BusMessage::Sync(SyncEvent::Ready)).await.unwrap();
        let got = a.recv().await.unwrap();
        assert_eq!(got.from, b.local_actor_id());
    }

    #[tokio::test]
    async fn test_bus_close_unregisters() {
        let bus = MemoryBus::new();
        let a = bus.join(ActorId::from_bytes([1; 16]));
        assert_eq!(bus.len(), 1);
        a.close().await;
        assert!(bus.is_empty());
        assert!(matches!(a.recv().await, Err(SyncError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_bus_applies_backpressure_when_full() {
        let bus = MemoryBus::new();
        let a = bus.join(ActorId::from_bytes([1; 16]));
        let b = bus.join(ActorId::from_bytes([2; 16]));
        let total = 1001;

        let poster = tokio::spawn(async move {
            for _ in 0..total {
                a.post(BusMessage::Leader(LeaderMessage::Claim)).await.unwrap();
            }
        });

        let mut received = 0;
        while received < total {
            b.recv().await.unwrap();
            received += 1;
        }
        poster.await.unwrap();
        assert_eq!(received, total);
    }

    #[tokio::test]
    async fn test_post_to_dropped_peer_fails() {
        let bus = MemoryBus::new();
        let a = bus.join(ActorId::from_bytes([1; 16]));
        let b = bus.join(ActorId::from_bytes([2; 16]));
        drop(b);

        let result = a.post(BusMessage::Leader(LeaderMessage::Claim)).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        assert_eq!(bus.len(), 1);
        a.post(BusMessage::Leader(LeaderMessage::Claim)).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_endpoint_can_still_post() {
        let bus = MemoryBus::new();
        let a = bus.join(ActorId::from_bytes([1; 16]));
        let b = bus.join(ActorId::from_bytes([2; 16]));
        a.close().await;

        a.post(BusMessage::Leader(LeaderMessage::Release)).await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.message, BusMessage::Leader(LeaderMessage::Release));
    }

    #[tokio::test]
    async fn test_remote_backlog_then_ready() {
        let server = MemoryRemoteServer::new(MemoryDocStore::new());
        let first = server.connect(None).await.unwrap();
        assert_eq!(first.recv().await, Some(SyncEvent::Ready));

        first.send(commits(vec![Commit::new("1")])).await.unwrap();
        let Some(SyncEvent::Ack(ack)) = first.recv().await else {
            panic!("expected ack");
        };
        assert!(ack.is_clean());

        let second = server.connect(None).await.unwrap();
        let Some(SyncEvent::Commits(backlog)) = second.recv().await else {
            panic!("expected backlog");
        };
        assert_eq!(backlog.commits.len(), 1);
        assert_eq!(second.recv().await, Some(SyncEvent::Ready));

        let caught_up = server.connect(Some(backlog.sync_id)).await.unwrap();
        assert_eq!(caught_up.recv().await, Some(SyncEvent::Ready));
    }

    #[tokio::test]
    async fn test_remote_relays_only_fresh_commits() {
        let server = MemoryRemoteServer::new(MemoryDocStore::new());
        let a = server.connect(None).await.unwrap();
        let b = server.connect(None).await.unwrap();
        assert_eq!(a.recv().await, Some(SyncEvent::Ready));
        assert_eq!(b.recv().await, Some(SyncEvent::Ready));

        a.send(commits(vec![Commit::new("1")])).await.unwrap();
        assert!(matches!(a.recv().await, Some(SyncEvent::Ack(_))));
        let Some(SyncEvent::Commits(relayed)) = b.recv().await else {
            panic!("expected relay");
        };
        assert_eq!(relayed.commits[0].id.as_str(), "1");
        assert!(relayed.commits[0].server.is_some());

        // Resending a known commit acks without relaying.
        b.send(commits(vec![Commit::new("1")])).await.unwrap();
        assert!(matches!(b.recv().await, Some(SyncEvent::Ack(_))));
        a.send(commits(vec![])).await.unwrap();
        assert!(matches!(a.recv().await, Some(SyncEvent::Ack(_))));
        assert_eq!(server.commits().await.unwrap().commits.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_joining_mid_stream_misses_nothing() {
        let server = MemoryRemoteServer::new(MemoryDocStore::new());
        let writer = server.connect(None).await.unwrap();
        assert_eq!(writer.recv().await, Some(SyncEvent::Ready));
        let total = 50;

        let sending = tokio::spawn(async move {
            let mut parent: Option<String> = None;
            for i in 0..total {
                let id = format!("c{i}");
                let mut commit = Commit::new(id.as_str());
                if let Some(p) = &parent {
                    commit = commit.with_base(p.as_str());
                }
                writer.send(commits(vec![commit])).await.unwrap();
                parent = Some(id);
                tokio::task::yield_now().await;
            }
            writer
        });

        let reader = server.connect(None).await.unwrap();
        let _writer = sending.await.unwrap();

        let mut seen = std::collections::BTreeSet::new();
        let collect = async {
            while seen.len() < total {
                match reader.recv().await {
                    Some(SyncEvent::Commits(event)) => {
                        seen.extend(event.commits.into_iter().map(|c| c.id));
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), collect)
            .await
            .unwrap();
        assert_eq!(seen.len(), total);
    }

    #[tokio::test]
    async fn test_remote_offline_and_disconnect() {
        let server = MemoryRemoteServer::new(MemoryDocStore::new());
        server.set_online(false);
        assert!(matches!(server.connect(None).await, Err(SyncError::RemoteOffline)));

        server.set_online(true);
        let conn = server.connect(None).await.unwrap();
        assert_eq!(conn.recv().await, Some(SyncEvent::Ready));
        server.disconnect_all();
        assert_eq!(conn.recv().await, None);
        assert!(matches!(
            conn.send(SyncEvent::Ready).await,
            Err(SyncError::ConnectionClosed)
        ));
    }
}
