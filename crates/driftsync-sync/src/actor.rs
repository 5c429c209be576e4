//! The local coordinator.
//!
//! One [`LocalActor`] runs per client instance. It owns a store handle and
//! a bus endpoint, and takes part in leader election when a remote is
//! configured. The elected leader alone holds the remote connection: it
//! pushes local commits upstream and writes remote commits into the shared
//! store before announcing them on the bus.
//!
//! The actor is a single task driven by a `select!` loop. Its client talks to
//! it through an [`ActorHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use driftsync_core::{AckCommitsEvent, Commit, CommitsEvent, SyncId};
use driftsync_store::{DocStore, StoreError};

use crate::error::{Result, SyncError};
use crate::leader::{LeaderConfig, LeaderElection, LeaderEvent, Step};
use crate::messages::{
    limits, ActorId, BusMessage, ClientInfo, Envelope, ErrorCode, RemoteConnect, RemoteRead,
    SyncEvent,
};
use crate::transport::{Broadcast, RemoteConnection, RemoteConnector};

/// Configuration for a local actor.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub leader: LeaderConfig,
    /// Delay before reconnecting a dropped remote link.
    pub remote_reconnect_delay: Duration,
    /// Capacity of the command queue.
    pub command_buffer: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            leader: LeaderConfig::default(),
            remote_reconnect_delay: Duration::from_secs(3),
            command_buffer: 64,
        }
    }
}

/// Commands sent from the client to its actor.
#[derive(Debug)]
pub enum ActorCommand {
    Commits(Vec<Commit>),
    Presence(ClientInfo),
    Shutdown(oneshot::Sender<()>),
}

/// Client side of a running actor.
pub struct ActorHandle {
    actor_id: ActorId,
    commands: mpsc::Sender<ActorCommand>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    task: Option<JoinHandle<()>>,
}

impl ActorHandle {
    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    /// Hand commits to the actor for storage and fan-out.
    pub async fn send_commits(&self, commits: Vec<Commit>) -> Result<()> {
        self.send(ActorCommand::Commits(commits)).await
    }

    pub async fn update_presence(&self, info: ClientInfo) -> Result<()> {
        self.send(ActorCommand::Presence(info)).await
    }

    /// Wait for the next event. `None` once the actor stopped.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Take an event if one is queued.
    pub fn try_next_event(&mut self) -> Option<SyncEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the actor and wait for it. Calling again is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        if self.commands.send(ActorCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        task.await.map_err(|e| {
            tracing::error!(actor = %self.actor_id, error = %e, "actor task failed");
            SyncError::ActorStopped
        })
    }

    async fn send(&self, command: ActorCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ActorStopped)
    }
}

enum Next {
    Command(Option<ActorCommand>),
    Bus(Result<Envelope>),
    Remote(Option<SyncEvent>),
    Tick,
}

/// The per-client coordinator task.
pub struct LocalActor<S, B> {
    store: S,
    bus: B,
    remote: Option<Arc<dyn RemoteConnector>>,
    connection: Option<Box<dyn RemoteConnection>>,
    election: LeaderElection,
    config: ActorConfig,
    info: ClientInfo,
    commands: mpsc::Receiver<ActorCommand>,
    events: mpsc::UnboundedSender<SyncEvent>,
    /// Highest remote sync id seen in a commits event.
    remote_cursor: Option<SyncId>,
    reconnect_at: Option<Instant>,
    listening: bool,
    stopped: bool,
}

impl<S, B> LocalActor<S, B>
where
    S: DocStore + 'static,
    B: Broadcast + 'static,
{
    /// Start an actor on the current runtime.
    pub fn spawn(
        store: S,
        bus: B,
        remote: Option<Arc<dyn RemoteConnector>>,
        info: ClientInfo,
        config: ActorConfig,
    ) -> ActorHandle {
        let actor_id = bus.local_actor_id();
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = Self {
            store,
            bus,
            remote,
            connection: None,
            election: LeaderElection::new(actor_id, config.leader.clone()),
            config,
            info,
            commands: command_rx,
            events: event_tx,
            remote_cursor: None,
            reconnect_at: None,
            listening: true,
            stopped: false,
        };
        let task = tokio::spawn(actor.run());

        ActorHandle {
            actor_id,
            commands: command_tx,
            events: event_rx,
            task: Some(task),
        }
    }

    async fn run(mut self) {
        self.startup().await;

        while !self.stopped {
            let deadline = self.next_deadline();
            let next = tokio::select! {
                command = self.commands.recv() => Next::Command(command),
                message = bus_recv(&self.bus, self.listening) => Next::Bus(message),
                event = remote_recv(&self.connection) => Next::Remote(event),
                _ = sleep_until(deadline) => Next::Tick,
            };

            match next {
                Next::Command(Some(command)) => self.handle_command(command).await,
                Next::Command(None) => self.shutdown().await,
                Next::Bus(Ok(envelope)) => self.handle_bus(envelope).await,
                Next::Bus(Err(e)) => {
                    tracing::warn!(actor = %self.id(), error = %e, "bus closed");
                    self.listening = false;
                    self.emit(SyncEvent::error(ErrorCode::Network, e.to_string()));
                }
                Next::Remote(Some(event)) => self.handle_remote(event).await,
                Next::Remote(None) => self.remote_lost("connection closed").await,
                Next::Tick => self.tick().await,
            }
        }
    }

    fn id(&self) -> ActorId {
        self.election.id()
    }

    fn next_deadline(&self) -> Option<Instant> {
        let election = self
            .remote
            .as_ref()
            .and_then(|_| self.election.next_deadline());
        match (election, self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    async fn startup(&mut self) {
        match self.store.get_commits_event(None).await {
            Ok(event) => self.emit(SyncEvent::Commits(event)),
            Err(e) => {
                tracing::error!(actor = %self.id(), error = %e, "initial load failed");
                self.emit(SyncEvent::Error {
                    code: error_code(&e),
                    message: e.to_string(),
                    fatal: true,
                });
            }
        }
        self.emit(SyncEvent::Ready);
        self.post(BusMessage::Sync(SyncEvent::ClientJoin {
            info: self.info.clone(),
        }))
        .await;

        if self.remote.is_some() {
            let step = self.election.start(Instant::now());
            self.apply(step).await;
        }
        tracing::debug!(actor = %self.id(), "actor started");
    }

    /// Unregister listeners, then release the store, then leadership.
    async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.post(BusMessage::Sync(SyncEvent::ClientLeave {
            user_id: self.info.user_id.clone(),
            client_id: self.info.client_id.clone(),
        }))
        .await;
        self.bus.close().await;
        self.listening = false;
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.reconnect_at = None;

        if let Err(e) = self.store.close().await {
            tracing::warn!(actor = %self.id(), error = %e, "store close failed");
        }

        let step = self.election.release();
        for message in step.outbound {
            self.post(BusMessage::Leader(message)).await;
        }
        tracing::info!(actor = %self.id(), "actor stopped");
    }

    async fn tick(&mut self) {
        let now = Instant::now();
        if self.remote.is_some() {
            let step = self.election.tick(now);
            self.apply(step).await;
        }
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.connect_remote().await;
        }
    }

    async fn apply(&mut self, step: Step) {
        for message in step.outbound {
            self.post(BusMessage::Leader(message)).await;
        }
        match step.event {
            Some(LeaderEvent::BecameLeader) => self.connect_remote().await,
            Some(LeaderEvent::LostLeadership) => self.disconnect_remote().await,
            None => {}
        }
    }

    // ─── Client Commands ─────────────────────────────────────────────────

    async fn handle_command(&mut self, command: ActorCommand) {
        match command {
            ActorCommand::Commits(commits) => self.add_local(commits).await,
            ActorCommand::Presence(info) => {
                self.info = info.clone();
                let event = SyncEvent::ClientPresence { info };
                self.post(BusMessage::Sync(event.clone())).await;
                if self.election.is_leader() {
                    self.send_remote(event).await;
                }
            }
            ActorCommand::Shutdown(done) => {
                self.shutdown().await;
                let _ = done.send(());
            }
        }
    }

    async fn add_local(&mut self, commits: Vec<Commit>) {
        let ack = match self.store.add(&commits).await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!(actor = %self.id(), error = %e, count = commits.len(), "add failed");
                self.emit(SyncEvent::error(error_code(&e), e.to_string()));
                return;
            }
        };

        let accepted = CommitsEvent {
            commits: annotated(commits, &ack),
            sync_id: ack.sync_id,
        };
        self.emit(SyncEvent::Ack(ack));

        if !accepted.commits.is_empty() {
            self.post(BusMessage::Sync(SyncEvent::Commits(accepted.clone())))
                .await;
            if self.election.is_leader() {
                self.push_to_remote(accepted).await;
            }
        }
    }

    // ─── Bus Messages ────────────────────────────────────────────────────

    async fn handle_bus(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
            BusMessage::Leader(message) => {
                if self.remote.is_some() {
                    let step = self.election.handle(from, message, Instant::now());
                    self.apply(step).await;
                }
            }
            BusMessage::Sync(SyncEvent::Commits(event)) => {
                self.emit(SyncEvent::Commits(event.clone()));
                if self.election.is_leader() {
                    self.push_to_remote(event).await;
                }
            }
            BusMessage::Sync(SyncEvent::ClientJoin { info }) => {
                self.emit(SyncEvent::ClientJoin { info: info.clone() });
                self.post(BusMessage::Sync(SyncEvent::ClientPresence {
                    info: self.info.clone(),
                }))
                .await;
                if self.election.is_leader() {
                    self.send_remote(SyncEvent::ClientJoin { info }).await;
                }
            }
            BusMessage::Sync(
                event @ (SyncEvent::ClientLeave { .. } | SyncEvent::ClientPresence { .. }),
            ) => {
                self.emit(event.clone());
                if self.election.is_leader() {
                    self.send_remote(event).await;
                }
            }
            BusMessage::Sync(event @ SyncEvent::RemoteState { .. }) => self.emit(event),
            BusMessage::Sync(other) => {
                tracing::debug!(actor = %self.id(), %from, event = ?other, "ignoring bus event");
            }
        }
    }

    // ─── Remote Link ─────────────────────────────────────────────────────

    async fn handle_remote(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Commits(event) => {
                self.remote_cursor = self.remote_cursor.max(Some(event.sync_id));
                let ack = match self.store.add(&event.commits).await {
                    Ok(ack) => ack,
                    Err(e) => {
                        tracing::warn!(actor = %self.id(), error = %e, "storing remote commits failed");
                        self.emit(SyncEvent::error(error_code(&e), e.to_string()));
                        return;
                    }
                };
                if !ack.ref_errors.is_empty() {
                    tracing::warn!(
                        actor = %self.id(),
                        rejected = ack.ref_errors.len(),
                        "local store rejected remote commits"
                    );
                }

                let accepted = CommitsEvent {
                    commits: annotated(event.commits, &ack),
                    sync_id: ack.sync_id,
                };
                if !accepted.commits.is_empty() {
                    self.emit(SyncEvent::Commits(accepted.clone()));
                    self.post(BusMessage::Sync(SyncEvent::Commits(accepted))).await;
                }
            }
            SyncEvent::Ack(ack) => {
                if !ack.ref_errors.is_empty() {
                    tracing::warn!(
                        actor = %self.id(),
                        rejected = ack.ref_errors.len(),
                        "remote rejected commits"
                    );
                }
            }
            SyncEvent::Ready => {
                self.remote_state(RemoteConnect::Online, RemoteRead::Ready).await;
            }
            event @ (SyncEvent::ClientJoin { .. }
            | SyncEvent::ClientLeave { .. }
            | SyncEvent::ClientPresence { .. }) => {
                self.emit(event.clone());
                self.post(BusMessage::Sync(event)).await;
            }
            SyncEvent::Error {
                code,
                message,
                fatal,
            } => {
                tracing::warn!(actor = %self.id(), ?code, %message, fatal, "remote error");
                self.emit(SyncEvent::Error {
                    code,
                    message: message.clone(),
                    fatal: false,
                });
                if fatal {
                    self.remote_lost(&message).await;
                }
            }
            other => {
                tracing::debug!(actor = %self.id(), event = ?other, "ignoring remote event");
            }
        }
    }

    async fn connect_remote(&mut self) {
        if self.connection.is_some() || self.stopped || !self.election.is_leader() {
            return;
        }
        let Some(remote) = self.remote.clone() else {
            return;
        };

        self.remote_state(RemoteConnect::Connecting, RemoteRead::Loading)
            .await;
        match remote.connect(self.remote_cursor).await {
            Ok(connection) => {
                tracing::info!(actor = %self.id(), since = ?self.remote_cursor, "remote connected");
                self.connection = Some(connection);
                self.remote_state(RemoteConnect::Online, RemoteRead::Loading)
                    .await;
                self.send_remote(SyncEvent::ClientJoin {
                    info: self.info.clone(),
                })
                .await;
                match self.store.get_commits_event(None).await {
                    Ok(local) if !local.commits.is_empty() => self.push_to_remote(local).await,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(actor = %self.id(), error = %e, "reading local commits failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    actor = %self.id(),
                    error = %e,
                    delay = ?self.config.remote_reconnect_delay,
                    "remote connect failed"
                );
                self.remote_state(RemoteConnect::Offline, RemoteRead::Loading)
                    .await;
                self.reconnect_at = Some(Instant::now() + self.config.remote_reconnect_delay);
            }
        }
    }

    async fn disconnect_remote(&mut self) {
        self.reconnect_at = None;
        if let Some(connection) = self.connection.take() {
            connection.close().await;
            tracing::info!(actor = %self.id(), "remote disconnected");
        }
    }

    async fn remote_lost(&mut self, reason: &str) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        tracing::warn!(
            actor = %self.id(),
            reason,
            delay = ?self.config.remote_reconnect_delay,
            "remote link lost"
        );
        self.remote_state(RemoteConnect::Offline, RemoteRead::Loading)
            .await;
        if self.election.is_leader() && !self.stopped {
            self.reconnect_at = Some(Instant::now() + self.config.remote_reconnect_delay);
        }
    }

    async fn push_to_remote(&mut self, event: CommitsEvent) {
        let Some(connection) = self.connection.as_deref() else {
            return;
        };
        if let Err(e) = send_chunks(connection, event).await {
            self.remote_lost(&e.to_string()).await;
        }
    }

    async fn send_remote(&mut self, event: SyncEvent) {
        let Some(connection) = self.connection.as_deref() else {
            return;
        };
        if let Err(e) = connection.send(event).await {
            self.remote_lost(&e.to_string()).await;
        }
    }

    async fn remote_state(&mut self, connect: RemoteConnect, read: RemoteRead) {
        let event = SyncEvent::RemoteState { connect, read };
        self.emit(event.clone());
        self.post(BusMessage::Sync(event)).await;
    }

    // ─── Output ──────────────────────────────────────────────────────────

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn post(&self, message: BusMessage) {
        if let Err(e) = self.bus.post(message).await {
            tracing::warn!(actor = %self.id(), error = %e, "bus post failed");
            self.emit(SyncEvent::error(ErrorCode::Network, e.to_string()));
        }
    }
}

/// The commits of a batch that the store acked, carrying their annotation.
fn annotated(commits: Vec<Commit>, ack: &AckCommitsEvent) -> Vec<Commit> {
    commits
        .into_iter()
        .filter_map(|mut commit| {
            let entry = ack.ack_for(&commit.id)?;
            commit.server = Some(entry.server);
            Some(commit)
        })
        .collect()
}

/// Send commits upstream in bounded events. The remote orders them itself,
/// so local annotations are stripped.
async fn send_chunks(connection: &dyn RemoteConnection, event: CommitsEvent) -> Result<()> {
    for chunk in event.commits.chunks(limits::MAX_COMMITS_PER_EVENT) {
        let commits = chunk
            .iter()
            .cloned()
            .map(|mut c| {
                c.server = None;
                c
            })
            .collect();
        connection
            .send(SyncEvent::Commits(CommitsEvent {
                commits,
                sync_id: event.sync_id,
            }))
            .await?;
    }
    Ok(())
}

fn error_code(error: &StoreError) -> ErrorCode {
    if error.is_disconnect() || matches!(error, StoreError::Unavailable) {
        ErrorCode::Unavailable
    } else {
        ErrorCode::Internal
    }
}

async fn bus_recv<B: Broadcast>(bus: &B, listening: bool) -> Result<Envelope> {
    if listening {
        bus.recv().await
    } else {
        std::future::pending().await
    }
}

async fn remote_recv(connection: &Option<Box<dyn RemoteConnection>>) -> Option<SyncEvent> {
    match connection {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
