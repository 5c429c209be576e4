//! The Client: one working copy of a synced document.
//!
//! A client pairs a [`MergeEngine`] with a running [`LocalActor`]. Local
//! edits become commits that the actor stores and fans out; commits from
//! siblings and the remote are validated, buffered until their ancestors
//! arrive, inserted, and merged into a single head.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use driftsync_core::{
    validate_commit_order_with, AckCommitsEvent, Commit, CommitRef, Differ, MergeEngine,
};
use driftsync_store::DocStore;
use driftsync_sync::{
    ActorHandle, Broadcast, ClientInfo, ErrorCode, LocalActor, RemoteConnector, SyncEvent,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::status::{LocalRead, LocalSave, SyncStatus};

type ClientKey = (String, String);

/// A working copy of one document.
pub struct Client<D: Differ> {
    config: ClientConfig,
    engine: MergeEngine<D>,
    actor: ActorHandle,
    doc: Option<D::Doc>,
    watch: watch::Sender<Option<D::Doc>>,
    /// Locally created commits the store has not acknowledged yet.
    unacked: Vec<Commit>,
    /// Received commits whose parents have not arrived.
    orphans: BTreeMap<CommitRef, Commit>,
    clients: BTreeMap<ClientKey, ClientInfo>,
    status: SyncStatus,
    closed: bool,
}

impl<D: Differ> Client<D> {
    /// Spawn an actor over `store` and `bus` and attach a client to it.
    pub fn open<S, B>(
        differ: D,
        store: S,
        bus: B,
        remote: Option<Arc<dyn RemoteConnector>>,
        config: ClientConfig,
    ) -> Self
    where
        S: DocStore + 'static,
        B: Broadcast + 'static,
    {
        let info = ClientInfo::new(config.user_id.clone(), config.client_id.clone());
        let actor = LocalActor::spawn(store, bus, remote, info, config.actor.clone());
        Self::with_actor(differ, actor, config)
    }

    /// Attach a client to an already running actor.
    pub fn with_actor(differ: D, actor: ActorHandle, config: ClientConfig) -> Self {
        let (watch, _) = watch::channel(None);
        Self {
            config,
            engine: MergeEngine::new(differ),
            actor,
            doc: None,
            watch,
            unacked: Vec::new(),
            orphans: BTreeMap::new(),
            clients: BTreeMap::new(),
            status: SyncStatus::default(),
            closed: false,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The current document, `None` before the first commit.
    pub fn doc(&self) -> Option<&D::Doc> {
        self.doc.as_ref()
    }

    /// The single head, `None` when empty or divergent.
    pub fn head(&self) -> Option<&CommitRef> {
        self.engine.graph().heads().single()
    }

    /// Watch document changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<D::Doc>> {
        self.watch.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Other clients currently present, ordered by user then client id.
    pub fn clients(&self) -> impl Iterator<Item = &ClientInfo> {
        self.clients.values()
    }

    pub fn unacked(&self) -> &[Commit] {
        &self.unacked
    }

    /// Number of received commits still waiting for ancestors.
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn engine(&self) -> &MergeEngine<D> {
        &self.engine
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Edits
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a new document state.
    ///
    /// Divergent heads are merged first. Nothing is committed if `doc`
    /// equals the current document.
    pub async fn update_doc(&mut self, doc: D::Doc, metadata: Value) -> Result<()> {
        self.ensure_open()?;
        let created = self.engine.commit_doc(doc, metadata)?;
        if created.is_empty() {
            return Ok(());
        }
        self.refresh_doc()?;
        self.save(created).await
    }

    /// Resend every unacknowledged commit. Returns how many were sent.
    pub async fn retry_unacked(&mut self) -> Result<usize> {
        self.ensure_open()?;
        if self.unacked.is_empty() {
            return Ok(0);
        }
        let commits = self.unacked.clone();
        let count = commits.len();
        tracing::debug!(count, "retrying unacked commits");
        self.status.local_save = LocalSave::Saving;
        self.actor.send_commits(commits).await?;
        Ok(count)
    }

    /// Publish this client's presence to everyone else.
    pub async fn update_presence(&mut self, presence: Value) -> Result<()> {
        self.ensure_open()?;
        let mut info = ClientInfo::new(self.config.user_id.clone(), self.config.client_id.clone());
        info.presence = Some(presence);
        self.actor.update_presence(info).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event Processing
    // ─────────────────────────────────────────────────────────────────────────

    /// Wait for and apply one event. Returns `false` once the actor stopped.
    pub async fn process_next(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        match self.actor.next_event().await {
            Some(event) => {
                self.handle_event(event).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply events until none arrives for `quiet`. Returns how many were applied.
    pub async fn settle(&mut self, quiet: Duration) -> Result<usize> {
        let mut handled = 0;
        while !self.closed {
            match tokio::time::timeout(quiet, self.actor.next_event()).await {
                Ok(Some(event)) => {
                    self.handle_event(event).await?;
                    handled += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(handled)
    }

    /// Stop the actor. Calling again is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.unacked.is_empty() {
            tracing::warn!(
                unacked = self.unacked.len(),
                "shutting down with unacknowledged commits"
            );
        }
        self.actor.shutdown().await?;
        Ok(())
    }

    async fn handle_event(&mut self, event: SyncEvent) -> Result<()> {
        match event {
            SyncEvent::Commits(event) => self.receive(event.commits).await?,
            SyncEvent::Ack(ack) => self.acknowledge(&ack),
            SyncEvent::Ready => {
                if self.status.local_read == LocalRead::Loading {
                    self.status.local_read = LocalRead::Ready;
                    self.migrate().await?;
                }
            }
            SyncEvent::ClientJoin { info } | SyncEvent::ClientPresence { info } => {
                self.clients
                    .insert((info.user_id.clone(), info.client_id.clone()), info);
            }
            SyncEvent::ClientLeave { user_id, client_id } => {
                self.clients.remove(&(user_id, client_id));
            }
            SyncEvent::RemoteState { connect, read } => {
                self.status.remote_connect = connect;
                self.status.remote_read = read;
            }
            SyncEvent::Error {
                code,
                message,
                fatal,
            } => {
                tracing::warn!(?code, %message, fatal, "sync error");
                if matches!(code, ErrorCode::Internal | ErrorCode::Unavailable)
                    && !self.unacked.is_empty()
                {
                    self.status.local_save = LocalSave::Error;
                }
                if fatal {
                    return Err(ClientError::Fatal { code, message });
                }
            }
        }
        Ok(())
    }

    async fn receive(&mut self, commits: Vec<Commit>) -> Result<()> {
        let order = {
            let graph = self.engine.graph();
            let orphans = &self.orphans;
            validate_commit_order_with(&commits, |r| {
                graph.contains(r) || orphans.contains_key(r)
            })?
        };
        if !order.invalid_refs.is_empty() {
            tracing::warn!(count = order.invalid_refs.len(), "dropping invalid commits");
        }

        for commit in &commits {
            if let Some(server) = &commit.server {
                if self.engine.graph().contains(&commit.id) {
                    self.engine.annotate(&commit.id, *server)?;
                }
            }
        }

        let mut inserted = 0;
        for commit in order.new_commits {
            if commit.parents().all(|p| self.engine.graph().contains(p)) {
                if self.engine.add_commit(commit)? {
                    inserted += 1;
                }
            } else {
                self.orphans.insert(commit.id.clone(), commit);
            }
        }
        inserted += self.adopt_orphans()?;
        if !self.orphans.is_empty() {
            tracing::debug!(orphans = self.orphans.len(), "waiting for missing parents");
        }
        if inserted == 0 {
            return Ok(());
        }

        let merges = self.engine.merge_heads()?;
        self.refresh_doc()?;
        if !merges.is_empty() {
            self.save(merges).await?;
        }
        Ok(())
    }

    /// Insert buffered commits whose parents are now known.
    fn adopt_orphans(&mut self) -> Result<usize> {
        let mut adopted = 0;
        loop {
            let ready: Vec<CommitRef> = self
                .orphans
                .values()
                .filter(|c| c.parents().all(|p| self.engine.graph().contains(p)))
                .map(|c| c.id.clone())
                .collect();
            if ready.is_empty() {
                return Ok(adopted);
            }
            for r in ready {
                if let Some(commit) = self.orphans.remove(&r) {
                    if self.engine.add_commit(commit)? {
                        adopted += 1;
                    }
                }
            }
        }
    }

    fn acknowledge(&mut self, ack: &AckCommitsEvent) {
        for entry in &ack.acks {
            if let Err(e) = self.engine.annotate(&entry.id, entry.server) {
                tracing::debug!(commit = %entry.id, error = %e, "ack for unknown commit");
            }
        }
        for (r, error) in &ack.ref_errors {
            tracing::warn!(commit = %r, code = ?error.code, message = ?error.message, "commit rejected");
        }

        self.unacked.retain(|c| ack.ack_for(&c.id).is_none());
        let rejected = self
            .unacked
            .iter()
            .any(|c| ack.ref_errors.contains_key(&c.id));
        self.status.local_save = if self.unacked.is_empty() {
            LocalSave::Ready
        } else if rejected {
            LocalSave::Error
        } else {
            LocalSave::Saving
        };
    }

    /// Run the application's migration once on the loaded document.
    async fn migrate(&mut self) -> Result<()> {
        let Some(head) = self.head().cloned() else {
            return Ok(());
        };
        let Some(doc) = self.doc.clone() else {
            return Ok(());
        };
        let metadata = self
            .engine
            .graph()
            .get(&head)
            .map(|c| c.metadata.clone())
            .unwrap_or(Value::Null);

        let (migrated, metadata) = self
            .engine
            .differ()
            .migrate(doc.clone(), metadata)
            .map_err(ClientError::Migration)?;
        if migrated != doc {
            tracing::info!(%head, "migrated document");
            self.update_doc(migrated, metadata).await?;
        }
        Ok(())
    }

    async fn save(&mut self, commits: Vec<Commit>) -> Result<()> {
        self.unacked.extend(commits.iter().cloned());
        self.status.local_save = LocalSave::Saving;
        self.actor.send_commits(commits).await?;
        Ok(())
    }

    fn refresh_doc(&mut self) -> Result<()> {
        let Some(head) = self.head().cloned() else {
            return Ok(());
        };
        let doc = Some(self.engine.compute_doc(&head)?);
        if doc != self.doc {
            self.doc = doc.clone();
            self.watch.send_replace(doc);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}
