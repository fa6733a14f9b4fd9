//! The sync engine: single authority for reading and writing records.
//!
//! Every mutation lands in memory and the local store before any network
//! round trip. Remote writes go through one retry helper; network-class
//! failures queue the write, rejections are returned to the caller.
//!
//! ## Connectivity
//!
//! ```text
//! unknown ──health ok──▶ online ◀──online event / health ok──┐
//!    │                     │                                   │
//!    └──network failure────┴──▶ offline ───────────────────────┘
//! ```
//!
//! Coming back online triggers a replay of the pending queue.

mod events;
mod replay;
mod state;

pub use events::SyncEvent;
pub use replay::ReplayReport;

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{RemoteError, Result, SyncError};
use crate::models::{
    ConnectivityState, Fields, Operation, PendingOperation, Record, RecordType, RemoteRecord,
};
use crate::remote::{with_retry, RemoteApi, RetryPolicy};
use crate::store::LocalStore;
use events::EventBus;
use state::EngineState;

/// What happened to a write from the caller's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The server acknowledged the write
    Synced,
    /// Saved locally, will sync later
    SavedLocally,
    /// Nothing had to reach the server (e.g. deleting a never-synced record)
    LocalOnly,
}

/// Result of `create`/`update`/`delete`
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub record: Record,
    pub status: WriteStatus,
}

impl Mutation {
    fn new(record: Record, status: WriteStatus) -> Self {
        Self { record, status }
    }
}

/// How a create acknowledgement left the local record
enum Ack {
    /// Attached; local copy matches what was sent
    Current(Record),
    /// Attached, but the record was edited while the create was in flight
    Stale(Record),
    /// The record was deleted locally meanwhile
    Orphan,
}

struct Inner<R, S> {
    remote: R,
    store: S,
    policy: RetryPolicy,
    replay_interval: Duration,
    replay_on_reconnect: bool,
    state: Mutex<EngineState>,
    events: EventBus,
    /// One in-flight replay per record type
    replaying: [AtomicBool; 2],
    /// Wakes the background task when connectivity returns
    reconnected: Notify,
}

/// Local-first sync engine over a RemoteApi and a LocalStore.
///
/// Cheap to clone; clones share state.
pub struct SyncEngine<R, S> {
    inner: Arc<Inner<R, S>>,
}

impl<R, S> Clone for SyncEngine<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R, S> SyncEngine<R, S>
where
    R: RemoteApi + 'static,
    S: LocalStore + 'static,
{
    /// Create an engine with default configuration
    pub fn new(remote: R, store: S) -> Self {
        Self::with_config(remote, store, &Config::default())
    }

    /// Create with custom config
    pub fn with_config(remote: R, store: S, config: &Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                store,
                policy: config.retry_policy(),
                replay_interval: config.replay_interval(),
                replay_on_reconnect: config.replay.replay_on_reconnect,
                state: Mutex::new(EngineState::default()),
                events: EventBus::default(),
                replaying: [AtomicBool::new(false), AtomicBool::new(false)],
                reconnected: Notify::new(),
            }),
        }
    }

    /// Register a change callback
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(callback);
    }

    /// Run `f` under the state lock, write dirty keys through, then emit
    /// queued events with the lock released.
    fn transact<T>(&self, f: impl FnOnce(&mut EngineState) -> T) -> T {
        let (out, events) = {
            let mut state = self.inner.state.lock();
            let out = f(&mut state);
            state.flush(&self.inner.store);
            (out, std::mem::take(&mut state.outbox))
        };
        for event in &events {
            self.inner.events.emit(event);
        }
        out
    }

    // ========== Accessors ==========

    pub fn connectivity(&self) -> ConnectivityState {
        self.inner.state.lock().connectivity
    }

    /// Snapshot of the pending queue in replay order
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.inner.state.lock().queue().to_vec()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue().len()
    }

    /// Whether the local store failed and the engine runs in memory only
    pub fn storage_degraded(&self) -> bool {
        self.inner.state.lock().storage_degraded
    }

    pub fn get(&self, record_type: RecordType, id: &str) -> Result<Record> {
        self.inner
            .state
            .lock()
            .find(record_type, id)
            .cloned()
            .ok_or_else(|| not_found(record_type, id))
    }

    // ========== Lifecycle ==========

    /// Load cached records and the pending queue so callers can render
    /// before any network traffic.
    pub fn load_cached(&self) {
        self.transact(|state| {
            state.load(&self.inner.store);
            let requeued = state.requeue_unsynced();
            if requeued > 0 {
                info!("Requeued {} unsynced records without a pending create", requeued);
            }
            state.outbox.push(SyncEvent::CacheLoaded {
                applications: state.records(RecordType::Application).len(),
                contacts: state.records(RecordType::Contact).len(),
                pending: state.queue().len(),
            });
        });
    }

    /// Load the cache, check the backend once, and replay if it is
    /// reachable. An unreachable backend is not an error.
    pub async fn initialize(&self) -> ConnectivityState {
        self.load_cached();
        self.health_check().await;
        let connectivity = self.connectivity();
        info!("Sync engine initialized ({})", connectivity);
        connectivity
    }

    /// `GET /api/health`; moves to online (replaying) or offline
    pub async fn health_check(&self) -> bool {
        let single = RetryPolicy {
            max_attempts: 1,
            ..self.inner.policy
        };

        match with_retry(&single, "health check", || self.inner.remote.health()).await {
            Ok(()) => {
                let came_online = self.transact(|state| state.set_connectivity(ConnectivityState::Online));
                if came_online {
                    info!("Backend reachable");
                    if self.inner.replay_on_reconnect {
                        self.replay_pending().await;
                    }
                }
                true
            }
            Err(err) => {
                debug!("Health check failed: {}", err);
                self.go_offline(&err);
                false
            }
        }
    }

    /// Browser-style online/offline notification
    pub fn network_changed(&self, online: bool) {
        if !online {
            info!("Network reported offline");
            self.transact(|state| state.set_connectivity(ConnectivityState::Offline));
            return;
        }

        // Confirm with the backend; the health check replays on success
        info!("Network reported online, checking backend");
        let engine = self.clone();
        spawn_detached(async move {
            engine.health_check().await;
        });
    }

    /// Periodic replay (or health check while offline), also woken when
    /// a remote call succeeds after an outage.
    pub fn spawn_background(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.inner.replay_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = engine.inner.reconnected.notified() => {}
                }

                if engine.connectivity().is_online() {
                    if engine.pending_count() > 0 {
                        engine.replay_pending().await;
                    }
                } else {
                    engine.health_check().await;
                }
            }
        })
    }

    // ========== Connectivity bookkeeping ==========

    fn go_offline(&self, err: &RemoteError) {
        let changed = self.transact(|state| {
            let was = state.connectivity;
            state.set_connectivity(ConnectivityState::Offline);
            was != ConnectivityState::Offline
        });
        if changed {
            warn!("Backend unreachable, working offline: {}", err);
        }
    }

    fn mark_reachable(&self) {
        let came_online = self.transact(|state| state.set_connectivity(ConnectivityState::Online));
        if came_online && self.inner.replay_on_reconnect {
            self.inner.reconnected.notify_one();
        }
    }

    /// Run one RemoteAPI call with retry and update connectivity from its
    /// outcome. Any HTTP answer, including a rejection, proves reachability.
    async fn call<T, F, Fut>(&self, label: &str, op: F) -> std::result::Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let result = with_retry(&self.inner.policy, label, op).await;
        match &result {
            Err(err) if err.is_network_class() => self.go_offline(err),
            _ => self.mark_reachable(),
        }
        result
    }

    // ========== Reads ==========

    /// Current in-memory records of a type.
    ///
    /// The first call per type while online starts a background refresh.
    pub fn list(&self, record_type: RecordType) -> Vec<Record> {
        let (records, refresh) = self.transact(|state| {
            let idx = record_type.index();
            let refresh = state.connectivity.is_online() && !state.refreshed[idx];
            if refresh {
                state.refreshed[idx] = true;
            }
            (state.records(record_type).to_vec(), refresh)
        });

        if refresh {
            let engine = self.clone();
            spawn_detached(async move {
                if let Err(err) = engine.refresh(record_type).await {
                    debug!("Background refresh of {} failed: {}", record_type, err);
                }
            });
        }

        records
    }

    /// Replace synced records of a type with the server's list, keeping
    /// unsynced local work. Returns the new record count.
    pub async fn refresh(&self, record_type: RecordType) -> Result<usize> {
        let label = format!("list {}", record_type.collection());
        let synced_before = self.inner.state.lock().synced_ids(record_type);
        let remote = self
            .call(&label, || self.inner.remote.list(record_type))
            .await?;

        let count = self.transact(|state| {
            state.refreshed[record_type.index()] = true;
            let count = state.apply_refresh(record_type, remote, &synced_before);
            state.outbox.push(SyncEvent::Refreshed { record_type, count });
            count
        });
        debug!("Refreshed {} {} records", count, record_type);
        Ok(count)
    }

    // ========== Writes ==========

    /// Create a record locally, then on the server.
    ///
    /// Returns `SavedLocally` when the server is unreachable; a rejection
    /// removes the record again and returns `Validation`.
    ///
    /// The record is visible through `list`/`get` and a `RecordChanged`
    /// event as soon as it is stored locally, but this future resolves
    /// only after the remote call and its retries finish. Callers that
    /// must not wait on a slow backend should spawn it.
    pub async fn create(&self, record_type: RecordType, fields: Fields) -> Result<Mutation> {
        let record = Record::new(fields);
        let offline = self.transact(|state| {
            state.insert(record_type, record.clone());
            state.outbox.push(SyncEvent::RecordChanged {
                record_type,
                id: record.id.clone(),
            });
            state.connectivity.is_offline()
        });

        if offline {
            return Ok(self.queue_create(record_type, record));
        }

        let payload = record.to_payload();
        let label = format!("create {}", record_type);
        match self
            .call(&label, || self.inner.remote.create(record_type, &payload))
            .await
        {
            Ok(remote) => {
                let synced = self
                    .acknowledge_create(record_type, &record, remote, None)
                    .await;
                Ok(Mutation::new(synced, WriteStatus::Synced))
            }
            Err(err) if err.is_network_class() => Ok(self.queue_create(record_type, record)),
            Err(err) => {
                warn!("Server rejected new {}: {}", record_type, err);
                self.transact(|state| {
                    if state.remove(record_type, &record.id).is_some() {
                        state.outbox.push(SyncEvent::RecordRemoved {
                            record_type,
                            id: record.id.clone(),
                        });
                    }
                });
                Err(err.into())
            }
        }
    }

    fn queue_create(&self, record_type: RecordType, record: Record) -> Mutation {
        self.transact(|state| {
            // Queue the latest local version; it may have been edited while
            // the first attempt was in flight, or deleted outright.
            let Some(current) = state.find(record_type, &record.id).cloned() else {
                return Mutation::new(record, WriteStatus::LocalOnly);
            };
            state.enqueue(PendingOperation::new(
                record_type,
                current.id.clone(),
                Operation::Create {
                    record: current.clone(),
                },
            ));
            state.outbox.push(SyncEvent::SavedLocally {
                record_type,
                id: current.id.clone(),
                kind: "create",
            });
            Mutation::new(current, WriteStatus::SavedLocally)
        })
    }

    /// Attach the server id after a create succeeded (first attempt or
    /// replay) and settle any local change made while it was in flight.
    async fn acknowledge_create(
        &self,
        record_type: RecordType,
        sent: &Record,
        remote: RemoteRecord,
        op_id: Option<&str>,
    ) -> Record {
        let remote_id = remote.id;
        let ack = self.transact(|state| {
            if let Some(op_id) = op_id {
                state.remove_op(op_id);
            }
            let Some(record) = state.find_mut(record_type, &sent.id) else {
                return Ack::Orphan;
            };
            record.remote_id = Some(remote_id.clone());
            let record = record.clone();
            state.outbox.push(SyncEvent::RecordSynced {
                record_type,
                id: record.id.clone(),
                remote_id: remote_id.clone(),
            });
            if record.fields != sent.fields {
                Ack::Stale(record)
            } else {
                Ack::Current(record)
            }
        });

        match ack {
            Ack::Current(record) => record,
            Ack::Stale(record) => {
                debug!("{} {} changed while its create was in flight", record_type, record.id);
                if let Err(err) = self.push_update(record_type, record.clone()).await {
                    warn!("Follow-up update for {} {} rejected: {}", record_type, record.id, err);
                }
                record
            }
            Ack::Orphan => {
                info!("{} {} was deleted before the server acknowledged it", record_type, sent.id);
                self.delete_remote(record_type, &sent.id, remote_id.clone()).await;
                let mut record = sent.clone();
                record.remote_id = Some(remote_id);
                record
            }
        }
    }

    /// Update or edit-merge a record.
    ///
    /// Without a server id the change is folded into the queued create.
    /// A rejection restores the previous local version.
    pub async fn update(&self, record_type: RecordType, id: &str, fields: Fields) -> Result<Mutation> {
        let (previous, current) = self.transact(|state| {
            let record = state
                .find_mut(record_type, id)
                .ok_or_else(|| not_found(record_type, id))?;
            let previous = record.clone();
            record.merge(fields);
            let current = record.clone();

            if !current.is_synced() && state.fold_into_create(record_type, &current) {
                debug!("Folded update of {} {} into its pending create", record_type, id);
            }
            state.outbox.push(SyncEvent::RecordChanged {
                record_type,
                id: id.to_string(),
            });
            Ok::<_, SyncError>((previous, current))
        })?;

        if !current.is_synced() {
            return Ok(Mutation::new(current, WriteStatus::SavedLocally));
        }

        match self.push_update(record_type, current.clone()).await {
            Ok(status) => Ok(Mutation::new(current, status)),
            Err(err) => {
                self.transact(|state| {
                    let Some(record) = state.find_mut(record_type, id) else {
                        return;
                    };
                    // Only roll back if nothing changed it since
                    if record.updated_at == current.updated_at && record.fields == current.fields {
                        *record = previous;
                        state.outbox.push(SyncEvent::RecordChanged {
                            record_type,
                            id: id.to_string(),
                        });
                    }
                });
                Err(err)
            }
        }
    }

    /// Send a synced record's current state, queueing it on network failure
    async fn push_update(&self, record_type: RecordType, record: Record) -> Result<WriteStatus> {
        let Some(remote_id) = record.remote_id.clone() else {
            return Ok(WriteStatus::SavedLocally);
        };

        if self.connectivity().is_offline() {
            self.queue_update(record_type, record);
            return Ok(WriteStatus::SavedLocally);
        }

        let payload = record.to_payload();
        let label = format!("update {}", record_type);
        match self
            .call(&label, || {
                self.inner.remote.update(record_type, &remote_id, &payload)
            })
            .await
        {
            Ok(_) => Ok(WriteStatus::Synced),
            Err(err) if err.is_network_class() => {
                self.queue_update(record_type, record);
                Ok(WriteStatus::SavedLocally)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn queue_update(&self, record_type: RecordType, record: Record) {
        self.transact(|state| {
            state.outbox.push(SyncEvent::SavedLocally {
                record_type,
                id: record.id.clone(),
                kind: "update",
            });
            state.enqueue(PendingOperation::new(
                record_type,
                record.id.clone(),
                Operation::Update { record },
            ));
        });
    }

    /// Delete a record locally, then on the server if it ever got there.
    pub async fn delete(&self, record_type: RecordType, id: &str) -> Result<Mutation> {
        let removed = self.transact(|state| {
            let record = state
                .remove(record_type, id)
                .ok_or_else(|| not_found(record_type, id))?;
            if !record.is_synced() {
                let dropped = state.remove_ops_for(record_type, id);
                debug!("Dropped {} pending operations for never-synced {} {}", dropped, record_type, id);
            }
            state.outbox.push(SyncEvent::RecordRemoved {
                record_type,
                id: id.to_string(),
            });
            Ok::<_, SyncError>(record)
        })?;

        let Some(remote_id) = removed.remote_id.clone() else {
            return Ok(Mutation::new(removed, WriteStatus::LocalOnly));
        };

        if self.connectivity().is_offline() {
            self.queue_delete(record_type, id, remote_id);
            return Ok(Mutation::new(removed, WriteStatus::SavedLocally));
        }

        let label = format!("delete {}", record_type);
        match self
            .call(&label, || self.inner.remote.delete(record_type, &remote_id))
            .await
        {
            Ok(()) | Err(RemoteError::Rejected { status: 404, .. }) => {
                self.transact(|state| state.prune_updates(record_type, id));
                Ok(Mutation::new(removed, WriteStatus::Synced))
            }
            Err(err) if err.is_network_class() => {
                self.queue_delete(record_type, id, remote_id);
                Ok(Mutation::new(removed, WriteStatus::SavedLocally))
            }
            Err(err) => {
                warn!("Server refused to delete {} {}: {}", record_type, id, err);
                self.transact(|state| {
                    if state.find(record_type, id).is_none() {
                        state.insert(record_type, removed.clone());
                        state.outbox.push(SyncEvent::RecordChanged {
                            record_type,
                            id: id.to_string(),
                        });
                    }
                });
                Err(err.into())
            }
        }
    }

    fn queue_delete(&self, record_type: RecordType, local_id: &str, remote_id: String) {
        self.transact(|state| {
            state.prune_updates(record_type, local_id);
            state.enqueue(PendingOperation::new(
                record_type,
                local_id,
                Operation::Delete { remote_id },
            ));
            state.outbox.push(SyncEvent::SavedLocally {
                record_type,
                id: local_id.to_string(),
                kind: "delete",
            });
        });
    }

    /// Best-effort remote delete of a record that no longer exists locally
    async fn delete_remote(&self, record_type: RecordType, local_id: &str, remote_id: String) {
        let label = format!("delete {}", record_type);
        match self
            .call(&label, || self.inner.remote.delete(record_type, &remote_id))
            .await
        {
            Ok(()) | Err(RemoteError::Rejected { .. }) => {}
            Err(_) => self.queue_delete(record_type, local_id, remote_id),
        }
    }
}

fn not_found(record_type: RecordType, id: &str) -> SyncError {
    SyncError::NotFound {
        record_type,
        id: id.to_string(),
    }
}

/// Spawn on the ambient runtime, if there is one
fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => debug!("No tokio runtime; skipping background task"),
    }
}
