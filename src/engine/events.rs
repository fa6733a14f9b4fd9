//! Change notifications emitted by the engine.
//!
//! Renderers subscribe with a callback; the engine never calls into UI
//! code directly.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::models::{ConnectivityState, RecordType};

/// Sync engine events
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Cached records and queue loaded from the local store
    CacheLoaded {
        applications: usize,
        contacts: usize,
        pending: usize,
    },
    /// Connectivity belief changed
    ConnectivityChanged {
        from: ConnectivityState,
        to: ConnectivityState,
    },
    /// A record was created or edited locally
    RecordChanged { record_type: RecordType, id: String },
    /// The server acknowledged a record and assigned its id
    RecordSynced {
        record_type: RecordType,
        id: String,
        remote_id: String,
    },
    /// Saved locally, will sync later
    SavedLocally {
        record_type: RecordType,
        id: String,
        kind: &'static str,
    },
    /// A record left the local set
    RecordRemoved { record_type: RecordType, id: String },
    /// The server refused a queued operation; it was dropped
    OperationRejected {
        record_type: RecordType,
        local_id: String,
        kind: &'static str,
        message: String,
    },
    /// A remote refresh replaced the local set
    Refreshed { record_type: RecordType, count: usize },
    /// A replay pass finished
    ReplayCompleted { succeeded: usize, failed: usize },
    /// The local store failed; the engine continues in memory only
    StorageDegraded { message: String },
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: RwLock<Vec<Callback>>,
}

impl EventBus {
    pub(crate) fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(callback));
    }

    pub(crate) fn emit(&self, event: &SyncEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let subscribers: Vec<Callback> = self.subscribers.read().clone();
        for callback in subscribers {
            callback(event);
        }
    }
}
