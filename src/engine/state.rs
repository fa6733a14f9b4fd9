//! In-memory record sets and pending queue, plus their write-through to
//! the local store.
//!
//! Everything here is synchronous; the engine mutates it under one lock
//! and flushes dirty keys before releasing that lock.

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use super::events::SyncEvent;
use crate::error::StoreError;
use crate::models::{
    ConnectivityState, Operation, PendingOperation, Record, RecordType, RemoteRecord,
};
use crate::store::{LocalStore, PENDING_KEY};

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    records: [Vec<Record>; 2],
    queue: Vec<PendingOperation>,
    pub(crate) connectivity: ConnectivityState,
    /// Record types already refreshed since initialization
    pub(crate) refreshed: [bool; 2],
    pub(crate) storage_degraded: bool,
    dirty_records: [bool; 2],
    dirty_queue: bool,
    /// Events to emit once the lock is released
    pub(crate) outbox: Vec<SyncEvent>,
}

impl EngineState {
    // ========== Record set ==========

    pub(crate) fn records(&self, record_type: RecordType) -> &[Record] {
        &self.records[record_type.index()]
    }

    pub(crate) fn find(&self, record_type: RecordType, id: &str) -> Option<&Record> {
        self.records(record_type).iter().find(|r| r.id == id)
    }

    /// Mutable access; marks the set dirty
    pub(crate) fn find_mut(&mut self, record_type: RecordType, id: &str) -> Option<&mut Record> {
        let idx = record_type.index();
        let found = self.records[idx].iter_mut().find(|r| r.id == id);
        if found.is_some() {
            self.dirty_records[idx] = true;
        }
        found
    }

    pub(crate) fn insert(&mut self, record_type: RecordType, record: Record) {
        let idx = record_type.index();
        self.records[idx].push(record);
        self.dirty_records[idx] = true;
    }

    pub(crate) fn remove(&mut self, record_type: RecordType, id: &str) -> Option<Record> {
        let idx = record_type.index();
        let pos = self.records[idx].iter().position(|r| r.id == id)?;
        self.dirty_records[idx] = true;
        Some(self.records[idx].remove(pos))
    }

    fn replace_all(&mut self, record_type: RecordType, records: Vec<Record>) {
        let idx = record_type.index();
        self.records[idx] = records;
        self.dirty_records[idx] = true;
    }

    // ========== Pending queue ==========

    pub(crate) fn queue(&self) -> &[PendingOperation] {
        &self.queue
    }

    pub(crate) fn enqueue(&mut self, mut op: PendingOperation) {
        // Keep enqueued_at monotonic so ordering by timestamp equals
        // ordering by insertion.
        if let Some(last) = self.queue.last() {
            if op.enqueued_at < last.enqueued_at {
                op.enqueued_at = last.enqueued_at;
            }
        }
        debug!("Queued {} {} for {}", op.kind(), op.record_type, op.local_id);
        self.queue.push(op);
        self.dirty_queue = true;
    }

    /// Oldest queued operation of a record type
    pub(crate) fn next_pending(&self, record_type: RecordType) -> Option<&PendingOperation> {
        self.queue.iter().find(|op| op.record_type == record_type)
    }

    pub(crate) fn remove_op(&mut self, op_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|op| op.id != op_id);
        let removed = self.queue.len() != before;
        self.dirty_queue |= removed;
        removed
    }

    /// Drop every queued operation for a record; returns how many
    pub(crate) fn remove_ops_for(&mut self, record_type: RecordType, local_id: &str) -> usize {
        let before = self.queue.len();
        self.queue
            .retain(|op| !(op.record_type == record_type && op.local_id == local_id));
        let removed = before - self.queue.len();
        self.dirty_queue |= removed > 0;
        removed
    }

    /// Drop queued updates for a record about to be deleted remotely
    pub(crate) fn prune_updates(&mut self, record_type: RecordType, local_id: &str) {
        let before = self.queue.len();
        self.queue.retain(|op| {
            !(op.record_type == record_type
                && op.local_id == local_id
                && matches!(op.op, Operation::Update { .. }))
        });
        self.dirty_queue |= self.queue.len() != before;
    }

    /// Replace the payload of a still-queued create; false when none is queued
    pub(crate) fn fold_into_create(&mut self, record_type: RecordType, record: &Record) -> bool {
        let pending = self.queue.iter_mut().find(|op| {
            op.record_type == record_type
                && op.local_id == record.id
                && matches!(op.op, Operation::Create { .. })
        });

        match pending {
            Some(op) => {
                op.op = Operation::Create {
                    record: record.clone(),
                };
                self.dirty_queue = true;
                true
            }
            None => false,
        }
    }

    fn has_pending_create(&self, record_type: RecordType, local_id: &str) -> bool {
        self.queue.iter().any(|op| {
            op.record_type == record_type
                && op.local_id == local_id
                && matches!(op.op, Operation::Create { .. })
        })
    }

    // ========== Connectivity ==========

    /// Returns true when this transition brought the engine online
    pub(crate) fn set_connectivity(&mut self, next: ConnectivityState) -> bool {
        let prev = self.connectivity;
        if prev == next {
            return false;
        }
        self.connectivity = next;
        self.outbox.push(SyncEvent::ConnectivityChanged {
            from: prev,
            to: next,
        });
        next.is_online()
    }

    // ========== Bulk transitions ==========

    /// Load caches and queue from the store.
    ///
    /// Corrupt values are discarded; an unreadable store switches to
    /// in-memory mode.
    pub(crate) fn load<S: LocalStore + ?Sized>(&mut self, store: &S) {
        for record_type in RecordType::ALL {
            match read_json::<_, Vec<Record>>(store, record_type.cache_key()) {
                Ok(Some(records)) => self.records[record_type.index()] = records,
                Ok(None) => self.records[record_type.index()].clear(),
                Err(err) => self.load_failed(err),
            }
        }

        match read_json::<_, Vec<PendingOperation>>(store, PENDING_KEY) {
            Ok(Some(mut queue)) => {
                queue.sort_by_key(|op| op.enqueued_at);
                self.queue = queue;
            }
            Ok(None) => self.queue.clear(),
            Err(err) => self.load_failed(err),
        }

        self.refreshed = [false; 2];
        self.dirty_records = [false; 2];
        self.dirty_queue = false;
    }

    fn load_failed(&mut self, err: StoreError) {
        match err {
            StoreError::Corrupt { .. } => warn!("Discarding cached value: {}", err),
            other => self.degrade(other),
        }
    }

    /// Queue a create for every unsynced record that lost its queue entry
    /// (e.g. the process died while the first remote attempt was in flight).
    pub(crate) fn requeue_unsynced(&mut self) -> usize {
        let mut orphans = Vec::new();
        for record_type in RecordType::ALL {
            for record in self.records(record_type) {
                if !record.is_synced() && !self.has_pending_create(record_type, &record.id) {
                    orphans.push((record_type, record.clone()));
                }
            }
        }

        let count = orphans.len();
        for (record_type, record) in orphans {
            let local_id = record.id.clone();
            self.enqueue(PendingOperation::new(
                record_type,
                local_id,
                Operation::Create { record },
            ));
        }
        count
    }

    /// Local ids of records that already carry a server id
    pub(crate) fn synced_ids(&self, record_type: RecordType) -> HashSet<String> {
        self.records(record_type)
            .iter()
            .filter(|r| r.is_synced())
            .map(|r| r.id.clone())
            .collect()
    }

    /// Replace the synced part of a record set with the server's list.
    ///
    /// Unsynced records are kept, records with a queued update keep their
    /// local version, and records with a queued delete stay hidden.
    /// `synced_before` holds the ids that were synced when the list was
    /// requested; a record acknowledged after that and missing from the
    /// list is kept, since the list predates it.
    pub(crate) fn apply_refresh(
        &mut self,
        record_type: RecordType,
        remote: Vec<RemoteRecord>,
        synced_before: &HashSet<String>,
    ) -> usize {
        let current = self.records(record_type);
        let listed: HashSet<String> = remote.iter().map(|r| r.id.clone()).collect();

        let by_remote_id: HashMap<&str, &Record> = current
            .iter()
            .filter_map(|r| r.remote_id.as_deref().map(|rid| (rid, r)))
            .collect();

        let mut locally_edited = HashSet::new();
        let mut locally_deleted = HashSet::new();
        for op in self.queue.iter().filter(|op| op.record_type == record_type) {
            match &op.op {
                Operation::Update { .. } => {
                    locally_edited.insert(op.local_id.as_str());
                }
                Operation::Delete { remote_id } => {
                    locally_deleted.insert(remote_id.as_str());
                }
                Operation::Create { .. } => {}
            }
        }

        let mut next = Vec::with_capacity(remote.len());
        for remote_record in remote {
            if locally_deleted.contains(remote_record.id.as_str()) {
                continue;
            }
            match by_remote_id.get(remote_record.id.as_str()) {
                Some(local) if locally_edited.contains(local.id.as_str()) => {
                    next.push((*local).clone())
                }
                Some(local) => next.push(Record::from_remote(remote_record, Some(local.id.clone()))),
                None => next.push(Record::from_remote(remote_record, None)),
            }
        }

        next.extend(
            current
                .iter()
                .filter(|r| match &r.remote_id {
                    None => true,
                    Some(rid) => !synced_before.contains(&r.id) && !listed.contains(rid),
                })
                .cloned(),
        );

        let count = next.len();
        self.replace_all(record_type, next);
        count
    }

    /// Apply the result of a bulk replace.
    ///
    /// Records are matched back to local ids through the echoed client id;
    /// records created after the snapshot was taken are kept.
    pub(crate) fn apply_bulk(
        &mut self,
        record_type: RecordType,
        remote: Vec<RemoteRecord>,
        sent_ids: &HashSet<String>,
    ) -> usize {
        let mut next = Vec::with_capacity(remote.len());
        for mut remote_record in remote {
            let client_id = remote_record.take_client_id();
            next.push(Record::from_remote(remote_record, client_id));
        }

        let synced = next.len();
        next.extend(
            self.records(record_type)
                .iter()
                .filter(|r| !sent_ids.contains(&r.id))
                .cloned(),
        );
        self.replace_all(record_type, next);
        synced
    }

    // ========== Persistence ==========

    pub(crate) fn degrade(&mut self, err: StoreError) {
        if self.storage_degraded {
            return;
        }
        warn!("Local store failed, continuing in memory only: {}", err);
        self.storage_degraded = true;
        self.outbox.push(SyncEvent::StorageDegraded {
            message: err.to_string(),
        });
    }

    /// Write every dirty key through to the store
    pub(crate) fn flush<S: LocalStore + ?Sized>(&mut self, store: &S) {
        if self.storage_degraded {
            self.dirty_records = [false; 2];
            self.dirty_queue = false;
            return;
        }

        for record_type in RecordType::ALL {
            let idx = record_type.index();
            if !self.dirty_records[idx] {
                continue;
            }
            self.dirty_records[idx] = false;
            if let Err(err) = write_json(store, record_type.cache_key(), &self.records[idx]) {
                self.degrade(err);
                return;
            }
        }

        if self.dirty_queue {
            self.dirty_queue = false;
            if let Err(err) = write_json(store, PENDING_KEY, &self.queue) {
                self.degrade(err);
            }
        }
    }
}

fn read_json<S, T>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    S: LocalStore + ?Sized,
    T: serde::de::DeserializeOwned,
{
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(None),
    }
}

fn write_json<S, T>(store: &S, key: &str, value: &T) -> Result<(), StoreError>
where
    S: LocalStore + ?Sized,
    T: serde::Serialize + ?Sized,
{
    let raw = serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.set(key, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn record(fields: serde_json::Value) -> Record {
        Record::new(fields.as_object().cloned().unwrap())
    }

    fn synced(remote_id: &str, name: &str) -> Record {
        let mut r = record(json!({ "name": name }));
        r.remote_id = Some(remote_id.to_string());
        r
    }

    fn remote(id: &str, name: &str) -> RemoteRecord {
        RemoteRecord::try_from(json!({ "id": id, "name": name })).unwrap()
    }

    #[test]
    fn test_flush_round_trips_through_store() {
        let store = MemoryStore::new();
        let mut state = EngineState::default();
        let r = record(json!({"name": "Ada"}));
        state.insert(RecordType::Contact, r.clone());
        state.enqueue(PendingOperation::new(
            RecordType::Contact,
            r.id.clone(),
            Operation::Create { record: r.clone() },
        ));
        state.flush(&store);

        let mut reloaded = EngineState::default();
        reloaded.load(&store);
        assert_eq!(reloaded.records(RecordType::Contact), &[r]);
        assert_eq!(reloaded.queue().len(), 1);
        assert!(reloaded.records(RecordType::Application).is_empty());
    }

    #[test]
    fn test_refresh_keeps_unsynced_and_locally_edited_records() {
        let mut state = EngineState::default();
        let kept_local = synced("s1", "edited locally");
        let replaced = synced("s2", "stale");
        let deleted = synced("s3", "deleted locally");
        let unsynced = record(json!({"name": "offline draft"}));

        for r in [&kept_local, &replaced, &unsynced] {
            state.insert(RecordType::Contact, r.clone());
        }
        state.enqueue(PendingOperation::new(
            RecordType::Contact,
            kept_local.id.clone(),
            Operation::Update { record: kept_local.clone() },
        ));
        state.enqueue(PendingOperation::new(
            RecordType::Contact,
            deleted.id.clone(),
            Operation::Delete { remote_id: "s3".into() },
        ));

        let synced_before = state.synced_ids(RecordType::Contact);
        let count = state.apply_refresh(
            RecordType::Contact,
            vec![
                remote("s1", "server copy"),
                remote("s2", "fresh"),
                remote("s3", "deleted locally"),
                remote("s4", "new on server"),
            ],
            &synced_before,
        );
        assert_eq!(count, 4);

        let records = state.records(RecordType::Contact);
        let by_remote = |rid: &str| records.iter().find(|r| r.remote_id.as_deref() == Some(rid));

        assert_eq!(by_remote("s1").unwrap().field_str("name"), Some("edited locally"));
        let fresh = by_remote("s2").unwrap();
        assert_eq!(fresh.field_str("name"), Some("fresh"));
        assert_eq!(fresh.id, replaced.id);
        assert!(by_remote("s3").is_none());
        assert!(by_remote("s4").is_some());
        assert!(records.iter().any(|r| r.id == unsynced.id));
    }

    #[test]
    fn test_refresh_keeps_records_acknowledged_during_the_fetch() {
        let mut state = EngineState::default();
        let gone = synced("s1", "deleted on server");
        let mut late = record(json!({"name": "created during fetch"}));
        state.insert(RecordType::Contact, gone.clone());
        state.insert(RecordType::Contact, late.clone());

        let synced_before = state.synced_ids(RecordType::Contact);
        assert_eq!(synced_before.len(), 1);

        // Acknowledged while the list request was in flight
        late.remote_id = Some("s2".into());
        *state.find_mut(RecordType::Contact, &late.id).unwrap() = late.clone();

        let count = state.apply_refresh(RecordType::Contact, vec![], &synced_before);
        assert_eq!(count, 1);
        let records = state.records(RecordType::Contact);
        assert_eq!(records[0].id, late.id);
        assert_eq!(records[0].remote_id.as_deref(), Some("s2"));
        assert!(state.find(RecordType::Contact, &gone.id).is_none());
    }

    #[test]
    fn test_fold_into_create_replaces_payload() {
        let mut state = EngineState::default();
        let mut r = record(json!({"jobTitle": "Eng"}));
        state.enqueue(PendingOperation::new(
            RecordType::Application,
            r.id.clone(),
            Operation::Create { record: r.clone() },
        ));

        r.merge(json!({"status": "interview"}).as_object().cloned().unwrap());
        assert!(state.fold_into_create(RecordType::Application, &r));
        assert_eq!(state.queue().len(), 1);
        match &state.queue()[0].op {
            Operation::Create { record } => assert_eq!(record.field_str("status"), Some("interview")),
            other => panic!("unexpected op {:?}", other),
        }

        let other = record(json!({}));
        assert!(!state.fold_into_create(RecordType::Application, &other));
    }

    #[test]
    fn test_requeue_unsynced_restores_missing_creates() {
        let mut state = EngineState::default();
        let draft = record(json!({"name": "draft"}));
        state.insert(RecordType::Contact, draft.clone());
        state.insert(RecordType::Contact, synced("s1", "done"));

        assert_eq!(state.requeue_unsynced(), 1);
        assert_eq!(state.requeue_unsynced(), 0);
        assert_eq!(state.queue()[0].local_id, draft.id);
    }

    #[test]
    fn test_quota_failure_degrades_once() {
        let store = MemoryStore::with_quota(16);
        let mut state = EngineState::default();
        state.insert(RecordType::Contact, record(json!({"name": "a long enough name"})));
        state.flush(&store);
        state.insert(RecordType::Contact, record(json!({"name": "another"})));
        state.flush(&store);

        assert!(state.storage_degraded);
        let degraded_events = state
            .outbox
            .iter()
            .filter(|e| matches!(e, SyncEvent::StorageDegraded { .. }))
            .count();
        assert_eq!(degraded_events, 1);
        assert_eq!(state.records(RecordType::Contact).len(), 2);
    }

    #[test]
    fn test_corrupt_cache_is_discarded() {
        let store = MemoryStore::new();
        store.set(RecordType::Application.cache_key(), "{not json").unwrap();
        let mut state = EngineState::default();
        state.load(&store);
        assert!(state.records(RecordType::Application).is_empty());
        assert!(!state.storage_degraded);
    }
}
