//! Shared test helpers: a scripted in-memory RemoteApi and engine setup.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use jobtrack_sync::models::BulkSyncResponse;
use jobtrack_sync::{
    BulkSnapshot, Config, Fields, MemoryStore, RecordType, RemoteApi, RemoteError, RemoteRecord,
    SyncEngine,
};

pub type TestEngine = SyncEngine<Arc<FakeRemote>, Arc<MemoryStore>>;

/// In-memory backend with switchable failure modes
#[derive(Default)]
pub struct FakeRemote {
    offline: AtomicBool,
    /// Drop off the network right after the next successful create
    offline_after_create: AtomicBool,
    /// Answer every call with this 5xx status
    server_error: Mutex<Option<u16>>,
    /// Status for the next create/update/delete, e.g. 400
    reject_next: Mutex<Option<(u16, String)>>,
    records: Mutex<HashMap<RecordType, Vec<RemoteRecord>>>,
    next_id: AtomicUsize,
    calls: Mutex<Vec<String>>,
    /// When set, creates wait here until released
    create_gate: Mutex<Option<Arc<Notify>>>,
    /// Signalled when a create reaches the gate
    pub create_entered: Notify,
    /// When set, lists take their snapshot and then wait here
    list_gate: Mutex<Option<Arc<Notify>>>,
    /// Signalled when a list reaches the gate
    pub list_entered: Notify,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn go_offline_after_next_create(&self) {
        self.offline_after_create.store(true, Ordering::SeqCst);
    }

    pub fn set_server_error(&self, status: Option<u16>) {
        *self.server_error.lock() = status;
    }

    pub fn reject_next(&self, status: u16, message: &str) {
        *self.reject_next.lock() = Some((status, message.to_string()));
    }

    /// Hold creates until the returned Notify is signalled
    pub fn hold_creates(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.create_gate.lock() = Some(gate.clone());
        gate
    }

    /// Hold the next list after it has read the server's records
    pub fn hold_lists(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.list_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn stored(&self, record_type: RecordType) -> Vec<RemoteRecord> {
        self.records.lock().get(&record_type).cloned().unwrap_or_default()
    }

    /// Put a record on the server behind the engine's back
    pub fn seed(&self, record_type: RecordType, fields: Value) -> String {
        let id = self.fresh_id();
        let mut body = fields;
        body["id"] = Value::String(id.clone());
        let record = RemoteRecord::try_from(body).expect("seed record");
        self.records.lock().entry(record_type).or_default().push(record);
        id
    }

    fn fresh_id(&self) -> String {
        format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Connect("connection refused".into()));
        }
        if let Some(status) = *self.server_error.lock() {
            return Err(RemoteError::Server {
                status,
                message: "internal error".into(),
            });
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), RemoteError> {
        self.check()?;
        match self.reject_next.lock().take() {
            Some((status, message)) => Err(RemoteError::Rejected { status, message }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn health(&self) -> Result<(), RemoteError> {
        self.log("health".into());
        self.check()
    }

    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.log(format!("list {}", record_type));
        self.check()?;
        let snapshot = self.stored(record_type);

        let gate = self.list_gate.lock().take();
        if let Some(gate) = gate {
            self.list_entered.notify_one();
            gate.notified().await;
        }
        Ok(snapshot)
    }

    async fn create(
        &self,
        record_type: RecordType,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        self.log(format!("create {}", record_type));

        let gate = self.create_gate.lock().take();
        if let Some(gate) = gate {
            self.create_entered.notify_one();
            gate.notified().await;
        }

        self.check_write()?;
        let mut body = payload.clone();
        body["id"] = Value::String(self.fresh_id());
        let record = RemoteRecord::try_from(body).map_err(RemoteError::Decode)?;
        self.records
            .lock()
            .entry(record_type)
            .or_default()
            .push(record.clone());
        if self.offline_after_create.swap(false, Ordering::SeqCst) {
            self.set_offline(true);
        }
        Ok(record)
    }

    async fn update(
        &self,
        record_type: RecordType,
        remote_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        self.log(format!("update {} {}", record_type, remote_id));
        self.check_write()?;

        let mut records = self.records.lock();
        let record = records
            .entry(record_type)
            .or_default()
            .iter_mut()
            .find(|r| r.id == remote_id)
            .ok_or_else(|| RemoteError::Rejected {
                status: 404,
                message: "not found".into(),
            })?;
        if let Value::Object(fields) = payload {
            for (key, value) in fields {
                if key != "createdAt" && key != "updatedAt" {
                    record.fields.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(record.clone())
    }

    async fn delete(&self, record_type: RecordType, remote_id: &str) -> Result<(), RemoteError> {
        self.log(format!("delete {} {}", record_type, remote_id));
        self.check_write()?;

        let mut records = self.records.lock();
        let list = records.entry(record_type).or_default();
        let before = list.len();
        list.retain(|r| r.id != remote_id);
        if list.len() == before {
            return Err(RemoteError::Rejected {
                status: 404,
                message: "not found".into(),
            });
        }
        Ok(())
    }

    async fn bulk_sync(&self, snapshot: &BulkSnapshot) -> Result<BulkSyncResponse, RemoteError> {
        self.log("sync".into());
        self.check_write()?;

        let mut response = BulkSyncResponse::default();
        let mut records = self.records.lock();
        for record_type in RecordType::ALL {
            let incoming = match record_type {
                RecordType::Application => &snapshot.applications,
                RecordType::Contact => &snapshot.contacts,
            };
            let mut stored = Vec::new();
            let mut echoed = Vec::new();
            for body in incoming {
                let mut body = body.clone();
                if body.get("id").and_then(Value::as_str).is_none() {
                    body["id"] = Value::String(self.fresh_id());
                }
                let mut record = RemoteRecord::try_from(body).map_err(RemoteError::Decode)?;
                echoed.push(record.clone());
                record.take_client_id();
                stored.push(record);
            }
            records.insert(record_type, stored);
            match record_type {
                RecordType::Application => response.applications = echoed,
                RecordType::Contact => response.contacts = echoed,
            }
        }
        Ok(response)
    }
}

/// Config with millisecond backoff so retries do not slow tests down
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 1;
    config.retry.request_timeout_secs = 5;
    config.replay.interval_secs = 1;
    config
}

pub fn engine_with(remote: &Arc<FakeRemote>, store: &Arc<MemoryStore>) -> TestEngine {
    SyncEngine::with_config(remote.clone(), store.clone(), &fast_config())
}

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().expect("object literal")
}

pub fn application(title: &str, company: &str) -> Fields {
    fields(json!({ "jobTitle": title, "company": company, "status": "applied" }))
}

pub fn contact(name: &str) -> Fields {
    fields(json!({ "name": name }))
}
