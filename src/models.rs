//! Data models for the sync layer
//!
//! Records are kept generic: the engine never looks inside `fields`,
//! it only tracks identity, timestamps and sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

/// Domain attributes of a record (job title, company, email, ...)
pub type Fields = Map<String, Value>;

/// Kinds of records tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Application,
    Contact,
}

impl RecordType {
    pub const ALL: [RecordType; 2] = [RecordType::Application, RecordType::Contact];

    /// REST collection name (`/api/<collection>`)
    pub fn collection(&self) -> &'static str {
        match self {
            RecordType::Application => "applications",
            RecordType::Contact => "contacts",
        }
    }

    /// LocalStore key holding the cached record set
    pub fn cache_key(&self) -> &'static str {
        match self {
            RecordType::Application => "applicationCache",
            RecordType::Contact => "contactCache",
        }
    }

    pub fn from_collection(collection: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.collection() == collection)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            RecordType::Application => 0,
            RecordType::Contact => 1,
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordType::Application => write!(f, "application"),
            RecordType::Contact => write!(f, "contact"),
        }
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "application" | "applications" => Ok(RecordType::Application),
            "contact" | "contacts" => Ok(RecordType::Contact),
            other => Err(format!("unknown record type: {}", other)),
        }
    }
}

/// The engine's belief about RemoteAPI reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Before the first health check
    #[default]
    Unknown,
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, ConnectivityState::Offline)
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Unknown => write!(f, "unknown"),
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::Offline => write!(f, "offline"),
        }
    }
}

/// A tracked domain entity (application or contact)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Client-generated ULID, assigned before any network round trip
    pub id: String,

    /// Server-assigned id; absent while the record is pending sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,

    #[serde(default)]
    pub fields: Fields,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Create a new, never-synced record
    pub fn new(fields: Fields) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new().to_string(),
            remote_id: None,
            fields,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a local record from the server shape.
    ///
    /// `local_id` keeps the identity of a record the client already knows.
    pub fn from_remote(remote: RemoteRecord, local_id: Option<String>) -> Self {
        let now = Utc::now();
        let created_at = remote.created_at.unwrap_or(now);
        Self {
            id: local_id.unwrap_or_else(|| Ulid::new().to_string()),
            remote_id: Some(remote.id),
            fields: remote.fields,
            created_at,
            updated_at: remote.updated_at.unwrap_or(created_at),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Merge `fields` into this record and bump `updated_at`
    pub fn merge(&mut self, fields: Fields) {
        for (key, value) in fields {
            self.fields.insert(key, value);
        }
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Look up a string field
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// The JSON body sent to the server: fields plus timestamps, client id
    /// stripped.
    pub fn to_payload(&self) -> Value {
        let mut body = self.fields.clone();
        body.remove("id");
        body.remove("_id");
        body.insert("createdAt".into(), Value::String(self.created_at.to_rfc3339()));
        body.insert("updatedAt".into(), Value::String(self.updated_at.to_rfc3339()));
        Value::Object(body)
    }
}

/// A record as the server returns it.
///
/// The server id may arrive as `id` or `_id`, as a string or a number.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub fields: Fields,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteRecord {
    /// Remove and return the echoed client id (bulk sync responses)
    pub fn take_client_id(&mut self) -> Option<String> {
        match self.fields.remove("clientId") {
            Some(Value::String(id)) => Some(id),
            _ => None,
        }
    }
}

fn take_timestamp(fields: &mut Fields, key: &str) -> Option<DateTime<Utc>> {
    let parsed = fields
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    if parsed.is_some() {
        fields.remove(key);
    }
    parsed
}

impl TryFrom<Value> for RemoteRecord {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut fields) = value else {
            return Err("expected a JSON object".to_string());
        };

        let raw_id = fields
            .remove("id")
            .or_else(|| fields.remove("_id"))
            .ok_or_else(|| "record has no id".to_string())?;

        let id = match raw_id {
            Value::String(s) if !s.is_empty() => s,
            Value::Number(n) => n.to_string(),
            other => return Err(format!("unusable record id: {}", other)),
        };

        let created_at = take_timestamp(&mut fields, "createdAt");
        let updated_at = take_timestamp(&mut fields, "updatedAt");

        Ok(Self {
            id,
            fields,
            created_at,
            updated_at,
        })
    }
}

impl From<RemoteRecord> for Value {
    fn from(record: RemoteRecord) -> Self {
        let mut body = record.fields;
        body.insert("id".into(), Value::String(record.id));
        if let Some(ts) = record.created_at {
            body.insert("createdAt".into(), Value::String(ts.to_rfc3339()));
        }
        if let Some(ts) = record.updated_at {
            body.insert("updatedAt".into(), Value::String(ts.to_rfc3339()));
        }
        Value::Object(body)
    }
}

impl Serialize for RemoteRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RemoteRecord {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        RemoteRecord::try_from(value).map_err(serde::de::Error::custom)
    }
}

/// The mutation a queued entry will replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Operation {
    /// Full record to create remotely
    Create { record: Record },
    /// Full record to push over an existing remote one
    Update { record: Record },
    Delete {
        #[serde(rename = "remoteId")]
        remote_id: String,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
        }
    }
}

/// A queued, not-yet-acknowledged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Identity of this queue entry
    pub id: String,
    pub record_type: RecordType,
    /// Client id of the record this operation belongs to
    pub local_id: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub op: Operation,
}

impl PendingOperation {
    pub fn new(record_type: RecordType, local_id: impl Into<String>, op: Operation) -> Self {
        Self {
            id: Ulid::new().to_string(),
            record_type,
            local_id: local_id.into(),
            enqueued_at: Utc::now(),
            op,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.op.kind()
    }
}

/// Payload of `POST /api/sync`: every record for the user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSnapshot {
    pub applications: Vec<Value>,
    pub contacts: Vec<Value>,
    #[serde(default)]
    pub resumes: Vec<Value>,
}

impl BulkSnapshot {
    pub fn records_mut(&mut self, record_type: RecordType) -> &mut Vec<Value> {
        match record_type {
            RecordType::Application => &mut self.applications,
            RecordType::Contact => &mut self.contacts,
        }
    }
}

/// Response of `POST /api/sync`: the stored records with server ids
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSyncResponse {
    #[serde(default)]
    pub applications: Vec<RemoteRecord>,
    #[serde(default)]
    pub contacts: Vec<RemoteRecord>,
}

impl BulkSyncResponse {
    pub fn take(&mut self, record_type: RecordType) -> Vec<RemoteRecord> {
        match record_type {
            RecordType::Application => std::mem::take(&mut self.applications),
            RecordType::Contact => std::mem::take(&mut self.contacts),
        }
    }
}
