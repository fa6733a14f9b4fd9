//! Reference backend - the REST API the sync engine talks to.
//!
//! Keeps every user's records in memory, keyed by the `x-user-id` header.
//!
//! # Endpoints
//!
//! - `GET  /api/health`
//! - `GET  /api/{applications,contacts}`
//! - `POST /api/{applications,contacts}`
//! - `PUT  /api/{applications,contacts}/:id`
//! - `DELETE /api/{applications,contacts}/:id`
//! - `POST /api/sync` - replace all of a user's records
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin sync-server -- --port 3000
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::RecordType;

const DEFAULT_USER: &str = "default";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Whether to enable CORS for web clients
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            enable_cors: true,
        }
    }
}

/// One user's collections
#[derive(Debug, Default)]
struct UserData {
    applications: Vec<Map<String, Value>>,
    contacts: Vec<Map<String, Value>>,
}

impl UserData {
    fn records(&self, record_type: RecordType) -> &Vec<Map<String, Value>> {
        match record_type {
            RecordType::Application => &self.applications,
            RecordType::Contact => &self.contacts,
        }
    }

    fn records_mut(&mut self, record_type: RecordType) -> &mut Vec<Map<String, Value>> {
        match record_type {
            RecordType::Application => &mut self.applications,
            RecordType::Contact => &mut self.contacts,
        }
    }
}

/// Shared server state
#[derive(Debug, Default)]
pub struct ServerState {
    users: RwLock<HashMap<String, UserData>>,
}

impl ServerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of records stored for a user
    pub async fn count(&self, user: &str, record_type: RecordType) -> usize {
        self.users
            .read()
            .await
            .get(user)
            .map(|data| data.records(record_type).len())
            .unwrap_or(0)
    }
}

/// Error body: `{ "error": "..." }`
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Bulk sync request body
#[derive(Debug, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    applications: Vec<Value>,
    #[serde(default)]
    contacts: Vec<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    resumes: Vec<Value>,
}

/// Create the API router
pub fn create_router(state: Arc<ServerState>, config: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/:collection", get(list_handler).post(create_handler))
        .route(
            "/api/:collection/:id",
            put(update_handler).delete(delete_handler),
        )
        .layer(TraceLayer::new_for_http());

    let router = if config.enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_USER)
        .to_string()
}

fn collection(name: &str) -> ApiResult<RecordType> {
    RecordType::from_collection(name)
        .ok_or_else(|| ApiError::not_found(format!("Unknown collection: {}", name)))
}

fn non_empty(body: &Map<String, Value>, key: &str) -> bool {
    body.get(key)
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty())
}

/// Required fields per record type
fn validate(record_type: RecordType, body: &Map<String, Value>) -> ApiResult<()> {
    match record_type {
        RecordType::Application => {
            if !non_empty(body, "jobTitle") || !non_empty(body, "company") {
                return Err(ApiError::bad_request("Job title and company are required"));
            }
        }
        RecordType::Contact => {
            if !non_empty(body, "name") {
                return Err(ApiError::bad_request("Name is required"));
            }
        }
    }
    Ok(())
}

fn as_object(body: Value) -> ApiResult<Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::bad_request("Expected a JSON object")),
    }
}

/// Assign server id and timestamps to an incoming record
fn stamp(mut body: Map<String, Value>, id: Option<String>) -> Map<String, Value> {
    let now = Value::String(Utc::now().to_rfc3339());
    body.remove("_id");
    body.insert(
        "id".into(),
        Value::String(id.unwrap_or_else(|| Uuid::new_v4().to_string())),
    );
    body.entry("createdAt").or_insert_with(|| now.clone());
    body.insert("updatedAt".into(), now);
    body
}

fn record_id(record: &Map<String, Value>) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "OK",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Map<String, Value>>>> {
    let record_type = collection(&name)?;
    let users = state.users.read().await;
    let records = users
        .get(&user_id(&headers))
        .map(|data| data.records(record_type).clone())
        .unwrap_or_default();
    Ok(Json(records))
}

async fn create_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Map<String, Value>>)> {
    let record_type = collection(&name)?;
    let mut body = as_object(body)?;
    validate(record_type, &body)?;
    body.remove("id");
    let record = stamp(body, None);

    let user = user_id(&headers);
    debug!("Creating {} for {}", record_type, user);
    state
        .users
        .write()
        .await
        .entry(user)
        .or_default()
        .records_mut(record_type)
        .push(record.clone());

    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_handler(
    State(state): State<Arc<ServerState>>,
    Path((name, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Map<String, Value>>> {
    let record_type = collection(&name)?;
    let body = as_object(body)?;

    let mut users = state.users.write().await;
    let record = users
        .get_mut(&user_id(&headers))
        .and_then(|data| {
            data.records_mut(record_type)
                .iter_mut()
                .find(|r| record_id(r) == Some(id.as_str()))
        })
        .ok_or_else(|| ApiError::not_found(format!("{} not found", record_type)))?;

    let mut merged = record.clone();
    for (key, value) in body {
        if key != "id" && key != "_id" && key != "createdAt" {
            merged.insert(key, value);
        }
    }
    validate(record_type, &merged)?;
    merged.insert("updatedAt".into(), Value::String(Utc::now().to_rfc3339()));

    *record = merged.clone();
    Ok(Json(merged))
}

async fn delete_handler(
    State(state): State<Arc<ServerState>>,
    Path((name, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let record_type = collection(&name)?;

    let mut users = state.users.write().await;
    let records = users
        .get_mut(&user_id(&headers))
        .map(|data| data.records_mut(record_type))
        .ok_or_else(|| ApiError::not_found(format!("{} not found", record_type)))?;

    let pos = records
        .iter()
        .position(|r| record_id(r) == Some(id.as_str()))
        .ok_or_else(|| ApiError::not_found(format!("{} not found", record_type)))?;
    records.remove(pos);

    Ok(Json(json!({ "message": format!("{} deleted", record_type) })))
}

/// Replace every record of the user, echoing `clientId` back
async fn sync_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Json<Value>> {
    let mut incoming = HashMap::new();
    incoming.insert(RecordType::Application, request.applications);
    incoming.insert(RecordType::Contact, request.contacts);

    let mut data = UserData::default();
    let mut echoed = Map::new();

    for record_type in RecordType::ALL {
        let mut out = Vec::new();
        for body in incoming.remove(&record_type).unwrap_or_default() {
            let mut body = as_object(body)?;
            validate(record_type, &body)?;

            let client_id = body.remove("clientId");
            let id = body
                .remove("id")
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty());
            let stored = stamp(body, id);

            let mut reply = stored.clone();
            if let Some(client_id) = client_id {
                reply.insert("clientId".into(), client_id);
            }
            data.records_mut(record_type).push(stored);
            out.push(Value::Object(reply));
        }
        echoed.insert(record_type.collection().to_string(), Value::Array(out));
    }

    let user = user_id(&headers);
    info!(
        "Bulk sync for {}: {} applications, {} contacts",
        user,
        data.applications.len(),
        data.contacts.len()
    );
    state.users.write().await.insert(user, data);

    Ok(Json(Value::Object(echoed)))
}

/// Start the reference backend
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let app = create_router(ServerState::new(), &config);
    let addr = format!("{}:{}", config.host, config.port);

    info!("Starting job tracker API");
    info!("   Listening on: http://{}", addr);
    info!("   CORS: {}", if config.enable_cors { "enabled" } else { "disabled" });

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validation_rules() {
        assert!(validate(RecordType::Application, &object(json!({"jobTitle": "Eng", "company": "Acme"}))).is_ok());
        assert!(validate(RecordType::Application, &object(json!({"jobTitle": "Eng"}))).is_err());
        assert!(validate(RecordType::Application, &object(json!({"jobTitle": " ", "company": "Acme"}))).is_err());
        assert!(validate(RecordType::Contact, &object(json!({"name": "Ada"}))).is_ok());
        assert!(validate(RecordType::Contact, &object(json!({"email": "a@b.c"}))).is_err());
    }

    #[test]
    fn test_stamp_assigns_uuid_and_keeps_created_at() {
        let stamped = stamp(object(json!({"name": "Ada", "createdAt": "2024-01-01T00:00:00Z"})), None);
        let id = record_id(&stamped).unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(stamped["createdAt"], "2024-01-01T00:00:00Z");
        assert!(stamped.contains_key("updatedAt"));

        let kept = stamp(object(json!({"name": "Ada"})), Some("srv-1".into()));
        assert_eq!(record_id(&kept), Some("srv-1"));
    }

    #[test]
    fn test_user_header_defaults() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers), "default");
        headers.insert("x-user-id", "u-42".parse().unwrap());
        assert_eq!(user_id(&headers), "u-42");
    }

    #[tokio::test]
    async fn test_state_counts_per_user() {
        let state = ServerState::new();
        state
            .users
            .write()
            .await
            .entry("u".into())
            .or_default()
            .contacts
            .push(object(json!({"id": "1", "name": "Ada"})));
        assert_eq!(state.count("u", RecordType::Contact).await, 1);
        assert_eq!(state.count("u", RecordType::Application).await, 0);
        assert_eq!(state.count("other", RecordType::Contact).await, 0);
    }
}
