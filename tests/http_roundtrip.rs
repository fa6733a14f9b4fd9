//! End-to-end tests: HttpRemote and the engine against the reference server

use serde_json::json;
use std::sync::Arc;

use jobtrack_sync::server::{create_router, ServerConfig, ServerState};
use jobtrack_sync::{
    Config, ConnectivityState, HttpRemote, MemoryStore, RecordType, RemoteApi, RemoteError,
    SyncEngine, SyncError, WriteStatus,
};

/// Serve a fresh backend on an ephemeral port; returns its base URL
async fn spawn_server() -> (String, Arc<ServerState>) {
    let state = ServerState::new();
    let app = create_router(state.clone(), &ServerConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://{}", addr), state)
}

fn config_for(base_url: &str, user: &str) -> Config {
    let mut config = Config::default();
    config.api.base_url = base_url.to_string();
    config.api.user_id = user.to_string();
    config.api.timeout_secs = 5;
    config.retry.base_delay_ms = 1;
    config.retry.request_timeout_secs = 5;
    config
}

#[tokio::test]
async fn test_remote_crud_against_reference_server() {
    let (base_url, state) = spawn_server().await;
    let remote = HttpRemote::new(&config_for(&base_url, "alice")).unwrap();

    remote.health().await.expect("health check");

    let created = remote
        .create(
            RecordType::Application,
            &json!({"jobTitle": "Eng", "company": "Acme", "status": "applied"}),
        )
        .await
        .unwrap();
    assert!(uuid::Uuid::parse_str(&created.id).is_ok());
    assert_eq!(created.fields["company"], "Acme");
    assert!(created.created_at.is_some());

    let updated = remote
        .update(RecordType::Application, &created.id, &json!({"status": "interview"}))
        .await
        .unwrap();
    assert_eq!(updated.fields["status"], "interview");
    assert_eq!(updated.fields["jobTitle"], "Eng");

    let listed = remote.list(RecordType::Application).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(state.count("alice", RecordType::Application).await, 1);
    assert_eq!(state.count("default", RecordType::Application).await, 0);

    remote.delete(RecordType::Application, &created.id).await.unwrap();
    let err = remote
        .delete(RecordType::Application, &created.id)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Rejected { status: 404, .. }));
}

#[tokio::test]
async fn test_validation_errors_carry_the_server_message() {
    let (base_url, _state) = spawn_server().await;
    let remote = HttpRemote::new(&config_for(&base_url, "bob")).unwrap();

    let err = remote
        .create(RecordType::Contact, &json!({"email": "nobody@example.com"}))
        .await
        .unwrap_err();
    match err {
        RemoteError::Rejected { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "Name is required");
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_engine_round_trip() {
    let (base_url, state) = spawn_server().await;
    let config = config_for(&base_url, "carol");
    let remote = HttpRemote::new(&config).unwrap();
    let engine = SyncEngine::with_config(remote, Arc::new(MemoryStore::new()), &config);

    assert_eq!(engine.initialize().await, ConnectivityState::Online);

    let ada = engine
        .create(RecordType::Contact, json!({"name": "Ada"}).as_object().cloned().unwrap())
        .await
        .unwrap();
    assert_eq!(ada.status, WriteStatus::Synced);
    assert!(ada.record.remote_id.is_some());

    let edited = engine
        .update(
            RecordType::Contact,
            &ada.record.id,
            json!({"email": "ada@example.com"}).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(edited.status, WriteStatus::Synced);

    let err = engine
        .create(RecordType::Application, json!({"jobTitle": "Eng"}).as_object().cloned().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation { status: 400, .. }));
    assert!(engine.list(RecordType::Application).is_empty());

    engine.refresh(RecordType::Contact).await.unwrap();
    let contacts = engine.list(RecordType::Contact);
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, ada.record.id);
    assert_eq!(contacts[0].field_str("email"), Some("ada@example.com"));

    let report = engine.bulk_sync().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(state.count("carol", RecordType::Contact).await, 1);
    let after = engine.list(RecordType::Contact);
    assert_eq!(after[0].id, ada.record.id);
    assert_eq!(after[0].remote_id, ada.record.remote_id);

    let deleted = engine.delete(RecordType::Contact, &ada.record.id).await.unwrap();
    assert_eq!(deleted.status, WriteStatus::Synced);
    assert_eq!(state.count("carol", RecordType::Contact).await, 0);
}
