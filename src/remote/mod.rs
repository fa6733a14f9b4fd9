//! RemoteAPI access: the trait the engine talks to, the reqwest-backed
//! implementation, and the shared retry helper.

pub mod http;
pub mod retry;

pub use http::HttpRemote;
pub use retry::{with_retry, RetryPolicy};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteError;
use crate::models::{BulkSnapshot, BulkSyncResponse, RecordType, RemoteRecord};

/// CRUD backend for records.
///
/// Implementations report raw outcomes; retries and connectivity
/// bookkeeping happen in the engine.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `GET /api/health`
    async fn health(&self) -> Result<(), RemoteError>;

    /// `GET /api/<collection>`
    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// `POST /api/<collection>`
    async fn create(
        &self,
        record_type: RecordType,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError>;

    /// `PUT /api/<collection>/:id`
    async fn update(
        &self,
        record_type: RecordType,
        remote_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError>;

    /// `DELETE /api/<collection>/:id`
    async fn delete(&self, record_type: RecordType, remote_id: &str) -> Result<(), RemoteError>;

    /// `POST /api/sync` - replace every record of the user
    async fn bulk_sync(&self, snapshot: &BulkSnapshot) -> Result<BulkSyncResponse, RemoteError>;
}

#[async_trait]
impl<R: RemoteApi + ?Sized> RemoteApi for std::sync::Arc<R> {
    async fn health(&self) -> Result<(), RemoteError> {
        (**self).health().await
    }

    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>, RemoteError> {
        (**self).list(record_type).await
    }

    async fn create(
        &self,
        record_type: RecordType,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        (**self).create(record_type, payload).await
    }

    async fn update(
        &self,
        record_type: RecordType,
        remote_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        (**self).update(record_type, remote_id, payload).await
    }

    async fn delete(&self, record_type: RecordType, remote_id: &str) -> Result<(), RemoteError> {
        (**self).delete(record_type, remote_id).await
    }

    async fn bulk_sync(&self, snapshot: &BulkSnapshot) -> Result<BulkSyncResponse, RemoteError> {
        (**self).bulk_sync(snapshot).await
    }
}
