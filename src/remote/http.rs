//! HTTP client for the tracker backend.
//!
//! Speaks the JSON REST API under `<base_url>/api`. Every request carries
//! `Content-Type: application/json` and the `x-user-id` header.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::RemoteApi;
use crate::config::Config;
use crate::error::RemoteError;
use crate::models::{BulkSnapshot, BulkSyncResponse, RecordType, RemoteRecord};

const USER_HEADER: &str = "x-user-id";

/// reqwest-backed RemoteApi
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    user_id: String,
}

impl HttpRemote {
    /// Create a new API client
    pub fn new(config: &Config) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| RemoteError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            user_id: config.api.user_id.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(user) = HeaderValue::from_str(&self.user_id) {
            headers.insert(HeaderName::from_static(USER_HEADER), user);
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response, RemoteError> {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, &url).headers(self.headers());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = error_message(response).await;
        Err(classify_status(status, message))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, RemoteError> {
        let response = self.send(method, path, body).await?;
        let bytes = response.bytes().await.map_err(classify_transport)?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

/// Map a reqwest transport failure onto the remote error taxonomy
fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_connect() {
        RemoteError::Connect(err.to_string())
    } else if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else {
        RemoteError::Aborted(err.to_string())
    }
}

/// 4xx is a rejection, except request timeouts and throttling, which are
/// retried and queued like 5xx.
fn classify_status(status: StatusCode, message: String) -> RemoteError {
    let transient = matches!(
        status,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    );
    if status.is_client_error() && !transient {
        RemoteError::Rejected {
            status: status.as_u16(),
            message,
        }
    } else {
        RemoteError::Server {
            status: status.as_u16(),
            message,
        }
    }
}

/// Pull `{"error": "..."}` out of a failed response, falling back to the
/// raw body or the status reason.
async fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string())
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn health(&self) -> Result<(), RemoteError> {
        #[derive(serde::Deserialize)]
        struct HealthResponse {
            status: String,
        }

        let body: HealthResponse = self.send_json(Method::GET, "health", None).await?;
        if body.status.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(RemoteError::Server {
                status: 200,
                message: format!("health status {}", body.status),
            })
        }
    }

    async fn list(&self, record_type: RecordType) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.send_json(Method::GET, record_type.collection(), None).await
    }

    async fn create(
        &self,
        record_type: RecordType,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        self.send_json(Method::POST, record_type.collection(), Some(payload))
            .await
    }

    async fn update(
        &self,
        record_type: RecordType,
        remote_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        let path = format!("{}/{}", record_type.collection(), remote_id);
        self.send_json(Method::PUT, &path, Some(payload)).await
    }

    async fn delete(&self, record_type: RecordType, remote_id: &str) -> Result<(), RemoteError> {
        let path = format!("{}/{}", record_type.collection(), remote_id);
        self.send(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn bulk_sync(&self, snapshot: &BulkSnapshot) -> Result<BulkSyncResponse, RemoteError> {
        let body = serde_json::to_value(snapshot).map_err(|e| RemoteError::Decode(e.to_string()))?;
        self.send_json(Method::POST, "sync", Some(&body)).await
    }
}
