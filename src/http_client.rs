use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::RefreshCoordinator;
use crate::error::ApiError;

/// Captured parameters of an outbound API call.
///
/// Requests are plain data so they can be parked in a replay queue and
/// re-issued with a different credential.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    id: Uuid,
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }
}

/// A successful response, fully buffered
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ApiResponse {
    /// Build a response by hand (transports other than HTTP, tests)
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .context("Failed to parse response body")
            .map_err(ApiError::Internal)
    }
}

/// Puts a request on the wire with a given access credential.
///
/// Implementations classify failures: HTTP 401 becomes
/// [`ApiError::AuthExpired`], other non-success statuses become
/// [`ApiError::Server`], transport failures become [`ApiError::Network`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, ApiError>;
}

/// reqwest-backed transport with connection pooling
pub struct HttpTransport {
    /// Shared HTTP client with connection pooling
    client: Client,

    base_url: String,
}

impl HttpTransport {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build the shared reqwest client
    pub fn build_client(
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Client> {
        Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);

        let mut builder = self.client.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name: {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}", name))?;
            builder = builder.header(name, value);
        }
        if let Some(token) = access_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        tracing::debug!(
            request_id = %request.id,
            method = %request.method,
            url = %url,
            authenticated = access_token.is_some(),
            "Sending HTTP request"
        );

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = ApiError::from_transport(&e);
                tracing::warn!(
                    request_id = %request.id,
                    error = %error,
                    url = %url,
                    "HTTP request error"
                );
                return Err(error);
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        tracing::debug!(request_id = %request.id, status = %status, "Received HTTP response");

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| ApiError::from_transport(&e))?;
            return Ok(ApiResponse {
                status,
                headers,
                body: body.to_vec(),
            });
        }

        let error_text = response.text().await.unwrap_or_default();
        let error = ApiError::from_status(status, &error_text);
        if !matches!(error, ApiError::AuthExpired) {
            tracing::warn!(
                request_id = %request.id,
                status = status.as_u16(),
                url = %url,
                response_body = %error_text,
                "HTTP request failed with error response"
            );
        }
        Err(error)
    }
}

/// Dispatches API calls with the current access credential.
///
/// An expired credential is never handled here: the request is handed to the
/// [`RefreshCoordinator`], which owns renewal and replay, and the caller sees
/// whatever the coordinator resolves it with.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, coordinator: RefreshCoordinator) -> Self {
        Self {
            transport,
            coordinator,
        }
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let sent_with = self.coordinator.snapshot();

        match self
            .transport
            .execute(&request, sent_with.access_token.as_deref())
            .await
        {
            Err(ApiError::AuthExpired) => {
                tracing::debug!(
                    request_id = %request.id,
                    path = %request.path,
                    "Access credential rejected, handing request to refresh coordinator"
                );
                self.coordinator
                    .handle_expired(request, sent_with)
                    .await
            }
            other => other,
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::post(path).with_json(to_value(body)?))
            .await
    }

    pub async fn put_json<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::put(path).with_json(to_value(body)?))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::delete(path)).await
    }
}

fn to_value<B: Serialize>(body: &B) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(body)
        .context("Failed to serialize request body")
        .map_err(ApiError::Internal)
}
