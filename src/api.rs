//! POS backend API client.
//!
//! Provides authenticated HTTP communication with the POS REST backend. Every
//! cashier, table, shift and admin operation goes through [`ApiClient`].

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Keys a response envelope may carry next to `data`.
const ENVELOPE_KEYS: &[&str] = &["data", "success", "message", "meta", "statusCode", "timestamp"];

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
///
/// A trailing `/api` segment is kept since the backend is mounted there.
pub fn normalize_api_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Append URL-encoded query parameters to an API path.
pub fn with_query(path: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    let Ok(mut url) = reqwest::Url::parse("http://localhost") else {
        return path.to_string();
    };
    url.set_path(path);
    url.query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    match url.query() {
        Some(q) if !q.is_empty() => format!("{}?{q}", url.path()),
        _ => url.path().to_string(),
    }
}

/// Percent-encode a single path segment (an id taken from user input or a
/// server payload).
pub fn segment(raw: &str) -> String {
    let Ok(mut url) = reqwest::Url::parse("http://localhost/") else {
        return raw.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(raw.trim());
    }
    url.path().trim_start_matches('/').to_string()
}

/// Reject paths that could escape the API base URL.
fn validate_api_path(path: &str) -> Result<(), ApiError> {
    if !path.starts_with('/') || path.contains("://") || path.contains("..") {
        return Err(ApiError::InvalidPath(path.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Cannot reach POS backend at {url}")]
    Connect { url: String },
    #[error("Connection to {url} timed out")]
    Timeout { url: String },
    #[error("Network error communicating with {url}: {message}")]
    Network { url: String, message: String },
    #[error("{message} (HTTP {status})")]
    Status {
        status: u16,
        message: String,
        details: Option<Value>,
    },
    #[error("Invalid JSON from POS backend: {0}")]
    InvalidJson(String),
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("Invalid API path: {0}")]
    InvalidPath(String),
    #[error("Not logged in")]
    NotAuthenticated,
    #[error("Failed to create HTTP client: {0}")]
    Client(String),
}

impl ApiError {
    /// HTTP status for server-side rejections.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::NotAuthenticated) || self.status() == Some(401)
    }

    /// The request may have reached the backend but its result is unknown:
    /// transport failures, server errors, or an unreadable success body.
    pub fn is_outcome_unknown(&self) -> bool {
        match self {
            ApiError::Connect { .. } | ApiError::Timeout { .. } | ApiError::Network { .. } => true,
            ApiError::InvalidJson(_) => true,
            ApiError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Convert a `reqwest::Error` into a user-friendly error.
fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_connect() {
        return ApiError::Connect {
            url: url.to_string(),
        };
    }
    if err.is_timeout() {
        return ApiError::Timeout {
            url: url.to_string(),
        };
    }
    ApiError::Network {
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        400 => "Request rejected by POS backend".to_string(),
        401 => "Session expired or invalid credentials".to_string(),
        403 => "Not authorized for this action".to_string(),
        404 => "Resource not found".to_string(),
        409 => "Conflict with current server state".to_string(),
        s if s >= 500 => format!("Server error (HTTP {s})"),
        s => format!("Unexpected response from POS backend (HTTP {s})"),
    }
}

/// Build the error for a non-success response, preferring the server's own
/// `error` / `message` text.
fn status_error(status: StatusCode, body_text: &str) -> ApiError {
    let trimmed = body_text.trim();
    let (message, details) = match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => {
            let message = json
                .get("error")
                .and_then(|e| e.as_str().or_else(|| e.get("message").and_then(Value::as_str)))
                .or_else(|| json.get("message").and_then(Value::as_str))
                .map(|s| s.to_string())
                .unwrap_or_else(|| status_message(status));
            let details = json.get("details").or_else(|| json.get("errors")).cloned();
            (message, details)
        }
        Err(_) if !trimmed.is_empty() && trimmed.len() <= 200 => (
            format!("{}: {trimmed}", status_message(status)),
            None,
        ),
        Err(_) => (status_message(status), None),
    };
    ApiError::Status {
        status: status.as_u16(),
        message,
        details,
    }
}

/// Strip `{ "data": ... }` / `{ "success": true, "data": ... }` envelopes.
pub fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut map)
            if map.contains_key("data") && map.keys().all(|k| ENVELOPE_KEYS.contains(&k.as_str())) =>
        {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Authenticated client for the POS backend.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client,
    token: Option<String>,
    branch_id: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;
        Ok(Self {
            base_url: normalize_api_url(base_url),
            client,
            token: None,
            branch_id: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.set_token(Some(token.into()));
        self
    }

    pub fn with_branch(mut self, branch_id: Option<String>) -> Self {
        self.branch_id = branch_id.filter(|b| !b.trim().is_empty());
        self
    }

    /// Replace the bearer token, wiping the previous one from memory.
    pub fn set_token(&mut self, token: Option<String>) {
        if let Some(old) = self.token.as_mut() {
            old.zeroize();
        }
        self.token = token.filter(|t| !t.trim().is_empty());
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }

    /// Perform a request against the backend.
    ///
    /// `path` must include the leading slash, e.g. `/orders/42/confirm`.
    /// `method` is an HTTP verb string: "GET", "POST", "PUT", "PATCH", "DELETE".
    pub async fn fetch(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        self.fetch_with_headers(method, path, body, &[]).await
    }

    /// Same as [`ApiClient::fetch`] with additional request headers.
    pub async fn fetch_with_headers(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, String)],
    ) -> Result<Value, ApiError> {
        validate_api_path(path)?;
        if self.base_url.is_empty() {
            return Err(ApiError::InvalidPath(
                "POS backend URL is not configured".to_string(),
            ));
        }

        let http_method: Method = method
            .to_uppercase()
            .parse()
            .map_err(|_| ApiError::InvalidMethod(method.to_string()))?;
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .client
            .request(http_method.clone(), &full_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(branch_id) = &self.branch_id {
            req = req.header("x-branch-id", branch_id);
        }
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        debug!(method = %http_method, path = %path, "api request");
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = match resp.text().await {
            Ok(text) => text,
            Err(e) if status.is_success() => {
                warn!(method = %http_method, path = %path, error = %e, "failed to read response body");
                return Err(ApiError::Network {
                    url: self.base_url.clone(),
                    message: format!("failed to read response body: {e}"),
                });
            }
            Err(_) => String::new(),
        };

        if !status.is_success() {
            let err = status_error(status, &body_text);
            warn!(method = %http_method, path = %path, status = status.as_u16(), error = %err, "api request failed");
            return Err(err);
        }

        // Null for empty 204 responses.
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let json: Value = serde_json::from_str(&body_text)
            .map_err(|e| ApiError::InvalidJson(e.to_string()))?;
        Ok(unwrap_envelope(json))
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.fetch("GET", path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.fetch("POST", path, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.fetch("PATCH", path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.fetch("DELETE", path, None).await
    }

    /// Test connectivity to the backend with a lightweight health-check.
    pub async fn check_connectivity(&self) -> ConnectivityResult {
        let health_url = format!("{}/health", self.base_url);
        let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(format!("Failed to create HTTP client: {e}")),
                };
            }
        };

        let start = Instant::now();
        let resp = match client.get(&health_url).send().await {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(friendly_error(&self.base_url, &e).to_string()),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if status.is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_message(status)),
            }
        }
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        if let Some(token) = self.token.as_mut() {
            token.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn normalize_adds_scheme_and_strips_slashes() {
        assert_eq!(normalize_api_url("pos.example.com/api/"), "https://pos.example.com/api");
        assert_eq!(normalize_api_url("localhost:3000//"), "http://localhost:3000");
        assert_eq!(normalize_api_url("  http://10.0.0.5:8080  "), "http://10.0.0.5:8080");
        assert_eq!(normalize_api_url(""), "");
    }

    #[test]
    fn with_query_encodes_values() {
        let p = with_query("/products", &[("search", "iced tea".into()), ("page", "2".into())]);
        assert_eq!(p, "/products?search=iced+tea&page=2");
        assert_eq!(with_query("/products", &[]), "/products");
    }

    #[test]
    fn segment_escapes_separators() {
        assert_eq!(segment("ord-1"), "ord-1");
        assert_eq!(segment("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn envelope_unwrapping_leaves_plain_objects_alone() {
        assert_eq!(
            unwrap_envelope(json!({ "success": true, "data": { "id": "o1" } })),
            json!({ "id": "o1" })
        );
        assert_eq!(unwrap_envelope(json!({ "data": [1, 2] })), json!([1, 2]));
        let order = json!({ "id": "o1", "data": "note", "status": "PENDING" });
        assert_eq!(unwrap_envelope(order.clone()), order);
    }

    #[test]
    fn rejects_paths_escaping_base() {
        assert!(validate_api_path("orders").is_err());
        assert!(validate_api_path("/../admin").is_err());
        assert!(validate_api_path("/http://evil").is_err());
        assert!(validate_api_path("/orders/1").is_ok());
    }

    #[tokio::test]
    async fn fetch_sends_bearer_and_unwraps_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .and(header("authorization", "Bearer tok-1"))
            .and(header("x-branch-id", "br-9"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "success": true, "data": { "id": "o1" } })),
            )
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT)
            .unwrap()
            .with_token("tok-1")
            .with_branch(Some("br-9".into()));
        let value = api.get("/orders/o1").await.unwrap();
        assert_eq!(value, json!({ "id": "o1" }));
    }

    #[tokio::test]
    async fn conflict_keeps_server_message_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .respond_with(
                ResponseTemplate::new(409)
                    .set_body_json(json!({ "message": "Payment already exists for order" })),
            )
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let err = api.post("/payments", json!({})).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "Payment already exists for order (HTTP 409)");
    }

    #[tokio::test]
    async fn empty_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/products/p1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(api.delete("/products/p1").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn connectivity_reports_status_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let result = api.check_connectivity().await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Server error (HTTP 503)"));
    }

    #[tokio::test]
    async fn truncated_success_body_is_a_network_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(
                    b"HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 64\r\n\r\n{\"id\":",
                )
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let api = ApiClient::new(&format!("http://{addr}"), DEFAULT_TIMEOUT).unwrap();
        let err = api.post("/payments", json!({ "orderId": "o1" })).await.unwrap_err();
        assert!(matches!(err, ApiError::Network { .. }), "got {err:?}");
        assert!(err.is_outcome_unknown());
    }

    #[test]
    fn client_errors_are_definitive_and_server_errors_are_not() {
        let status = |status| ApiError::Status {
            status,
            message: String::new(),
            details: None,
        };
        assert!(!status(402).is_outcome_unknown());
        assert!(!status(422).is_outcome_unknown());
        assert!(status(502).is_outcome_unknown());
        assert!(ApiError::Timeout { url: "x".into() }.is_outcome_unknown());
    }
}
