//! HTTP invocation: build a request from a resolved spec, execute it,
//! normalize the response.
//!
//! Clients are pooled per TLS profile; connection reuse within a profile
//! comes from reqwest's own pool. Timeouts, redirect limits and the
//! response size cap are enforced here; failures map onto the engine's
//! HTTP error taxonomy.

pub mod tls;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::suite::{RequestSpec, TlsSpec};
use crate::{Error, Result};

use tls::{CertificateRegistry, LoadedIdentity};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
/// Maximum redirects followed per request.
pub const MAX_REDIRECTS: usize = 5;
/// Response body size cap.
pub const MAX_RESPONSE_BYTES: u64 = 100 * 1024 * 1024;

/// Normalized response handed to assertions and captures.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Response headers (first value per name)
    pub headers: BTreeMap<String, String>,
    /// Parsed body: JSON for `application/json*`, string for `text/*`,
    /// null otherwise
    pub body: Value,
    /// Raw body text (lossy for binary payloads)
    pub raw_body: String,
    /// Wall-clock duration of the exchange
    pub response_time_ms: u64,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// JSON document form used by JMESPath queries and scripts.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "status_code": self.status,
            "headers": self.headers,
            "body": self.body,
            "response_time_ms": self.response_time_ms,
        })
    }
}

/// Key of the client pool: one client per TLS profile.
type ClientKey = Option<TlsSpec>;

/// Request executor with per-TLS-profile client pooling.
pub struct HttpInvoker {
    clients: Mutex<HashMap<ClientKey, Client>>,
    registry: CertificateRegistry,
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpInvoker {
    /// Create an invoker with the default certificate loaders.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            registry: CertificateRegistry::with_default_loaders(),
        }
    }

    /// Execute a fully resolved request spec.
    ///
    /// Non-2xx statuses are not failures here; callers assert on them.
    ///
    /// # Errors
    ///
    /// `Timeout`, `ConnectionRefused`, `DnsFailure`, `TlsFailure`,
    /// `ProtocolError` or `ResponseTooLarge` per the failure observed;
    /// `Cancelled` when the token fires mid-flight.
    pub async fn execute(
        &self,
        spec: &RequestSpec,
        base_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        let url = resolve_url(&spec.url, base_url)?;
        let method = Method::from_bytes(spec.method.to_uppercase().as_bytes())
            .map_err(|_| Error::Config(format!("Invalid HTTP method: {}", spec.method)))?;
        let timeout_ms = spec.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);

        let client = self.client_for(spec.tls.as_ref())?;
        let mut request = client
            .request(method, url.clone())
            .timeout(Duration::from_millis(timeout_ms));

        request = request.headers(build_headers(&spec.headers));

        if !spec.query.is_empty() {
            let pairs: Vec<(String, String)> = spec
                .query
                .iter()
                .map(|(k, v)| (k.clone(), render_query_value(v)))
                .collect();
            request = request.query(&pairs);
        }

        if let Some(ref body) = spec.body {
            request = match body {
                Value::String(text) => request.body(text.clone()),
                other => request.json(other),
            };
        }

        debug!(method = %spec.method, url = %url, "Executing request");
        let start = Instant::now();

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = request.send() => outcome.map_err(|e| map_send_error(&e, timeout_ms))?,
        };

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let content_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.to_ascii_lowercase())
            .unwrap_or_default();

        let bytes = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = read_capped(response) => outcome?,
        };

        #[allow(clippy::cast_possible_truncation)]
        let response_time_ms = start.elapsed().as_millis() as u64;
        let raw_body = String::from_utf8_lossy(&bytes).into_owned();
        let body = parse_body(&content_type, &bytes, &raw_body);

        debug!(status, duration_ms = response_time_ms, "Request finished");
        Ok(HttpResponse {
            status,
            headers,
            body,
            raw_body,
            response_time_ms,
        })
    }

    /// Get or build the client for a TLS profile.
    fn client_for(&self, tls: Option<&TlsSpec>) -> Result<Client> {
        let key: ClientKey = tls.cloned();
        if let Some(client) = self.clients.lock().get(&key) {
            return Ok(client.clone());
        }

        let client = self.build_client(tls)?;
        self.clients.lock().insert(key, client.clone());
        Ok(client)
    }

    fn build_client(&self, tls: Option<&TlsSpec>) -> Result<Client> {
        let mut builder = Client::builder()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8);

        if let Some(tls) = tls {
            if tls.verify == Some(false) {
                builder = builder.danger_accept_invalid_certs(true);
            }
            if let Some(ref ca_path) = tls.ca_path {
                builder = builder.add_root_certificate(tls::load_ca_bundle(ca_path)?);
            }
            if let Some(ref min) = tls.min_version {
                builder = builder.min_tls_version(tls::protocol_version(min)?);
            }
            if let Some(ref max) = tls.max_version {
                builder = builder.max_tls_version(tls::protocol_version(max)?);
            }
            match self.registry.load(tls)? {
                Some(LoadedIdentity::Pem(identity)) => {
                    builder = builder.use_rustls_tls().identity(identity);
                }
                #[cfg(feature = "pfx")]
                Some(LoadedIdentity::Pkcs12(identity)) => {
                    builder = builder.use_native_tls().identity(identity);
                }
                None => {}
            }
        }

        builder
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))
    }
}

/// Join a step URL against the suite base URL when it is relative.
fn resolve_url(raw: &str, base_url: Option<&str>) -> Result<Url> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Url::parse(raw).map_err(|e| Error::Config(format!("Invalid URL '{raw}': {e}")));
    }
    let base = base_url
        .ok_or_else(|| Error::Config(format!("Relative URL '{raw}' requires a base_url")))?;
    let base = Url::parse(base).map_err(|e| Error::Config(format!("Invalid base_url '{base}': {e}")))?;
    base.join(raw)
        .map_err(|e| Error::Config(format!("Cannot join '{raw}' onto base_url: {e}")))
}

fn build_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            value.parse::<HeaderValue>(),
        ) {
            map.insert(name, value);
        } else {
            debug!(header = %name, "Skipping invalid header");
        }
    }
    map
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

fn render_query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Drain the response body, enforcing the size cap.
async fn read_capped(mut response: reqwest::Response) -> Result<Vec<u8>> {
    if let Some(length) = response.content_length() {
        if length > MAX_RESPONSE_BYTES {
            return Err(Error::ResponseTooLarge {
                limit: MAX_RESPONSE_BYTES,
            });
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::ProtocolError(format!("failed to read response body: {e}")))?
    {
        if (bytes.len() + chunk.len()) as u64 > MAX_RESPONSE_BYTES {
            return Err(Error::ResponseTooLarge {
                limit: MAX_RESPONSE_BYTES,
            });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

fn parse_body(content_type: &str, bytes: &[u8], raw: &str) -> Value {
    if content_type.starts_with("application/json") || content_type.contains("+json") {
        serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(raw.to_string()))
    } else if content_type.starts_with("text/") {
        Value::String(raw.to_string())
    } else if content_type.is_empty() {
        // No declared type: prefer JSON when it parses, else text.
        serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(raw.to_string()))
    } else {
        Value::Null
    }
}

/// Map a reqwest send error onto the HTTP error taxonomy.
fn map_send_error(error: &reqwest::Error, timeout_ms: u64) -> Error {
    if error.is_timeout() {
        return Error::Timeout(timeout_ms);
    }
    if error.is_redirect() {
        return Error::ProtocolError(format!("redirect limit of {MAX_REDIRECTS} exceeded"));
    }

    let chain = error_chain(error);
    let lowered = chain.to_lowercase();
    if lowered.contains("certificate") || lowered.contains("handshake") || lowered.contains("tls") {
        return Error::TlsFailure(chain);
    }
    if lowered.contains("dns") || lowered.contains("failed to lookup") {
        return Error::DnsFailure(chain);
    }
    if error.is_connect() {
        if let Some(io) = find_io_error(error) {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return Error::ConnectionRefused(chain);
            }
        }
        if lowered.contains("connection refused") {
            return Error::ConnectionRefused(chain);
        }
        return Error::ConnectionRefused(chain);
    }
    Error::ProtocolError(chain)
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

fn find_io_error(error: &reqwest::Error) -> Option<&std::io::Error> {
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = cause.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relative_urls_join_against_base() {
        let url = resolve_url("/users/1", Some("http://echo.local")).unwrap();
        assert_eq!(url.as_str(), "http://echo.local/users/1");
    }

    #[test]
    fn absolute_urls_ignore_base() {
        let url = resolve_url("https://other.local/x", Some("http://echo.local")).unwrap();
        assert_eq!(url.host_str(), Some("other.local"));
    }

    #[test]
    fn relative_url_without_base_is_a_config_error() {
        assert!(matches!(
            resolve_url("/users", None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn json_bodies_parse_structurally() {
        let body = parse_body("application/json; charset=utf-8", br#"{"id": 1}"#, r#"{"id": 1}"#);
        assert_eq!(body, json!({"id": 1}));
    }

    #[test]
    fn text_bodies_stay_strings() {
        let body = parse_body("text/plain", b"hello", "hello");
        assert_eq!(body, json!("hello"));
    }

    #[test]
    fn binary_bodies_parse_to_null() {
        let body = parse_body("application/octet-stream", &[0xde, 0xad], "\u{fffd}\u{fffd}");
        assert_eq!(body, Value::Null);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = HttpResponse {
            status: 200,
            headers: BTreeMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: Value::Null,
            raw_body: String::new(),
            response_time_ms: 1,
        };
        assert_eq!(response.header("content-type"), Some("application/json"));
    }

    #[test]
    fn response_document_exposes_body_and_status() {
        let response = HttpResponse {
            status: 201,
            headers: BTreeMap::new(),
            body: json!({"ok": true}),
            raw_body: String::new(),
            response_time_ms: 12,
        };
        let doc = response.to_value();
        assert_eq!(doc["status"], json!(201));
        assert_eq!(doc["body"]["ok"], json!(true));
    }
}
