//! REST transport shared by the coordination components.
//!
//! Network calls go through a pluggable [`HttpBackend`] (reqwest in
//! production, mocks in tests). The client attaches the CSRF header to
//! mutating verbs, maps HTTP statuses into the error taxonomy, and accepts a
//! cancel token so an epoch can abort an in-flight read at the transport
//! level.

pub mod csrf;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::epoch::CancelToken;
use crate::resource::{ConflictRecord, SaveResult, VersionStamp};
use csrf::{CsrfCache, is_csrf_exempt};

/// Header carrying the version stamp a versioned write echoes back.
pub const RESOURCE_VERSION_HEADER: &str = "X-Resource-Version";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    base_url: Url,
    bearer_token: Option<String>,
}

impl ApiConfig {
    pub fn new(server_base_url: impl AsRef<str>) -> Result<Self, ApiError> {
        // Allow a centralized override so callers and env stay consistent.
        let mut base = std::env::var("CAMPUS_API_BASE")
            .ok()
            .and_then(|s| {
                let trimmed = s.trim().to_string();
                if trimmed.is_empty() { None } else { Some(trimmed) }
            })
            .unwrap_or_else(|| server_base_url.as_ref().trim().to_string());
        if base.is_empty() {
            return Err(ApiError::InvalidConfig(
                "api server base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        let parsed = Url::parse(&base)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid api server url: {err}")))?;
        Ok(Self {
            base_url: parsed,
            bearer_token: None,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn set_bearer_token(&mut self, token: Option<String>) {
        self.bearer_token = token;
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    /// Websocket endpoint for the realtime channel, derived from the base
    /// URL (http → ws, https → wss).
    pub fn realtime_url(&self) -> Result<Url, ApiError> {
        let mut url = self
            .base_url
            .join("realtime")
            .map_err(|err| ApiError::InvalidConfig(format!("invalid realtime endpoint: {err}")))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(ApiError::InvalidConfig(format!(
                    "cannot derive websocket scheme from {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ApiError::InvalidConfig("cannot set websocket scheme".into()))?;
        Ok(url)
    }
}

fn infer_scheme(target: &str) -> &'static str {
    let authority = target.split('/').next().unwrap_or(target);
    let host = if let Some(stripped) = authority.strip_prefix('[') {
        stripped.split(']').next().unwrap_or(stripped)
    } else {
        authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(authority)
    };
    if host == "localhost" || host == "::1" {
        return "http://";
    }
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        if ip.is_loopback() || ip.is_private() || ip.is_unspecified() {
            return "http://";
        }
    }
    "https://"
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn is_mutating(self) -> bool {
        !matches!(self, Method::Get)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// One request as the backend sees it: verb, absolute URL, flattened
/// headers, optional JSON body.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Status plus parsed body. Non-JSON bodies arrive as `Value::Null`; the
/// status mapping does not depend on them.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Field-level messages from a rejected payload. Input is preserved by the
/// submission layer; these only describe what to fix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    fn from_body(body: &Value) -> Self {
        let mut fields = BTreeMap::new();
        if let Some(map) = body.get("errors").and_then(Value::as_object) {
            for (field, messages) in map {
                let collected = match messages {
                    Value::String(message) => vec![message.clone()],
                    Value::Array(items) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                };
                fields.insert(field.clone(), collected);
            }
        }
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{field}: {}", messages.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid api configuration: {0}")]
    InvalidConfig(String),
    /// The call never reached the server (connectivity, timeout).
    #[error("network error: {0}")]
    Network(String),
    /// Cancelled via an epoch token. Not a user-visible error; the epoch
    /// layer absorbs it.
    #[error("request aborted")]
    Aborted,
    #[error("validation rejected: {0}")]
    Validation(ValidationErrors),
    #[error("conflicting edit (server holds {})", .0.server_version)]
    Conflict(ConflictRecord),
    #[error("server error (reference {reference})")]
    Server { reference: String },
    #[error("authentication required")]
    Unauthorized,
    #[error("unexpected http status {0}")]
    HttpStatus(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|err| ApiError::InvalidConfig(format!("invalid method: {err}")))?;
        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(HttpResponse { status, body })
    }
}

/// REST client with CSRF handling and taxonomy-mapped failures. Explicitly
/// constructed; the backend and the token cache are injectable.
#[derive(Clone)]
pub struct ApiClient {
    config: Arc<ApiConfig>,
    backend: Arc<dyn HttpBackend>,
    csrf: Arc<CsrfCache>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let backend = Arc::new(ReqwestBackend::new()?);
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: ApiConfig, backend: Arc<dyn HttpBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            csrf: Arc::new(CsrfCache::new()),
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Drop session-scoped shared state (the CSRF token). Called on logout.
    pub async fn reset_session(&self) {
        self.csrf.clear().await;
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.config
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }

    /// Read-only call. Never carries the CSRF header. The optional cancel
    /// token aborts the call at the transport layer; an abort surfaces as
    /// [`ApiError::Aborted`], which the epoch layer treats as silence, not
    /// as an error.
    pub async fn get(&self, path: &str, cancel: Option<&CancelToken>) -> Result<Value, ApiError> {
        let request = HttpRequest {
            method: Method::Get,
            url: self.endpoint(path)?,
            headers: self.base_headers(),
            body: None,
        };
        let response = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(ApiError::Aborted),
                    response = self.backend.execute(request) => response?,
                }
            }
            None => self.backend.execute(request).await?,
        };
        self.interpret(response, None).await
    }

    /// Mutating call. Attaches the CSRF header unless `path` is on the
    /// session-bootstrap allow-list; echoes `version` when the resource is
    /// under optimistic concurrency.
    pub async fn write(
        &self,
        method: Method,
        path: &str,
        body: Value,
        version: Option<&VersionStamp>,
    ) -> Result<Value, ApiError> {
        debug_assert!(method.is_mutating(), "write requires a mutating verb");
        let mut headers = self.base_headers();
        if !is_csrf_exempt(path) {
            let token = self
                .csrf
                .get(
                    self.backend.as_ref(),
                    &self.config.base_url,
                    self.config.bearer_token(),
                )
                .await?;
            headers.push((token.header_name, token.value));
        }
        if let Some(version) = version {
            headers.push((RESOURCE_VERSION_HEADER.to_string(), version.to_string()));
        }
        let request = HttpRequest {
            method,
            url: self.endpoint(path)?,
            headers,
            body: Some(body),
        };
        tracing::debug!(target: "campus::api", method = method.as_str(), path, "write issued");
        let response = self.backend.execute(request).await?;
        self.interpret(response, version).await
    }

    /// Versioned write shaped for [`crate::resource::EditSession`]: a 409 is
    /// folded into [`SaveResult::Conflict`] instead of an error.
    pub async fn save_versioned(
        &self,
        method: Method,
        path: &str,
        body: Value,
        version: &VersionStamp,
    ) -> Result<SaveResult, ApiError> {
        match self.write(method, path, body, Some(version)).await {
            Ok(body) => Ok(SaveResult::Saved { body }),
            Err(ApiError::Conflict(record)) => Ok(SaveResult::Conflict(record)),
            Err(err) => Err(err),
        }
    }

    fn base_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(token) = self.config.bearer_token() {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        headers
    }

    async fn interpret(
        &self,
        response: HttpResponse,
        version: Option<&VersionStamp>,
    ) -> Result<Value, ApiError> {
        if response.is_success() {
            return Ok(response.body);
        }
        match response.status {
            400 | 422 => {
                let errors = ValidationErrors::from_body(&response.body);
                if errors.is_empty() {
                    Err(ApiError::HttpStatus(response.status))
                } else {
                    Err(ApiError::Validation(errors))
                }
            }
            401 => {
                // The session changed under us; the cached token is dead.
                self.csrf.clear().await;
                Err(ApiError::Unauthorized)
            }
            409 => match (version, parse_conflict(&response.body)) {
                (Some(local), Some((server_version, server_snapshot))) => {
                    Err(ApiError::Conflict(ConflictRecord {
                        local_version: local.clone(),
                        server_version,
                        server_snapshot,
                    }))
                }
                _ => Err(ApiError::HttpStatus(409)),
            },
            status if status >= 500 => {
                let reference = response
                    .body
                    .get("reference")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                tracing::warn!(target: "campus::api", status, reference = %reference, "server error");
                Err(ApiError::Server { reference })
            }
            status => Err(ApiError::HttpStatus(status)),
        }
    }
}

fn parse_conflict(body: &Value) -> Option<(VersionStamp, Value)> {
    let conflict = body.get("conflict")?;
    let version = conflict
        .get("currentVersion")
        .and_then(Value::as_str)
        .map(VersionStamp::from)?;
    let snapshot = conflict.get("currentSnapshot").cloned().unwrap_or(Value::Null);
    Some((version, snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::EpochTracker;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// Scripted backend: pops the next canned response and records requests.
    struct ScriptedBackend {
        responses: StdMutex<Vec<HttpResponse>>,
        requests: StdMutex<Vec<HttpRequest>>,
        csrf_fetches: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(mut responses: Vec<HttpResponse>) -> Self {
            responses.reverse();
            Self {
                responses: StdMutex::new(responses),
                requests: StdMutex::new(Vec::new()),
                csrf_fetches: AtomicUsize::new(0),
            }
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpBackend for ScriptedBackend {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
            if request.url.path().ends_with("csrf-token") {
                self.csrf_fetches.fetch_add(1, Ordering::SeqCst);
                return Ok(HttpResponse {
                    status: 200,
                    body: json!({ "csrfToken": "csrf-abc", "headerName": "X-Campus-Csrf" }),
                });
            }
            self.requests.lock().unwrap().push(request);
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .expect("scripted backend exhausted");
            Ok(response)
        }
    }

    fn client_with(responses: Vec<HttpResponse>) -> (ApiClient, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new(responses));
        let config = ApiConfig::new("https://api.campus.sh").unwrap();
        (ApiClient::with_backend(config, backend.clone()), backend)
    }

    fn ok(body: Value) -> HttpResponse {
        HttpResponse { status: 200, body }
    }

    #[test]
    fn infer_scheme_defaults_to_https() {
        for host in ["api.campus.sh", "campus.example.edu:8443", "8.8.8.8"] {
            assert_eq!(infer_scheme(host), "https://");
        }
    }

    #[test]
    fn infer_scheme_defaults_to_http_for_local_hosts() {
        for host in [
            "localhost",
            "localhost:4132",
            "127.0.0.1",
            "127.0.0.1:8080",
            "0.0.0.0",
            "10.0.0.5",
            "192.168.1.10",
            "172.16.0.1",
            "172.31.255.255",
            "[::1]",
        ] {
            assert_eq!(infer_scheme(host), "http://");
        }
    }

    #[test]
    fn api_config_infers_scheme() {
        let https = ApiConfig::new("api.campus.sh").unwrap();
        assert_eq!(https.base_url().as_str(), "https://api.campus.sh/");

        let http = ApiConfig::new("localhost:8080").unwrap();
        assert_eq!(http.base_url().as_str(), "http://localhost:8080/");
    }

    #[test]
    fn realtime_url_swaps_scheme() {
        let config = ApiConfig::new("https://api.campus.sh").unwrap();
        assert_eq!(config.realtime_url().unwrap().as_str(), "wss://api.campus.sh/realtime");

        let config = ApiConfig::new("http://127.0.0.1:4280").unwrap();
        assert_eq!(
            config.realtime_url().unwrap().as_str(),
            "ws://127.0.0.1:4280/realtime"
        );
    }

    #[tokio::test]
    async fn reads_never_carry_the_csrf_header() {
        let (client, backend) = client_with(vec![ok(json!({"items": []}))]);
        client.get("/courses", None).await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert!(
            requests[0]
                .headers
                .iter()
                .all(|(name, _)| name != "X-Campus-Csrf")
        );
        assert_eq!(backend.csrf_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn writes_attach_the_cached_csrf_header() {
        let (client, backend) = client_with(vec![
            ok(json!({"id": "r1"})),
            ok(json!({"id": "r2"})),
        ]);
        client
            .write(Method::Post, "/threads/42/replies", json!({"body": "hi"}), None)
            .await
            .unwrap();
        client
            .write(Method::Post, "/threads/42/replies", json!({"body": "again"}), None)
            .await
            .unwrap();

        for request in backend.requests() {
            assert!(
                request
                    .headers
                    .iter()
                    .any(|(name, value)| name == "X-Campus-Csrf" && value == "csrf-abc")
            );
        }
        // Two writes, one handshake.
        assert_eq!(backend.csrf_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bootstrap_paths_skip_the_csrf_handshake() {
        let (client, backend) = client_with(vec![ok(json!({"ok": true}))]);
        client
            .write(Method::Post, "/login", json!({"user": "ada"}), None)
            .await
            .unwrap();
        assert_eq!(backend.csrf_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validation_failures_surface_field_messages() {
        let (client, _backend) = client_with(vec![HttpResponse {
            status: 422,
            body: json!({"errors": {"title": ["must not be blank"], "body": "too long"}}),
        }]);
        let err = client
            .write(Method::Post, "/threads", json!({"title": ""}), None)
            .await
            .unwrap_err();
        match err {
            ApiError::Validation(errors) => {
                assert_eq!(errors.fields["title"], vec!["must not be blank"]);
                assert_eq!(errors.fields["body"], vec!["too long"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflict_responses_build_a_full_record() {
        let (client, backend) = client_with(vec![HttpResponse {
            status: 409,
            body: json!({"conflict": {
                "currentVersion": "v2",
                "currentSnapshot": {"body": "theirs", "updated_at": "v2"}
            }}),
        }]);
        let stale = VersionStamp::from("v1");
        let err = client
            .write(
                Method::Put,
                "/courses/7/notes",
                json!({"body": "mine"}),
                Some(&stale),
            )
            .await
            .unwrap_err();
        match err {
            ApiError::Conflict(record) => {
                assert_eq!(record.local_version.as_str(), "v1");
                assert_eq!(record.server_version.as_str(), "v2");
                assert_eq!(record.server_snapshot["body"], "theirs");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // The stale stamp went out on the wire.
        let request = &backend.requests()[0];
        assert!(
            request
                .headers
                .iter()
                .any(|(name, value)| name == RESOURCE_VERSION_HEADER && value == "v1")
        );
    }

    #[tokio::test]
    async fn server_errors_expose_only_an_opaque_reference() {
        let (client, _backend) = client_with(vec![HttpResponse {
            status: 500,
            body: json!({"reference": "ref-123", "trace": "secret stack"}),
        }]);
        let err = client.get("/dashboard", None).await.unwrap_err();
        match err {
            ApiError::Server { reference } => assert_eq!(reference, "ref-123"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_clears_the_csrf_cache() {
        let (client, backend) = client_with(vec![
            ok(json!({"id": "r1"})),
            HttpResponse {
                status: 401,
                body: Value::Null,
            },
            ok(json!({"id": "r2"})),
        ]);
        client
            .write(Method::Post, "/threads/1/replies", json!({"body": "a"}), None)
            .await
            .unwrap();
        let err = client
            .write(Method::Post, "/threads/1/replies", json!({"body": "b"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));

        // The next write must re-handshake.
        client
            .write(Method::Post, "/threads/1/replies", json!({"body": "c"}), None)
            .await
            .unwrap();
        assert_eq!(backend.csrf_fetches.load(Ordering::SeqCst), 2);
    }

    struct BlockingBackend {
        release: StdMutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl HttpBackend for BlockingBackend {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, ApiError> {
            let release = self.release.lock().unwrap().take();
            if let Some(release) = release {
                let _ = release.await;
            }
            Ok(HttpResponse {
                status: 200,
                body: json!({"late": true}),
            })
        }
    }

    #[tokio::test]
    async fn cancelled_read_aborts_without_error_state() {
        let (_release_tx, release_rx) = oneshot::channel();
        let backend = Arc::new(BlockingBackend {
            release: StdMutex::new(Some(release_rx)),
        });
        let config = ApiConfig::new("https://api.campus.sh").unwrap();
        let client = ApiClient::with_backend(config, backend);

        let tracker = EpochTracker::new();
        let epoch = tracker.begin();
        let token = epoch.token().clone();

        let call = tokio::spawn(async move { client.get("/courses", Some(&token)).await });
        tracker.begin();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(ApiError::Aborted)));

        // Routed through the epoch gate, the abort is silence, not error.
        let committed: Result<Option<Value>, ApiError> =
            tracker.run_latest(&epoch, async { Err(ApiError::Aborted) }).await;
        assert!(matches!(committed, Ok(None)));
    }
}
