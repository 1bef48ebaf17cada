//! Anti-forgery token cache shared by all mutating calls.
//!
//! The token is fetched lazily on the first mutating call and memoized;
//! concurrent callers coalesce into a single handshake because the cache's
//! mutex is held across the fetch. The header name is server-supplied and
//! cached alongside the value.

use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use super::{ApiError, HttpBackend, HttpRequest, Method};

pub const DEFAULT_CSRF_HEADER: &str = "X-CSRF-Token";
pub const CSRF_TOKEN_PATH: &str = "/csrf-token";

/// Session-bootstrap endpoints that must never request a token: you cannot
/// prove you hold a valid session to obtain the token that proves you hold a
/// valid session.
pub const CSRF_EXEMPT_PATHS: &[&str] = &[
    "/login",
    "/logout",
    "/auth/callback",
    "/password-reset",
    "/test/",
];

pub fn is_csrf_exempt(path: &str) -> bool {
    CSRF_EXEMPT_PATHS.iter().any(|exempt| {
        if let Some(prefix) = exempt.strip_suffix('/') {
            path == prefix || path.starts_with(exempt)
        } else {
            path == *exempt || path.starts_with(&format!("{exempt}/"))
        }
    })
}

#[derive(Debug, Deserialize)]
struct CsrfHandshake {
    #[serde(rename = "csrfToken")]
    csrf_token: String,
    #[serde(rename = "headerName")]
    header_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsrfToken {
    pub value: String,
    pub header_name: String,
}

/// Process-wide token cache. Explicitly constructed and injectable; cleared
/// on logout and on any 401.
pub struct CsrfCache {
    slot: Mutex<Option<CsrfToken>>,
}

impl CsrfCache {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return the cached token, fetching it once if absent. Holding the lock
    /// across the handshake is what coalesces concurrent callers.
    pub async fn get(
        &self,
        backend: &dyn HttpBackend,
        base_url: &Url,
        bearer_token: Option<&str>,
    ) -> Result<CsrfToken, ApiError> {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }

        let endpoint = base_url
            .join(CSRF_TOKEN_PATH.trim_start_matches('/'))
            .map_err(|err| ApiError::InvalidConfig(format!("invalid csrf endpoint: {err}")))?;
        let mut headers = Vec::new();
        if let Some(token) = bearer_token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        let response = backend
            .execute(HttpRequest {
                method: Method::Get,
                url: endpoint,
                headers,
                body: None,
            })
            .await?;
        if !(200..300).contains(&response.status) {
            return Err(ApiError::HttpStatus(response.status));
        }
        let handshake: CsrfHandshake = serde_json::from_value(response.body)
            .map_err(|err| ApiError::InvalidResponse(format!("malformed csrf handshake: {err}")))?;

        let token = CsrfToken {
            value: handshake.csrf_token,
            header_name: handshake
                .header_name
                .unwrap_or_else(|| DEFAULT_CSRF_HEADER.to_string()),
        };
        tracing::debug!(target: "campus::api", header = %token.header_name, "csrf token cached");
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token. Called on logout and on a 401 response.
    pub async fn clear(&self) {
        let mut slot = self.slot.lock().await;
        if slot.take().is_some() {
            tracing::debug!(target: "campus::api", "csrf token cleared");
        }
    }
}

impl Default for CsrfCache {
    fn default() -> Self {
        Self::new()
    }
}
