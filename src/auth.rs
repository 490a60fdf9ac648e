//! Token validation against the KBase auth service.
//!
//! Grounded in `JobRunner/JobRunner.py::_validate_token` (a GET against the
//! v2 token-info endpoint, reading back the user name and the `expires`
//! epoch-second field) and in the teacher's trait-plus-`reqwest`
//! shape for outbound HTTP collaborators (`crates/wdl-engine/src/http.rs`).

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

/// Errors from token validation.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The underlying HTTP request failed.
    #[error("auth request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The auth service rejected the token outright.
    #[error("token is invalid")]
    InvalidToken,
    /// The auth service's response body couldn't be parsed.
    #[error("failed to parse auth response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A validated token: the user it belongs to and when it expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// The KBase user name the token authenticates.
    pub user: String,
    /// When the token expires.
    pub expires_at: DateTime<Utc>,
}

/// The auth-service surface the supervisor needs (`spec.md` §6).
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Validates `token`, returning the user identity and expiry.
    async fn validate_token(&self, token: &str) -> Result<TokenInfo, AuthError>;
}

/// A `reqwest`-based [`AuthClient`] speaking the v2 token-info protocol.
#[derive(Debug, Clone)]
pub struct HttpAuthClient {
    /// Base URL of the auth service, e.g. `https://kbase.example.org/services/auth`.
    base_url: String,
    /// Whether to allow a plain-HTTP (non-TLS) base URL.
    allow_insecure: bool,
    /// The underlying HTTP client.
    http: reqwest::Client,
}

impl HttpAuthClient {
    /// Creates a new client for the given base URL.
    pub fn new(base_url: impl Into<String>, allow_insecure: bool) -> Self {
        Self {
            base_url: base_url.into(),
            allow_insecure,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn validate_token(&self, token: &str) -> Result<TokenInfo, AuthError> {
        if !self.allow_insecure && !self.base_url.starts_with("https://") {
            return Err(AuthError::InvalidToken);
        }

        #[derive(serde::Deserialize)]
        struct TokenInfoResponse {
            user: String,
            expires: i64,
        }

        let url = format!("{}/api/V2/token", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .header("Authorization", token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::InvalidToken);
        }

        let info: TokenInfoResponse = response.error_for_status()?.json().await?;
        let expires_at = DateTime::from_timestamp(info.expires, 0).ok_or(AuthError::InvalidToken)?;

        Ok(TokenInfo {
            user: info.user,
            expires_at,
        })
    }
}
