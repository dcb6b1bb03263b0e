use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

/// Tokens expiring within this window are refreshed before use.
pub const REFRESH_BUFFER_MS: i64 = 60_000;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not authenticated; run `competitor_scan auth url` and `auth exchange` first")]
    NotAuthenticated,
    #[error("no refresh token available; please re-authorize")]
    NoRefreshToken,
    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("token file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed token data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid authorization URL: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub scope: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        OAuthConfig {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "http://localhost:8080".to_string(),
            auth_url: AUTH_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            scope: SHEETS_SCOPE.to_string(),
        }
    }
}

/// Token as persisted on disk: the token endpoint's response plus an absolute
/// `expiry_date` in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoredToken {
    /// True when the expiry is unknown, past, or within [`REFRESH_BUFFER_MS`] of `now_ms`.
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        match self.expiry_date {
            Some(expiry) => expiry < now_ms + REFRESH_BUFFER_MS,
            None => true,
        }
    }

    fn stamp_expiry(&mut self, now_ms: i64) {
        if let Some(secs) = self.expires_in {
            self.expiry_date = Some(now_ms + secs * 1000);
        }
    }
}

/// Source of a bearer token for the spreadsheet API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn valid_token(&self) -> Result<String, AuthError>;
}

/// JSON-file token cache with refresh-on-expiry.
///
/// Two processes refreshing through the same file may both refresh; the last
/// write wins. Only single-process use is supported.
pub struct FileTokenStore {
    path: PathBuf,
    oauth: OAuthConfig,
    http: reqwest::Client,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>, oauth: OAuthConfig) -> Self {
        FileTokenStore {
            path: path.into(),
            oauth,
            http: reqwest::Client::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<StoredToken>, AuthError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|source| self.io_err(source))?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, token: &StoredToken) -> Result<(), AuthError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| self.io_err(source))?;
        }
        let json = serde_json::to_string_pretty(token)?;
        std::fs::write(&self.path, json).map_err(|source| self.io_err(source))
    }

    /// Consent URL for the authorization-code grant, plus the `state` value sent with it.
    pub fn authorization_url(&self) -> Result<(String, String), AuthError> {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        let state: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        let url = url::Url::parse_with_params(
            &self.oauth.auth_url,
            &[
                ("client_id", self.oauth.client_id.as_str()),
                ("redirect_uri", self.oauth.redirect_uri.as_str()),
                ("scope", self.oauth.scope.as_str()),
                ("response_type", "code"),
                ("state", state.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )?;
        Ok((url.to_string(), state))
    }

    /// Trade an authorization code for tokens and persist them.
    pub async fn exchange_code(&self, code: &str) -> Result<StoredToken, AuthError> {
        let mut token = self
            .request_token(&[
                ("code", code),
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("redirect_uri", self.oauth.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .await?;
        token.stamp_expiry(Utc::now().timestamp_millis());
        self.save(&token)?;
        info!("Saved tokens to {}", self.path.display());
        Ok(token)
    }

    /// Refresh `current`, keeping its refresh token when the endpoint omits one.
    pub async fn refresh(&self, current: StoredToken) -> Result<StoredToken, AuthError> {
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or(AuthError::NoRefreshToken)?;
        let fresh = self
            .request_token(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .await?;

        let mut updated = StoredToken {
            access_token: fresh.access_token,
            refresh_token: fresh.refresh_token.or(current.refresh_token),
            expires_in: fresh.expires_in,
            expiry_date: None,
            extra: current.extra,
        };
        updated.stamp_expiry(Utc::now().timestamp_millis());
        self.save(&updated)?;
        Ok(updated)
    }

    pub fn clear(&self) -> Result<bool, AuthError> {
        if !self.path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path).map_err(|source| self.io_err(source))?;
        Ok(true)
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<StoredToken, AuthError> {
        let response = self
            .http
            .post(&self.oauth.token_url)
            .form(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    fn io_err(&self, source: std::io::Error) -> AuthError {
        AuthError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl TokenProvider for FileTokenStore {
    async fn valid_token(&self) -> Result<String, AuthError> {
        let token = self.load()?.ok_or(AuthError::NotAuthenticated)?;
        if !token.needs_refresh(Utc::now().timestamp_millis()) {
            return Ok(token.access_token);
        }
        info!("Access token expired or expiring, refreshing");
        Ok(self.refresh(token).await?.access_token)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn token(expiry_date: Option<i64>, refresh: Option<&str>) -> StoredToken {
        StoredToken {
            access_token: "old-access".into(),
            refresh_token: refresh.map(str::to_string),
            expires_in: Some(3599),
            expiry_date,
            extra: Map::new(),
        }
    }

    fn store(dir: &tempfile::TempDir, server: &MockServer) -> FileTokenStore {
        FileTokenStore::new(
            dir.path().join("tokens.json"),
            OAuthConfig {
                client_id: "cid".into(),
                client_secret: "secret".into(),
                token_url: format!("{}/token", server.uri()),
                ..OAuthConfig::default()
            },
        )
    }

    #[test]
    fn refresh_window() {
        let now = 1_700_000_000_000;
        assert!(token(Some(now + 30_000), None).needs_refresh(now));
        assert!(!token(Some(now + 120_000), None).needs_refresh(now));
        assert!(token(Some(now - 1), None).needs_refresh(now));
        assert!(token(None, None).needs_refresh(now));
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = r#"{"access_token":"a","scope":"s","token_type":"Bearer","expiry_date":5}"#;
        let t: StoredToken = serde_json::from_str(raw).unwrap();
        assert_eq!(t.extra["scope"], "s");
        let back = serde_json::to_value(&t).unwrap();
        assert_eq!(back["token_type"], "Bearer");
        assert_eq!(back["expiry_date"], 5);
    }

    #[tokio::test]
    async fn expiring_in_30s_triggers_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "access_token": "new-access", "expires_in": 3600 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, &server);
        let now = Utc::now().timestamp_millis();
        store.save(&token(Some(now + 30_000), Some("r-1"))).unwrap();

        assert_eq!(store.valid_token().await.unwrap(), "new-access");

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.access_token, "new-access");
        assert_eq!(saved.refresh_token.as_deref(), Some("r-1"));
        assert!(saved.expiry_date.unwrap() >= now + 3_590_000);
    }

    #[tokio::test]
    async fn expiring_in_120s_is_used_as_is() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "x" })))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, &server);
        let now = Utc::now().timestamp_millis();
        store.save(&token(Some(now + 120_000), Some("r-1"))).unwrap();

        assert_eq!(store.valid_token().await.unwrap(), "old-access");
    }

    #[tokio::test]
    async fn missing_file_and_missing_refresh_token() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, &server);

        assert!(matches!(store.valid_token().await, Err(AuthError::NotAuthenticated)));

        store.save(&token(Some(0), None)).unwrap();
        assert!(matches!(store.valid_token().await, Err(AuthError::NoRefreshToken)));
    }

    #[tokio::test]
    async fn exchange_code_persists_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "first",
                "refresh_token": "r-9",
                "expires_in": 3600,
                "scope": SHEETS_SCOPE,
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, &server);
        let token = store.exchange_code("abc").await.unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("r-9"));

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved, token);
        assert!(saved.expiry_date.is_some());
        assert!(store.clear().unwrap());
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_refresh_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, &server);
        store.save(&token(None, Some("r-1"))).unwrap();
        match store.valid_token().await {
            Err(AuthError::Status { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn authorization_url_carries_offline_consent() {
        let store = FileTokenStore::new(
            "unused.json",
            OAuthConfig {
                client_id: "cid".into(),
                ..OAuthConfig::default()
            },
        );
        let (url, state) = store.authorization_url().unwrap();
        assert_eq!(state.len(), 32);
        assert!(url.starts_with(AUTH_URL));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains(&format!("state={}", state)));
    }
}
