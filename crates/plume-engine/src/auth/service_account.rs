use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GenerationError, Result};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Refresh this many seconds before the token expires.
const EXPIRY_SAFETY_WINDOW_SECS: i64 = 300;
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Fields of a Google service-account JSON key used for the JWT bearer grant.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ServiceAccountKey {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| GenerationError::auth("vertex", format!("invalid service account JSON: {err}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            GenerationError::auth(
                "vertex",
                format!("failed reading service account key {}: {err}", path.display()),
            )
        })?;
        Self::from_json(&raw)
    }

    fn token_uri(&self) -> &str {
        self.token_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .unwrap_or(DEFAULT_TOKEN_URI)
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Exchanges a signed JWT for an OAuth access token and caches it until it is
/// close to expiry. Concurrent callers share one refresh.
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    http: reqwest::blocking::Client,
    cache: Mutex<Option<CachedToken>>,
    refresh: Mutex<()>,
}

impl ServiceAccountTokenSource {
    pub fn new(key: ServiceAccountKey, http: reqwest::blocking::Client) -> Self {
        Self {
            key,
            http,
            cache: Mutex::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn token(&self) -> Result<String> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }
        let _refresh = self.refresh.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(token) = self.cached() {
            return Ok(token);
        }
        let fetched = self.fetch()?;
        let token = fetched.token.clone();
        *self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(fetched);
        Ok(token)
    }

    fn cached(&self) -> Option<String> {
        let now = Utc::now().timestamp();
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .filter(|cached| cached.expires_at - EXPIRY_SAFETY_WINDOW_SECS > now)
            .map(|cached| cached.token.clone())
    }

    fn assertion(&self, now: i64) -> Result<String> {
        let claims = Claims {
            iss: &self.key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: self.key.token_uri(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some("JWT".to_string());
        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| GenerationError::auth("vertex", format!("invalid service account private key: {err}")))?;
        encode(&header, &claims, &key)
            .map_err(|err| GenerationError::auth("vertex", format!("failed to sign token assertion: {err}")))
    }

    fn fetch(&self) -> Result<CachedToken> {
        let now = Utc::now().timestamp();
        let assertion = self.assertion(now)?;
        let endpoint = self.key.token_uri().to_string();
        debug!(client_email = %self.key.client_email, endpoint = %endpoint, "fetching access token");

        let response = self
            .http
            .post(&endpoint)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .map_err(|source| GenerationError::Transport {
                backend: "vertex".to_string(),
                endpoint: endpoint.clone(),
                source,
            })?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(GenerationError::Http {
                backend: "vertex".to_string(),
                status: status.as_u16(),
                body: format!("token exchange failed: {}", body.trim()),
            });
        }
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| GenerationError::decode("vertex", format!("token response: {err}")))?;
        if parsed.access_token.trim().is_empty() {
            return Err(GenerationError::auth("vertex", "token endpoint returned an empty access token"));
        }
        Ok(CachedToken {
            token: parsed.access_token,
            expires_at: now + parsed.expires_in,
        })
    }
}

impl fmt::Debug for ServiceAccountTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountTokenSource")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
