use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::credentials;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub consecutive_failures: u32,
    pub min_requests: u32,
    pub failure_ratio: f64,
    pub open_timeout_secs: u64,
    pub half_open_max_requests: u32,
    pub interval_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            min_requests: 10,
            failure_ratio: 0.6,
            open_timeout_secs: 30,
            half_open_max_requests: 3,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOverrides {
    pub gemini: Option<String>,
    pub vertex: Option<String>,
    pub bedrock: Option<String>,
}

/// Previously loaded client configuration. Credential fields are the fallback
/// source behind environment variables of the same (upper-case) name.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub default_model: Option<String>,
    pub gemini_api_key: Option<String>,
    pub google_cloud_project: Option<String>,
    pub google_cloud_location: Option<String>,
    pub vertex_api_key: Option<String>,
    pub google_application_credentials: Option<String>,
    pub aws_region: Option<String>,
    pub aws_bearer_token_bedrock: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub endpoints: EndpointOverrides,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            gemini_api_key: None,
            google_cloud_project: None,
            google_cloud_location: None,
            vertex_api_key: None,
            google_application_credentials: None,
            aws_region: None,
            aws_bearer_token_bedrock: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_session_token: None,
            request_timeout_secs: 300,
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            endpoints: EndpointOverrides::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        Ok(config)
    }

    /// Config field backing the credential environment variable `key`.
    pub fn credential(&self, key: &str) -> Option<&str> {
        let value = match key {
            credentials::GEMINI_API_KEY => &self.gemini_api_key,
            credentials::GOOGLE_CLOUD_PROJECT => &self.google_cloud_project,
            credentials::GOOGLE_CLOUD_LOCATION => &self.google_cloud_location,
            credentials::VERTEX_API_KEY => &self.vertex_api_key,
            credentials::GOOGLE_APPLICATION_CREDENTIALS => &self.google_application_credentials,
            credentials::AWS_REGION => &self.aws_region,
            credentials::AWS_BEARER_TOKEN_BEDROCK => &self.aws_bearer_token_bedrock,
            credentials::AWS_ACCESS_KEY_ID => &self.aws_access_key_id,
            credentials::AWS_SECRET_ACCESS_KEY => &self.aws_secret_access_key,
            credentials::AWS_SESSION_TOKEN => &self.aws_session_token,
            _ => return None,
        };
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = |value: &Option<String>| if value.is_some() { "<redacted>" } else { "<unset>" };
        f.debug_struct("ClientConfig")
            .field("default_model", &self.default_model)
            .field("gemini_api_key", &secret(&self.gemini_api_key))
            .field("google_cloud_project", &self.google_cloud_project)
            .field("google_cloud_location", &self.google_cloud_location)
            .field("vertex_api_key", &secret(&self.vertex_api_key))
            .field(
                "google_application_credentials",
                &self.google_application_credentials,
            )
            .field("aws_region", &self.aws_region)
            .field(
                "aws_bearer_token_bedrock",
                &secret(&self.aws_bearer_token_bedrock),
            )
            .field("aws_access_key_id", &secret(&self.aws_access_key_id))
            .field("aws_secret_access_key", &secret(&self.aws_secret_access_key))
            .field("aws_session_token", &secret(&self.aws_session_token))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}
