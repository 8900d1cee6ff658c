mod bedrock;
mod gemini;
mod vertex;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use plume_contracts::models::{BackendFamily, ModelSpec};
use plume_contracts::request::{GenerateOptions, GeneratedImage, ImageFormat};
use plume_contracts::{ClientConfig, CredentialResolver, Credentials};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::Value;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::error::{classify, GenerationError, Result};
use crate::retry::{with_retry, Attempt, CancelToken, RetryPolicy, Sleeper};

pub use bedrock::{BedrockClient, BedrockTransport};
pub use gemini::GeminiClient;
pub use vertex::{aspect_ratio_bucket, VertexClient, VertexTransport};

/// The common generation contract every backend client implements.
pub trait ImageBackend: Send + Sync {
    fn family(&self) -> BackendFamily;

    fn model(&self) -> &str;

    fn transport(&self) -> &'static str;

    fn generate_image(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancelToken,
    ) -> Result<GeneratedImage>;

    /// Later calls to `generate_image` fail with a closed-client error.
    fn close(&self);
}

pub const GEMINI_API_BASE: &str = "GEMINI_API_BASE";
pub const VERTEX_API_BASE: &str = "VERTEX_API_BASE";
pub const BEDROCK_ENDPOINT: &str = "BEDROCK_ENDPOINT";

/// Everything a client constructor needs: the resolved model, its gathered
/// credentials, and the shared breaker for its family.
pub struct BackendContext {
    pub model: ModelSpec,
    pub credentials: Credentials,
    /// Base URL override from config, then the family's environment variable.
    pub endpoint: Option<String>,
    pub config: ClientConfig,
    pub breaker: Arc<CircuitBreaker>,
    pub retry: RetryPolicy,
    pub sleeper: Arc<dyn Sleeper>,
}

impl BackendContext {
    pub fn new(
        model: ModelSpec,
        resolver: &CredentialResolver,
        config: &ClientConfig,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let credentials = resolver.gather(&model.credential_keys(), config);
        let (configured, env_key) = match model.family {
            BackendFamily::Gemini => (config.endpoints.gemini.as_deref(), GEMINI_API_BASE),
            BackendFamily::Vertex => (config.endpoints.vertex.as_deref(), VERTEX_API_BASE),
            BackendFamily::Bedrock => (config.endpoints.bedrock.as_deref(), BEDROCK_ENDPOINT),
        };
        let endpoint = configured
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| resolver.env_var(env_key));
        Self {
            model,
            credentials,
            endpoint,
            config: config.clone(),
            breaker,
            retry,
            sleeper,
        }
    }

    /// Fails with every unset required key and, when no auth method is
    /// complete, each method's unset keys.
    pub fn ensure_complete(&self) -> Result<()> {
        let gap = self.model.credential_gap(&self.credentials);
        if gap.is_empty() {
            return Ok(());
        }
        Err(GenerationError::missing_credentials(self.model.family, &gap))
    }

    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key)
    }

    pub fn require(&self, key: &str) -> Result<String> {
        self.credential(key)
            .map(str::to_string)
            .ok_or_else(|| GenerationError::MissingCredentials {
                backend: self.model.family.as_str().to_string(),
                keys: vec![key.to_string()],
                one_of: Vec::new(),
            })
    }
}

/// Breaker, retry, and HTTP plumbing shared by the backend clients.
pub(crate) struct Invoker {
    backend: &'static str,
    http: HttpClient,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    auth_hint: String,
    closed: AtomicBool,
}

impl Invoker {
    pub(crate) fn new(context: &BackendContext, auth_hint: impl Into<String>) -> Result<Self> {
        let timeout = Duration::from_secs(context.config.request_timeout_secs.max(1));
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| GenerationError::Transport {
                backend: context.model.family.as_str().to_string(),
                endpoint: "client setup".to_string(),
                source,
            })?;
        Ok(Self {
            backend: context.model.family.as_str(),
            http,
            breaker: context.breaker.clone(),
            retry: context.retry.clone(),
            sleeper: context.sleeper.clone(),
            auth_hint: auth_hint.into(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn http(&self) -> &HttpClient {
        &self.http
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GenerationError::Closed {
                backend: self.backend.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(backend = self.backend, "client closed");
        }
    }

    /// Each attempt goes through the family breaker; the retry policy drives
    /// attempts around it.
    pub(crate) fn call<T>(
        &self,
        cancel: &CancelToken,
        mut attempt: impl FnMut(Attempt) -> Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        with_retry(
            self.backend,
            classify,
            &self.retry,
            self.sleeper.as_ref(),
            cancel,
            |current| self.breaker.execute(|| attempt(current)),
        )
    }

    pub(crate) fn send_json(&self, request: RequestBuilder, endpoint: &str) -> Result<Value> {
        let response = request
            .send()
            .map_err(|source| GenerationError::Transport {
                backend: self.backend.to_string(),
                endpoint: endpoint.to_string(),
                source,
            })?;
        self.response_json_or_error(response)
    }

    fn response_json_or_error(&self, response: HttpResponse) -> Result<Value> {
        let status = response.status();
        let code = status.as_u16();
        let body = response
            .text()
            .map_err(|err| GenerationError::decode(self.backend, format!("response body read failed: {err}")))?;
        if !status.is_success() {
            let body = truncate_text(body.trim(), 512);
            if matches!(code, 401 | 403) {
                return Err(GenerationError::Unauthorized {
                    backend: self.backend.to_string(),
                    status: code,
                    body,
                    hint: self.auth_hint.clone(),
                });
            }
            return Err(GenerationError::Http {
                backend: self.backend.to_string(),
                status: code,
                body,
            });
        }
        serde_json::from_str(&body)
            .map_err(|err| GenerationError::decode(self.backend, format!("invalid JSON payload: {err}")))
    }
}

pub(crate) fn validate_prompt<'a>(backend: &str, prompt: &'a str, max_chars: usize) -> Result<&'a str> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::validation(backend, "prompt must not be empty"));
    }
    let count = trimmed.chars().count();
    if count > max_chars {
        return Err(GenerationError::validation(
            backend,
            format!("prompt must be at most {max_chars} characters (got {count})"),
        ));
    }
    Ok(trimmed)
}

pub(crate) fn decode_image(backend: &str, encoded: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|err| GenerationError::decode(backend, format!("image base64 decode failed: {err}")))?;
    if bytes.is_empty() {
        return Err(GenerationError::EmptyResponse {
            backend: backend.to_string(),
        });
    }
    Ok(bytes)
}

/// Assembles the normalized result. `extras` carries backend-specific metadata.
pub(crate) fn finish_image(
    backend: &dyn ImageBackend,
    prompt: &str,
    data: Vec<u8>,
    mime_type: Option<&str>,
    (width, height): (u32, u32),
    extras: impl IntoIterator<Item = (&'static str, String)>,
) -> GeneratedImage {
    let mut metadata = BTreeMap::new();
    metadata.insert("model".to_string(), backend.model().to_string());
    metadata.insert("prompt".to_string(), prompt.to_string());
    metadata.insert("backend".to_string(), backend.family().as_str().to_string());
    metadata.insert("transport".to_string(), backend.transport().to_string());
    for (key, value) in extras {
        metadata.insert(key.to_string(), value);
    }
    GeneratedImage {
        data,
        format: ImageFormat::from_mime(mime_type),
        width,
        height,
        metadata,
    }
}

/// The override when one is set, otherwise the public default.
pub(crate) fn api_base(endpoint: Option<&str>, default: &str) -> String {
    endpoint
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
