use std::fmt;
use std::time::Duration;

use plume_contracts::credentials::CredentialGap;
use plume_contracts::models::{BackendFamily, CatalogError};

pub type Result<T, E = GenerationError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Validation,
    Authentication,
    RateLimited,
    Transient,
    Permanent,
    CircuitOpen,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::RateLimited => "rate-limited",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::CircuitOpen => "circuit-open",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("{backend}: invalid request: {message}")]
    Validation { backend: String, message: String },

    /// `keys` are all needed; from `one_of`, any single group is enough.
    #[error("{backend}: missing credentials {}; {}", describe_missing(.keys, .one_of), remediation(.keys, .one_of))]
    MissingCredentials {
        backend: String,
        keys: Vec<String>,
        one_of: Vec<Vec<String>>,
    },

    #[error("{backend}: authentication failed ({status}): {body}; {hint}")]
    Unauthorized {
        backend: String,
        status: u16,
        body: String,
        hint: String,
    },

    #[error("{backend}: request failed ({status}): {body}")]
    Http {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("{backend}: request to {endpoint} failed: {source}")]
    Transport {
        backend: String,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend}: backend reported an error: {message}")]
    Backend { backend: String, message: String },

    #[error("{backend}: could not decode response: {message}")]
    Decode { backend: String, message: String },

    #[error("{backend}: response contained no image data")]
    EmptyResponse { backend: String },

    #[error("{backend}: circuit breaker open after too many recent failures; retry in {}s", .retry_in.as_secs())]
    CircuitOpen { backend: String, retry_in: Duration },

    #[error("{backend}: circuit breaker half-open and all {max_requests} trial slots are taken")]
    HalfOpenFull { backend: String, max_requests: u32 },

    #[error("{backend}: cancelled during retry backoff (attempt {attempt})")]
    Cancelled { backend: String, attempt: u32 },

    #[error("{backend}: failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        backend: String,
        attempts: u32,
        #[source]
        source: Box<GenerationError>,
    },

    #[error("{backend}: attempt {attempt} of {max} failed: {source}")]
    Aborted {
        backend: String,
        attempt: u32,
        max: u32,
        #[source]
        source: Box<GenerationError>,
    },

    #[error("{backend}: client is closed")]
    Closed { backend: String },

    #[error("{backend}: {message}")]
    Auth { backend: String, message: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl GenerationError {
    pub fn validation(backend: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn decode(backend: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn auth(backend: &str, message: impl Into<String>) -> Self {
        Self::Auth {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        classify(self)
    }

    pub fn missing_credentials(family: BackendFamily, gap: &CredentialGap) -> Self {
        let owned = |keys: &[&str]| keys.iter().map(|key| key.to_string()).collect::<Vec<String>>();
        Self::MissingCredentials {
            backend: family.as_str().to_string(),
            keys: owned(gap.missing.as_slice()),
            one_of: gap.one_of.iter().map(|group| owned(group.as_slice())).collect(),
        }
    }

    /// The innermost error, unwrapping retry context.
    pub fn root(&self) -> &GenerationError {
        match self {
            Self::RetriesExhausted { source, .. } | Self::Aborted { source, .. } => source.root(),
            other => other,
        }
    }
}

fn describe_missing(keys: &[String], one_of: &[Vec<String>]) -> String {
    let alternatives = one_of
        .iter()
        .map(|group| group.join(" + "))
        .collect::<Vec<String>>()
        .join(" | ");
    match (keys.is_empty(), one_of.is_empty()) {
        (_, true) => keys.join(", "),
        (true, false) => format!("(one of: {alternatives})"),
        (false, false) => format!("{} and one of: {alternatives}", keys.join(", ")),
    }
}

fn remediation(keys: &[String], one_of: &[Vec<String>]) -> String {
    let exports = |keys: &[String]| {
        keys.iter()
            .map(|key| format!("`export {key}=...`"))
            .collect::<Vec<String>>()
            .join(" and ")
    };
    let mut steps = Vec::new();
    if !keys.is_empty() {
        steps.push(exports(keys));
    }
    if !one_of.is_empty() {
        let choices = one_of
            .iter()
            .map(|group| exports(group.as_slice()))
            .collect::<Vec<String>>()
            .join(" or ");
        steps.push(format!("either {choices}"));
    }
    let fields = keys
        .iter()
        .chain(one_of.iter().flatten())
        .map(|key| format!("`{}`", key.to_ascii_lowercase()))
        .collect::<Vec<String>>()
        .join(", ");
    format!("run {} or set {fields} in the config file", steps.join(", then "))
}

/// Structured errors are classified by kind; HTTP and backend errors by status
/// code and message text together. Unmatched errors are permanent.
pub fn classify(err: &GenerationError) -> ErrorClass {
    match err {
        GenerationError::CircuitOpen { .. } | GenerationError::HalfOpenFull { .. } => {
            ErrorClass::CircuitOpen
        }
        GenerationError::Validation { .. } | GenerationError::Catalog(_) => ErrorClass::Validation,
        GenerationError::MissingCredentials { .. } | GenerationError::Unauthorized { .. } => {
            ErrorClass::Authentication
        }
        GenerationError::Http { status, body, .. } => classify_response(Some(*status), body),
        GenerationError::Transport { source, .. } => {
            if source.is_timeout() || source.is_connect() || source.is_request() {
                ErrorClass::Transient
            } else {
                classify_response(source.status().map(|status| status.as_u16()), &source.to_string())
            }
        }
        GenerationError::Backend { message, .. } | GenerationError::Auth { message, .. } => {
            classify_message(message)
        }
        GenerationError::RetriesExhausted { source, .. } | GenerationError::Aborted { source, .. } => {
            classify(source)
        }
        GenerationError::Decode { .. }
        | GenerationError::EmptyResponse { .. }
        | GenerationError::Cancelled { .. }
        | GenerationError::Closed { .. } => ErrorClass::Permanent,
    }
}

pub fn classify_status(status: u16) -> Option<ErrorClass> {
    match status {
        401 | 403 => Some(ErrorClass::Authentication),
        429 => Some(ErrorClass::RateLimited),
        500 | 502 | 503 | 504 => Some(ErrorClass::Transient),
        400 => Some(ErrorClass::Validation),
        _ => None,
    }
}

pub fn classify_message(message: &str) -> ErrorClass {
    classify_response(None, message)
}

/// Each class matches on its status codes or its message patterns, checked
/// from authentication down to validation; the first match wins.
pub fn classify_response(status: Option<u16>, message: &str) -> ErrorClass {
    let text = message.to_ascii_lowercase();
    let by_status = status.and_then(classify_status);
    let is = |class: ErrorClass, needles: &[&str]| {
        by_status == Some(class) || needles.iter().any(|needle| text.contains(needle))
    };

    if is(
        ErrorClass::Authentication,
        &["unauthorized", "forbidden", "access denied", "accessdenied"],
    ) {
        return ErrorClass::Authentication;
    }
    if is(
        ErrorClass::RateLimited,
        &["rate limit", "ratelimit", "throttl", "too many requests", "resource_exhausted"],
    ) {
        return ErrorClass::RateLimited;
    }
    if is(
        ErrorClass::Transient,
        &[
            "unavailable",
            "server error",
            "deadline exceeded",
            "timeout",
            "timed out",
            "connection",
        ],
    ) {
        return ErrorClass::Transient;
    }
    if is(
        ErrorClass::Validation,
        &[
            "malformed",
            "invalid parameter",
            "invalid argument",
            "invalid_argument",
            "validationexception",
            "bad request",
        ],
    ) {
        return ErrorClass::Validation;
    }
    if is(ErrorClass::CircuitOpen, &["circuit breaker is open", "circuit breaker open"]) {
        return ErrorClass::CircuitOpen;
    }
    ErrorClass::Permanent
}
