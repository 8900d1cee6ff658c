use std::collections::BTreeMap;
use std::env;
use std::fmt;

use tracing::debug;

use crate::config::ClientConfig;

pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const GOOGLE_CLOUD_PROJECT: &str = "GOOGLE_CLOUD_PROJECT";
pub const GOOGLE_CLOUD_LOCATION: &str = "GOOGLE_CLOUD_LOCATION";
pub const VERTEX_API_KEY: &str = "VERTEX_API_KEY";
pub const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const AWS_REGION: &str = "AWS_REGION";
pub const AWS_BEARER_TOKEN_BEDROCK: &str = "AWS_BEARER_TOKEN_BEDROCK";
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// One way of authenticating with a backend. Every key in it must be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthMethod {
    pub name: &'static str,
    pub keys: &'static [&'static str],
}

/// What is still unset before a client can be built. Any single group in
/// `one_of` is enough.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialGap {
    pub missing: Vec<&'static str>,
    pub one_of: Vec<Vec<&'static str>>,
}

impl CredentialGap {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.one_of.is_empty()
    }
}

/// Gathered credential values keyed by environment variable name. Keys that
/// neither source provided are present with an empty value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|key| !self.has(key))
            .collect()
    }

    /// Required keys that are unset, plus the unset keys of every auth method
    /// when none of them is complete.
    pub fn gap(&self, required: &[&'static str], methods: &[AuthMethod]) -> CredentialGap {
        let complete = methods.is_empty()
            || methods
                .iter()
                .any(|method| self.missing(method.keys).is_empty());
        CredentialGap {
            missing: self.missing(required),
            one_of: if complete {
                Vec::new()
            } else {
                methods.iter().map(|method| self.missing(method.keys)).collect()
            },
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.values {
            map.entry(key, &if value.is_empty() { "<empty>" } else { "<set>" });
        }
        map.finish()
    }
}

pub struct CredentialResolver {
    env: Box<dyn EnvSource>,
}

impl CredentialResolver {
    pub fn new(env: impl EnvSource + 'static) -> Self {
        Self { env: Box::new(env) }
    }

    pub fn from_process_env() -> Self {
        Self::new(ProcessEnv)
    }

    /// Environment variable only, trimmed; blank counts as unset.
    pub fn env_var(&self, key: &str) -> Option<String> {
        self.env
            .var(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn gather(&self, keys: &[&str], config: &ClientConfig) -> Credentials {
        let mut credentials = Credentials::default();
        for key in keys {
            let value = if let Some(value) = self.env_var(key) {
                debug!(key, source = "env", "credential resolved");
                value
            } else if let Some(value) = config.credential(key) {
                debug!(key, source = "config", "credential resolved");
                value.to_string()
            } else {
                debug!(key, "credential unresolved");
                String::new()
            };
            credentials.insert(*key, value);
        }
        credentials
    }
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver").finish_non_exhaustive()
    }
}
