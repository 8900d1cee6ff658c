use std::collections::BTreeMap;
use std::sync::Arc;

use plume_contracts::models::{BackendFamily, ModelCatalog, ModelSpec};
use plume_contracts::{ClientConfig, CredentialResolver};
use tracing::debug;

use crate::breaker::{BreakerConfig, CircuitBreaker, Clock, SystemClock, TransitionObserver};
use crate::error::{GenerationError, Result};
use crate::providers::{BackendContext, BedrockClient, GeminiClient, ImageBackend, VertexClient};
use crate::retry::{CancellableSleeper, RetryPolicy, Sleeper};

pub type ClientFactory = fn(&BackendContext) -> Result<Box<dyn ImageBackend>>;

/// A catalog entry paired with the constructor for its backend client.
#[derive(Clone)]
pub struct ModelProvider {
    pub spec: ModelSpec,
    pub factory: ClientFactory,
}

impl std::fmt::Debug for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProvider")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

pub fn factory_for(family: BackendFamily) -> ClientFactory {
    match family {
        BackendFamily::Gemini => gemini_client,
        BackendFamily::Vertex => vertex_client,
        BackendFamily::Bedrock => bedrock_client,
    }
}

fn gemini_client(context: &BackendContext) -> Result<Box<dyn ImageBackend>> {
    Ok(Box::new(GeminiClient::new(context)?))
}

fn vertex_client(context: &BackendContext) -> Result<Box<dyn ImageBackend>> {
    Ok(Box::new(VertexClient::new(context)?))
}

fn bedrock_client(context: &BackendContext) -> Result<Box<dyn ImageBackend>> {
    Ok(Box::new(BedrockClient::new(context)?))
}

/// Read-only after construction. Holds one circuit breaker per backend family,
/// shared by every client the registry creates for that family.
pub struct ProviderRegistry {
    catalog: ModelCatalog,
    breakers: BTreeMap<&'static str, Arc<CircuitBreaker>>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl ProviderRegistry {
    pub fn new(catalog: ModelCatalog, config: &ClientConfig) -> Self {
        Self::builder(catalog, config).build()
    }

    pub fn builder(catalog: ModelCatalog, config: &ClientConfig) -> ProviderRegistryBuilder {
        ProviderRegistryBuilder {
            catalog,
            breaker: BreakerConfig::from(&config.breaker),
            retry: RetryPolicy::from(&config.retry),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(CancellableSleeper),
            observer: None,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn breaker(&self, family: BackendFamily) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(family.as_str())
    }

    /// Canonical id first, then alias; unknown names are an error.
    pub fn resolve(&self, name: &str) -> Result<ModelProvider> {
        let spec = self.catalog.resolve(name)?;
        Ok(ModelProvider {
            spec: spec.clone(),
            factory: factory_for(spec.family),
        })
    }

    /// Every required credential and the family's auth methods are checked
    /// before the client is built, and everything missing is reported at once.
    pub fn create_client(
        &self,
        name: &str,
        resolver: &CredentialResolver,
        config: &ClientConfig,
    ) -> Result<Box<dyn ImageBackend>> {
        let provider = self.resolve(name)?;
        let breaker = self
            .breaker(provider.spec.family)
            .cloned()
            .ok_or_else(|| GenerationError::validation(provider.spec.family.as_str(), "no circuit breaker registered"))?;
        let context = BackendContext::new(
            provider.spec,
            resolver,
            config,
            breaker,
            self.retry.clone(),
            self.sleeper.clone(),
        );
        context.ensure_complete()?;
        debug!(model = %context.model.id, family = %context.model.family, "creating client");
        (provider.factory)(&context)
    }

    /// Whether a client for `spec` could be built with the credentials at hand.
    pub fn has_credentials(
        &self,
        spec: &ModelSpec,
        resolver: &CredentialResolver,
        config: &ClientConfig,
    ) -> bool {
        spec.credential_gap(&resolver.gather(&spec.credential_keys(), config))
            .is_empty()
    }
}

pub struct ProviderRegistryBuilder {
    catalog: ModelCatalog,
    breaker: BreakerConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    observer: Option<TransitionObserver>,
}

impl ProviderRegistryBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> ProviderRegistry {
        let breakers = BackendFamily::ALL
            .iter()
            .map(|family| {
                let mut breaker =
                    CircuitBreaker::with_clock(family.as_str(), self.breaker.clone(), self.clock.clone());
                if let Some(observer) = &self.observer {
                    breaker = breaker.with_observer(observer.clone());
                }
                (family.as_str(), Arc::new(breaker))
            })
            .collect();
        ProviderRegistry {
            catalog: self.catalog,
            breakers,
            retry: self.retry,
            sleeper: self.sleeper,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use plume_contracts::credentials::{
        AWS_ACCESS_KEY_ID, AWS_BEARER_TOKEN_BEDROCK, AWS_REGION, AWS_SECRET_ACCESS_KEY,
        GEMINI_API_KEY, GOOGLE_APPLICATION_CREDENTIALS, GOOGLE_CLOUD_LOCATION,
        GOOGLE_CLOUD_PROJECT, VERTEX_API_KEY,
    };
    use plume_contracts::CatalogError;

    use super::*;
    use crate::breaker::CircuitState;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(ModelCatalog::default(), &ClientConfig::default())
    }

    fn resolver(pairs: &[(&str, &str)]) -> CredentialResolver {
        CredentialResolver::new(
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<BTreeMap<String, String>>(),
        )
    }

    #[test]
    fn alias_and_canonical_name_resolve_to_same_provider() -> Result<()> {
        let registry = registry();
        let by_alias = registry.resolve("gemini-flash")?;
        let by_id = registry.resolve("gemini-2.5-flash-image")?;
        assert_eq!(by_alias.spec, by_id.spec);
        Ok(())
    }

    #[test]
    fn unknown_model_is_not_found() {
        let err = registry().resolve("not-a-real-model").err();
        assert!(matches!(
            err,
            Some(GenerationError::Catalog(CatalogError::UnknownModel { .. }))
        ));
    }

    #[test]
    fn missing_required_credentials_are_reported_together() {
        let err = registry()
            .create_client("imagen-4", &resolver(&[]), &ClientConfig::default())
            .err();
        match err {
            Some(GenerationError::MissingCredentials { backend, keys, one_of }) => {
                assert_eq!(backend, "vertex");
                assert_eq!(keys, vec![GOOGLE_CLOUD_PROJECT, GOOGLE_CLOUD_LOCATION]);
                assert_eq!(
                    one_of,
                    vec![vec![VERTEX_API_KEY], vec![GOOGLE_APPLICATION_CREDENTIALS]]
                );
            }
            other => panic!("expected missing credentials, got {other:?}"),
        }
    }

    #[test]
    fn region_and_auth_alternatives_are_reported_in_one_error() {
        let err = registry()
            .create_client("nova-canvas", &resolver(&[]), &ClientConfig::default())
            .err();
        match &err {
            Some(GenerationError::MissingCredentials { keys, one_of, .. }) => {
                assert_eq!(keys, &vec![AWS_REGION]);
                assert_eq!(
                    one_of,
                    &vec![
                        vec![AWS_BEARER_TOKEN_BEDROCK],
                        vec![AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY],
                    ]
                );
            }
            other => panic!("expected missing credentials, got {other:?}"),
        }
        let text = err.map(|err| err.to_string()).unwrap_or_default();
        assert!(
            text.contains("AWS_REGION and one of: AWS_BEARER_TOKEN_BEDROCK | AWS_ACCESS_KEY_ID + AWS_SECRET_ACCESS_KEY"),
            "{text}"
        );
        assert!(!text.contains("`export AWS_BEARER_TOKEN_BEDROCK=...` and"), "{text}");
    }

    #[test]
    fn config_credentials_satisfy_requirements() -> Result<()> {
        let config = ClientConfig {
            gemini_api_key: Some("from-config".to_string()),
            ..ClientConfig::default()
        };
        let client = registry().create_client("nano-banana", &resolver(&[]), &config)?;
        assert_eq!(client.family(), BackendFamily::Gemini);
        assert_eq!(client.model(), "gemini-2.5-flash-image");
        Ok(())
    }

    #[test]
    fn clients_of_one_family_share_a_breaker() -> Result<()> {
        let registry = registry();
        let resolver = resolver(&[
            (GOOGLE_CLOUD_PROJECT, "p"),
            (GOOGLE_CLOUD_LOCATION, "us-central1"),
            (VERTEX_API_KEY, "k"),
            (AWS_REGION, "us-east-1"),
            (AWS_BEARER_TOKEN_BEDROCK, "t"),
            (GEMINI_API_KEY, "g"),
        ]);
        let config = ClientConfig::default();
        registry.create_client("imagen-4", &resolver, &config)?;
        registry.create_client("imagen-3", &resolver, &config)?;
        registry.create_client("nova", &resolver, &config)?;

        let vertex = registry.breaker(BackendFamily::Vertex).cloned();
        let bedrock = registry.breaker(BackendFamily::Bedrock).cloned();
        let (Some(vertex), Some(bedrock)) = (vertex, bedrock) else {
            panic!("breakers missing");
        };
        for _ in 0..5 {
            let _ = vertex.execute(|| -> Result<()> { Err(GenerationError::validation("vertex", "x")) });
        }
        assert_eq!(vertex.state(), CircuitState::Open);
        assert_eq!(bedrock.state(), CircuitState::Closed);
        Ok(())
    }

    #[test]
    fn usable_check_needs_a_complete_auth_method() -> Result<()> {
        fn usable(registry: &ProviderRegistry, spec: &ModelSpec, pairs: &[(&str, &str)]) -> bool {
            registry.has_credentials(spec, &resolver(pairs), &ClientConfig::default())
        }
        let registry = registry();
        let spec = registry.resolve("nova-canvas")?.spec;
        assert!(!usable(&registry, &spec, &[]));
        assert!(!usable(&registry, &spec, &[(AWS_REGION, "us-east-1")]));
        assert!(!usable(&registry, &spec, &[(AWS_REGION, "us-east-1"), (AWS_ACCESS_KEY_ID, "AKID")]));
        assert!(usable(&registry, &spec, &[(AWS_REGION, "us-east-1"), (AWS_BEARER_TOKEN_BEDROCK, "t")]));
        assert!(usable(
            &registry,
            &spec,
            &[
                (AWS_REGION, "us-east-1"),
                (AWS_ACCESS_KEY_ID, "AKID"),
                (AWS_SECRET_ACCESS_KEY, "secret"),
            ]
        ));
        Ok(())
    }
}
