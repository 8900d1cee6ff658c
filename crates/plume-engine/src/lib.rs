pub mod auth;
pub mod breaker;
pub mod error;
pub mod providers;
pub mod registry;
pub mod retry;

use chrono::{SecondsFormat, Utc};
use plume_contracts::models::{ModelCatalog, ModelSelection, ModelSelector, ModelSpec};
use plume_contracts::{ClientConfig, CredentialResolver, GeneratedImage, GenerationRequest};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub use breaker::{CircuitBreaker, CircuitState, CircuitTransition};
pub use error::{classify, ErrorClass, GenerationError, Result};
pub use providers::ImageBackend;
pub use registry::{ModelProvider, ProviderRegistry};
pub use retry::{CancelToken, RetryPolicy};

/// Caller-facing entry point: picks a model, builds its client and runs one
/// generation through it.
pub struct ImageEngine {
    registry: ProviderRegistry,
    resolver: CredentialResolver,
    config: ClientConfig,
}

#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub spec: ModelSpec,
    pub has_credentials: bool,
}

impl ImageEngine {
    pub fn new(config: ClientConfig) -> Self {
        let registry = ProviderRegistry::new(ModelCatalog::default(), &config);
        Self::with_parts(registry, CredentialResolver::from_process_env(), config)
    }

    pub fn with_parts(
        registry: ProviderRegistry,
        resolver: CredentialResolver,
        config: ClientConfig,
    ) -> Self {
        Self {
            registry,
            resolver,
            config,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn models(&self) -> Vec<ModelStatus> {
        self.registry
            .catalog()
            .by_priority()
            .into_iter()
            .map(|spec| ModelStatus {
                spec: spec.clone(),
                has_credentials: self.registry.has_credentials(spec, &self.resolver, &self.config),
            })
            .collect()
    }

    /// An explicit name (request, then configured default) must resolve;
    /// otherwise the highest-priority model with credentials is chosen.
    pub fn select_model(&self, requested: Option<&str>) -> Result<ModelSelection> {
        let requested = requested.or(self.config.default_model.as_deref());
        let selector = ModelSelector::new(Some(self.registry.catalog().clone()));
        let selection = selector.select(requested, |spec| {
            self.registry.has_credentials(spec, &self.resolver, &self.config)
        })?;
        Ok(selection)
    }

    pub fn generate(&self, request: &GenerationRequest, cancel: &CancelToken) -> Result<GeneratedImage> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("generate", request_id = %request_id);
        let _entered = span.enter();

        let selection = self.select_model(request.model())?;
        if let Some(reason) = selection.reason.as_deref() {
            info!(model = %selection.model.id, "{reason}");
        }

        let client = self
            .registry
            .create_client(&selection.model.id, &self.resolver, &self.config)?;
        let result = client.generate_image(&request.prompt, &request.options, cancel);
        client.close();

        match result {
            Ok(mut image) => {
                image.metadata.insert("request_id".to_string(), request_id);
                image.metadata.insert(
                    "created_at".to_string(),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                );
                info!(
                    model = %selection.model.id,
                    bytes = image.data.len(),
                    format = %image.format,
                    width = image.width,
                    height = image.height,
                    "image generated"
                );
                Ok(image)
            }
            Err(err) => {
                warn!(model = %selection.model.id, class = %err.class(), error = %err, "generation failed");
                Err(err)
            }
        }
    }
}
