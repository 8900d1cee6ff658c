use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::credentials::{
    AuthMethod, CredentialGap, Credentials, AWS_ACCESS_KEY_ID, AWS_BEARER_TOKEN_BEDROCK, AWS_REGION, AWS_SECRET_ACCESS_KEY,
    AWS_SESSION_TOKEN, GEMINI_API_KEY, GOOGLE_APPLICATION_CREDENTIALS, GOOGLE_CLOUD_LOCATION,
    GOOGLE_CLOUD_PROJECT, VERTEX_API_KEY,
};

static VERTEX_AUTH: [AuthMethod; 2] = [
    AuthMethod {
        name: "api-key",
        keys: &[VERTEX_API_KEY],
    },
    AuthMethod {
        name: "service-account",
        keys: &[GOOGLE_APPLICATION_CREDENTIALS],
    },
];

static BEDROCK_AUTH: [AuthMethod; 2] = [
    AuthMethod {
        name: "bearer-token",
        keys: &[AWS_BEARER_TOKEN_BEDROCK],
    },
    AuthMethod {
        name: "sigv4",
        keys: &[AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFamily {
    Gemini,
    Vertex,
    Bedrock,
}

impl BackendFamily {
    pub const ALL: [BackendFamily; 3] = [Self::Gemini, Self::Vertex, Self::Bedrock];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Vertex => "vertex",
            Self::Bedrock => "bedrock",
        }
    }

    pub fn required_credentials(&self) -> &'static [&'static str] {
        match self {
            Self::Gemini => &[GEMINI_API_KEY],
            Self::Vertex => &[GOOGLE_CLOUD_PROJECT, GOOGLE_CLOUD_LOCATION],
            Self::Bedrock => &[AWS_REGION],
        }
    }

    /// Alternative ways to authenticate, in order of preference. Gemini's key
    /// is simply required.
    pub fn auth_methods(&self) -> &'static [AuthMethod] {
        match self {
            Self::Gemini => &[],
            Self::Vertex => &VERTEX_AUTH,
            Self::Bedrock => &BEDROCK_AUTH,
        }
    }

    pub fn optional_credentials(&self) -> &'static [&'static str] {
        match self {
            Self::Gemini => &[],
            Self::Vertex => &[VERTEX_API_KEY, GOOGLE_APPLICATION_CREDENTIALS],
            Self::Bedrock => &[
                AWS_BEARER_TOKEN_BEDROCK,
                AWS_ACCESS_KEY_ID,
                AWS_SECRET_ACCESS_KEY,
                AWS_SESSION_TOKEN,
            ],
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informational only; selection uses `ModelSpec::priority`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub usd_per_image: Option<f64>,
    pub max_dimension: u32,
    pub supports_negative_prompt: bool,
    pub supports_seed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub id: String,
    pub display_name: String,
    pub aliases: Vec<String>,
    pub family: BackendFamily,
    pub required_credentials: Vec<&'static str>,
    pub optional_credentials: Vec<&'static str>,
    /// At least one must be complete on top of `required_credentials`.
    pub auth_methods: Vec<AuthMethod>,
    pub pricing: ModelPricing,
    /// Lower sorts first.
    pub priority: u32,
}

impl ModelSpec {
    pub fn new(
        id: &str,
        display_name: &str,
        aliases: &[&str],
        family: BackendFamily,
        priority: u32,
        pricing: ModelPricing,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            aliases: aliases.iter().map(|alias| (*alias).to_string()).collect(),
            family,
            required_credentials: family.required_credentials().to_vec(),
            optional_credentials: family.optional_credentials().to_vec(),
            auth_methods: family.auth_methods().to_vec(),
            pricing,
            priority,
        }
    }

    /// Empty when `credentials` are enough to build a client.
    pub fn credential_gap(&self, credentials: &Credentials) -> CredentialGap {
        credentials.gap(&self.required_credentials, &self.auth_methods)
    }

    /// Required keys first, then optional ones, in declaration order.
    pub fn credential_keys(&self) -> Vec<&'static str> {
        self.required_credentials
            .iter()
            .chain(self.optional_credentials.iter())
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown model '{name}'; run `plume-rs models` to list available models")]
    UnknownModel { name: String },
    #[error("no model specified and no model has complete credentials")]
    NoModelAvailable,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelSpec>,
    aliases: HashMap<String, String>,
}

impl ModelCatalog {
    pub fn new(models: Option<Vec<ModelSpec>>) -> Self {
        let mut catalog = Self {
            models: IndexMap::new(),
            aliases: HashMap::new(),
        };
        for model in models.unwrap_or_else(default_models) {
            catalog.insert(model);
        }
        catalog
    }

    fn insert(&mut self, model: ModelSpec) {
        let key = lookup_key(&model.id);
        if self.models.contains_key(&key) {
            warn!(model = %model.id, "duplicate model id ignored");
            return;
        }
        for alias in &model.aliases {
            let alias_key = lookup_key(alias);
            if let Some(existing) = self.aliases.get(&alias_key) {
                warn!(alias = %alias, existing = %existing, model = %model.id, "duplicate alias ignored");
                continue;
            }
            self.aliases.insert(alias_key, key.clone());
        }
        self.models.insert(key, model);
    }

    /// Canonical id first, then alias. Never falls back to a default.
    pub fn resolve(&self, name: &str) -> Result<&ModelSpec, CatalogError> {
        let key = lookup_key(name);
        if let Some(model) = self.models.get(&key) {
            return Ok(model);
        }
        self.aliases
            .get(&key)
            .and_then(|id| self.models.get(id))
            .ok_or_else(|| CatalogError::UnknownModel {
                name: name.trim().to_string(),
            })
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.models.get(&lookup_key(id))
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_priority(&self) -> Vec<&ModelSpec> {
        let mut models = self.models.values().collect::<Vec<&ModelSpec>>();
        models.sort_by_key(|model| model.priority);
        models
    }

    pub fn by_family(&self, family: BackendFamily) -> Vec<&ModelSpec> {
        self.models
            .values()
            .filter(|model| model.family == family)
            .collect()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn lookup_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn default_models() -> Vec<ModelSpec> {
    let pricing = |usd: f64, max_dimension: u32, negative: bool, seed: bool| ModelPricing {
        usd_per_image: Some(usd),
        max_dimension,
        supports_negative_prompt: negative,
        supports_seed: seed,
    };

    vec![
        ModelSpec::new(
            "gemini-2.5-flash-image",
            "Gemini 2.5 Flash Image",
            &["gemini-flash", "gemini-flash-image", "nano-banana"],
            BackendFamily::Gemini,
            10,
            pricing(0.039, 1024, false, false),
        ),
        ModelSpec::new(
            "gemini-3-pro-image-preview",
            "Gemini 3 Pro Image (preview)",
            &["gemini-pro", "gemini-pro-image", "nano-banana-pro"],
            BackendFamily::Gemini,
            20,
            pricing(0.134, 4096, false, false),
        ),
        ModelSpec::new(
            "imagen-4.0-generate-001",
            "Imagen 4",
            &["imagen", "imagen-4"],
            BackendFamily::Vertex,
            30,
            pricing(0.04, 2048, true, true),
        ),
        ModelSpec::new(
            "imagen-4.0-ultra-generate-001",
            "Imagen 4 Ultra",
            &["imagen-4-ultra", "imagen-ultra"],
            BackendFamily::Vertex,
            40,
            pricing(0.06, 2048, true, true),
        ),
        ModelSpec::new(
            "imagen-4.0-fast-generate-001",
            "Imagen 4 Fast",
            &["imagen-4-fast", "imagen-fast"],
            BackendFamily::Vertex,
            50,
            pricing(0.02, 1024, true, true),
        ),
        ModelSpec::new(
            "imagen-3.0-generate-002",
            "Imagen 3",
            &["imagen-3"],
            BackendFamily::Vertex,
            60,
            pricing(0.04, 1024, true, true),
        ),
        ModelSpec::new(
            "amazon.nova-canvas-v1:0",
            "Amazon Nova Canvas",
            &["nova-canvas", "nova"],
            BackendFamily::Bedrock,
            70,
            pricing(0.04, 2048, true, true),
        ),
        ModelSpec::new(
            "amazon.titan-image-generator-v2:0",
            "Amazon Titan Image Generator v2",
            &["titan-image", "titan-v2"],
            BackendFamily::Bedrock,
            80,
            pricing(0.01, 1408, true, true),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, aliases: &[&str], priority: u32) -> ModelSpec {
        ModelSpec::new(
            id,
            id,
            aliases,
            BackendFamily::Gemini,
            priority,
            ModelPricing {
                usd_per_image: None,
                max_dimension: 1024,
                supports_negative_prompt: false,
                supports_seed: false,
            },
        )
    }

    #[test]
    fn alias_and_canonical_id_resolve_to_same_model() -> Result<(), CatalogError> {
        let catalog = ModelCatalog::default();
        let by_alias = catalog.resolve("gemini-flash")?;
        let by_id = catalog.resolve("gemini-2.5-flash-image")?;
        assert_eq!(by_alias, by_id);
        assert_eq!(by_alias.family, BackendFamily::Gemini);
        Ok(())
    }

    #[test]
    fn unknown_name_is_an_error_not_a_default() {
        let catalog = ModelCatalog::default();
        assert_eq!(
            catalog.resolve("not-a-real-model"),
            Err(CatalogError::UnknownModel {
                name: "not-a-real-model".to_string()
            })
        );
    }

    #[test]
    fn lookups_ignore_case_and_whitespace() -> Result<(), CatalogError> {
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.resolve("  Nova-Canvas ")?.id, "amazon.nova-canvas-v1:0");
        assert_eq!(catalog.resolve("AMAZON.NOVA-CANVAS-V1:0")?.id, "amazon.nova-canvas-v1:0");
        Ok(())
    }

    #[test]
    fn canonical_id_beats_alias_with_same_spelling() -> Result<(), CatalogError> {
        let catalog = ModelCatalog::new(Some(vec![
            spec("model-a", &["model-b"], 1),
            spec("model-b", &[], 2),
        ]));
        assert_eq!(catalog.resolve("model-b")?.id, "model-b");
        Ok(())
    }

    #[test]
    fn first_registration_keeps_a_contested_alias() -> Result<(), CatalogError> {
        let catalog = ModelCatalog::new(Some(vec![
            spec("first", &["shared"], 1),
            spec("second", &["shared"], 2),
        ]));
        assert_eq!(catalog.resolve("shared")?.id, "first");
        Ok(())
    }

    #[test]
    fn credentials_follow_backend_family() -> Result<(), CatalogError> {
        let catalog = ModelCatalog::default();
        let vertex = catalog.resolve("imagen-4")?;
        assert_eq!(
            vertex.required_credentials,
            vec![GOOGLE_CLOUD_PROJECT, GOOGLE_CLOUD_LOCATION]
        );
        assert!(vertex.credential_keys().contains(&VERTEX_API_KEY));
        let bedrock = catalog.resolve("titan-image")?;
        assert_eq!(bedrock.required_credentials, vec![AWS_REGION]);
        Ok(())
    }

    #[test]
    fn priority_order_is_stable() {
        let catalog = ModelCatalog::new(Some(vec![
            spec("late", &[], 9),
            spec("early", &[], 1),
            spec("tie-a", &[], 5),
            spec("tie-b", &[], 5),
        ]));
        let ids = catalog
            .by_priority()
            .iter()
            .map(|model| model.id.as_str())
            .collect::<Vec<&str>>();
        assert_eq!(ids, vec!["early", "tie-a", "tie-b", "late"]);
    }
}
