use super::registry::{CatalogError, ModelCatalog, ModelSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub reason: Option<String>,
}

/// Caller-side selection policy on top of the catalog. A named model is used as
/// given or rejected; only an absent name falls through to static priority.
#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub catalog: ModelCatalog,
}

impl ModelSelector {
    pub fn new(catalog: Option<ModelCatalog>) -> Self {
        Self {
            catalog: catalog.unwrap_or_default(),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        usable: impl Fn(&ModelSpec) -> bool,
    ) -> Result<ModelSelection, CatalogError> {
        if let Some(requested_value) = requested.map(str::trim).filter(|value| !value.is_empty()) {
            let model = self.catalog.resolve(requested_value)?;
            let reason = (model.id != requested_value)
                .then(|| format!("Resolved '{requested_value}' to '{}'.", model.id));
            return Ok(ModelSelection {
                model: model.clone(),
                requested: Some(requested_value.to_string()),
                reason,
            });
        }

        let Some(model) = self
            .catalog
            .by_priority()
            .into_iter()
            .find(|model| usable(model))
        else {
            return Err(CatalogError::NoModelAvailable);
        };
        Ok(ModelSelection {
            model: model.clone(),
            requested: None,
            reason: Some(format!(
                "No model specified; using '{}' (highest priority with credentials).",
                model.id
            )),
        })
    }
}
