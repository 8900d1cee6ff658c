mod registry;
mod selectors;

pub use registry::{BackendFamily, CatalogError, ModelCatalog, ModelPricing, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector};
