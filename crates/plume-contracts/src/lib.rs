pub mod config;
pub mod credentials;
pub mod models;
pub mod request;

pub use config::ClientConfig;
pub use credentials::{
    AuthMethod, CredentialGap, CredentialResolver, Credentials, EnvSource, ProcessEnv,
};
pub use models::{BackendFamily, CatalogError, ModelCatalog, ModelSpec};
pub use request::{GenerateOptions, GeneratedImage, GenerationRequest, ImageFormat};
