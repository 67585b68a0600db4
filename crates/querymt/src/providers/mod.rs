mod queries;
#[cfg(feature = "http-client")]
mod registry;
mod types;

#[cfg(feature = "http-client")]
pub use registry::{read_providers_from_cache, update_providers_if_stale};
pub use types::{
    Modalities, ModelCapabilities, ModelConstraints, ModelInfo, ModelPricing, ProviderInfo,
    ProvidersRegistry,
};
