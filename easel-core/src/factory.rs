use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;

use crate::{Loader, PipelineSettings, StableDiffusionLoader, TextToImage};

/// Pipeline architectures this crate knows how to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    StableDiffusionV1,
}

impl ModelKind {
    /// Detect the architecture from a model source identifier.
    pub fn from_source(source: &str) -> Option<Self> {
        let upper = source.to_uppercase();
        if upper.contains("STABLE-DIFFUSION") {
            Some(Self::StableDiffusionV1)
        } else {
            None
        }
    }
}

/// Seam between the dispatcher and the loaders, so tests can substitute a
/// stub that counts constructions instead of downloading weights.
pub trait ModelFactory: Send + Sync {
    fn build(
        &self,
        key: &str,
        source: &str,
        settings: &PipelineSettings,
    ) -> impl Future<Output = Result<Arc<dyn TextToImage>>> + Send;
}

/// Production factory: detects the architecture from the source identifier
/// and loads weights through the Hugging Face hub client.
#[derive(Clone)]
pub struct HubFactory {
    api: Api,
}

impl HubFactory {
    pub fn new() -> Result<Self> {
        Ok(Self { api: Api::new()? })
    }

    pub fn with_api(api: Api) -> Self {
        Self { api }
    }
}

impl ModelFactory for HubFactory {
    async fn build(
        &self,
        _key: &str,
        source: &str,
        settings: &PipelineSettings,
    ) -> Result<Arc<dyn TextToImage>> {
        let kind = ModelKind::from_source(source)
            .ok_or_else(|| anyhow!("unsupported model source: {source}"))?;

        match kind {
            ModelKind::StableDiffusionV1 => {
                let pipeline =
                    StableDiffusionLoader::load(source, self.api.clone(), settings).await?;
                Ok(Arc::new(pipeline))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_diffusion_sources_are_detected() {
        assert_eq!(
            ModelKind::from_source("runwayml/stable-diffusion-v1-5"),
            Some(ModelKind::StableDiffusionV1)
        );
        assert_eq!(
            ModelKind::from_source("stable-diffusion-v1-5/stable-diffusion-v1-5"),
            Some(ModelKind::StableDiffusionV1)
        );
    }

    #[test]
    fn other_architectures_are_not_claimed() {
        assert_eq!(ModelKind::from_source("black-forest-labs/FLUX.1-schnell"), None);
        assert_eq!(ModelKind::from_source("google/t5-v1_1-xxl"), None);
    }
}
