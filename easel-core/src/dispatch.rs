use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::{
    Error, GenerationRequest, HubFactory, ModelFactory, ModelRegistry, PipelineSettings,
    TextToImage,
};

type PipelineCell = Arc<OnceCell<Arc<dyn TextToImage>>>;

/// Owns the model registry and the pipeline cache.
///
/// Each registered key moves through `unloaded -> loading -> ready` exactly
/// once: the first resolve builds the pipeline, every later resolve returns
/// the cached instance. Entries are never evicted. Concurrent first resolves
/// of the same key share a single build through a per-key one-shot cell;
/// different keys never wait on each other.
pub struct Dispatcher<F = HubFactory> {
    registry: ModelRegistry,
    settings: PipelineSettings,
    factory: F,
    pipelines: Mutex<HashMap<String, PipelineCell>>,
}

impl<F: ModelFactory> Dispatcher<F> {
    pub fn new(registry: ModelRegistry, settings: PipelineSettings, factory: F) -> Self {
        Self {
            registry,
            settings,
            factory,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Return the pipeline for `key`, building and caching it on first use.
    ///
    /// An unknown key fails without touching the cache. A failed build leaves
    /// the key unloaded, so a later call may attempt it again.
    pub async fn resolve(&self, key: &str) -> Result<Arc<dyn TextToImage>, Error> {
        let source = self
            .registry
            .get(key)
            .map(str::to_string)
            .ok_or_else(|| Error::UnknownModel(key.to_string()))?;

        let cell = {
            let mut pipelines = self.pipelines.lock().unwrap();
            pipelines
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let pipeline = cell
            .get_or_try_init(|| async {
                info!("loading pipeline for {key} from {source}");
                self.factory.build(key, &source, &self.settings).await
            })
            .await
            .map_err(|source| Error::Load {
                model: key.to_string(),
                source,
            })?;

        Ok(Arc::clone(pipeline))
    }

    /// Run one prompt-to-image pass, resolving the pipeline first.
    ///
    /// Failures are logged once here with their message and returned
    /// unchanged; there is no retry, no fallback model and no partial result.
    pub async fn generate(&self, request: GenerationRequest) -> Result<DynamicImage, Error> {
        let key = request
            .model
            .clone()
            .unwrap_or_else(|| self.registry.default_key().to_string());

        let result = match self.resolve(&key).await {
            Ok(pipeline) => pipeline
                .run(request)
                .map_err(|source| Error::Inference { source }),
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            error!("generation failed: {err}");
        }
        result
    }
}
