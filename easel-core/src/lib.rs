//! Cached text-to-image diffusion pipelines behind one generate call.
//!
//! The heavy lifting (CLIP text encoding, U-Net denoising, VAE decoding and
//! the scheduler math) lives in candle. This crate owns the mapping from a
//! short model key to a ready-to-run pipeline: a [`ModelRegistry`] names the
//! models, a [`Dispatcher`] builds each pipeline once on first use and caches
//! it, and [`Dispatcher::generate`] turns a prompt into a single image.

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
mod dispatch;
mod error;
mod factory;
pub mod loader;
mod registry;
mod stable_diffusion;
mod util;

pub use device_map::*;
pub use dispatch::Dispatcher;
pub use error::Error;
pub use factory::*;
pub use loader::*;
pub use registry::{ModelRegistry, DEFAULT_MODEL_KEY};
pub use stable_diffusion::{StableDiffusion, StableDiffusionLoader};
pub(crate) use util::*;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Sampling steps used when a request does not specify any.
pub const DEFAULT_STEPS: usize = 20;
/// Guidance scale used when a request does not specify one.
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
/// Default output width in pixels.
pub const DEFAULT_WIDTH: usize = 256;
/// Default output height in pixels.
pub const DEFAULT_HEIGHT: usize = 256;

/// One prompt-to-image request.
///
/// Every field except the prompt is optional; unset fields fall back to the
/// dispatcher defaults ([`DEFAULT_STEPS`], [`DEFAULT_GUIDANCE_SCALE`], the
/// registry's default model). Output dimensions are pipeline configuration,
/// not request parameters.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Registry key of the model to run.
    pub model: Option<String>,
    /// Number of denoising steps. More steps are slower and usually sharper.
    pub steps: Option<usize>,
    /// How strongly sampling follows the prompt over free generation.
    pub guidance: Option<f64>,
    /// Seed for the device RNG, for reproducibility.
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            steps: None,
            guidance: None,
            seed: None,
        }
    }
}

/// Sampling scheduler family a pipeline is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    /// Fast multistep predictor-corrector solver; usable at low step counts.
    UniPcMultistep,
    /// The engine's conventional single-step DDIM scheduler.
    Ddim,
}

serde_plain::derive_fromstr_from_deserialize!(SchedulerKind);
serde_plain::derive_display_from_serialize!(SchedulerKind);

/// Dispatcher-level pipeline configuration.
///
/// Weights are always loaded as full-precision (F32) memory-mapped
/// safetensors; everything a deployment may want to vary lives here.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub device_map: DeviceMap,
    pub scheduler: SchedulerKind,
    /// Output width in pixels, independent of anything the prompt implies.
    /// Must be divisible by 8 (the VAE's spatial downscale).
    pub width: usize,
    /// Output height in pixels. Must be divisible by 8.
    pub height: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            device_map: DeviceMap::ForceCpu,
            scheduler: SchedulerKind::UniPcMultistep,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

/// A ready-to-run text-to-image pipeline.
pub trait TextToImage: Send + Sync + std::fmt::Debug {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}
