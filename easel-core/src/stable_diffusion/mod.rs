use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    clip::{self, ClipTextTransformer},
    ddim::DDIMSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig},
    uni_pc::UniPCSchedulerConfig,
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::{
    select_device, tensor_to_image, GenerationRequest, Loader, PipelineSettings, SchedulerKind,
    TextToImage, DEFAULT_GUIDANCE_SCALE, DEFAULT_STEPS,
};

/// Repo carrying the CLIP tokenizer files shared by v1.x checkpoints.
const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// CLIP context length; prompts are padded or truncated to this.
const CLIP_TOKEN_LIMIT: usize = 77;
const CLIP_PAD_TOKEN: u32 = 49407;

/// Latent-to-pixel scale used by the v1.x VAE.
const VAE_SCALE: f64 = 0.18215;

impl SchedulerKind {
    pub(crate) fn build(self, steps: usize) -> candle_core::Result<Box<dyn Scheduler>> {
        let config: Box<dyn SchedulerConfig> = match self {
            Self::UniPcMultistep => Box::new(UniPCSchedulerConfig::default()),
            Self::Ddim => Box::new(DDIMSchedulerConfig::default()),
        };
        config.build(steps)
    }
}

/// A Stable Diffusion v1.x pipeline assembled from hub weights.
///
/// Holds the tokenizer, the CLIP text encoder, the U-Net and the VAE; the
/// scheduler is rebuilt from its configuration for every generation because
/// multistep solvers carry per-run state.
#[derive(Debug)]
pub struct StableDiffusion {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    text_encoder: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    scheduler: SchedulerKind,
    width: usize,
    height: usize,
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Pipeline = StableDiffusion;

    async fn load(source: &str, api: Api, settings: &PipelineSettings) -> Result<StableDiffusion> {
        let device = select_device(settings.device_map).context("failed to set up device")?;
        // CPU-first target, full 32-bit precision.
        let dtype = DType::F32;

        let repo = api.repo(hf_hub::Repo::model(source.to_string()));

        let tokenizer_file = api
            .model(CLIP_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        let clip_file = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get text encoder weights")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_file], dtype, &device)
                .context("failed to build text encoder var builder")?
        };
        let text_encoder = ClipTextTransformer::new(clip_vb, &clip::Config::v1_5())
            .context("failed to load text encoder")?;

        let unet_file = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get unet weights")?;
        let unet_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[unet_file], dtype, &device)
                .context("failed to build unet var builder")?
        };
        let unet = UNet2DConditionModel::new(unet_vb, 4, 4, false, unet_config())
            .context("failed to load unet")?;

        let vae_file = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get vae weights")?;
        let vae_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[vae_file], dtype, &device)
                .context("failed to build vae var builder")?
        };
        let vae = AutoEncoderKL::new(vae_vb, 3, 3, vae_config()).context("failed to load vae")?;

        Ok(StableDiffusion {
            device,
            dtype,
            tokenizer,
            text_encoder,
            unet,
            vae,
            scheduler: settings.scheduler,
            width: settings.width,
            height: settings.height,
        })
    }
}

impl TextToImage for StableDiffusion {
    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        let guidance = request.guidance.unwrap_or(DEFAULT_GUIDANCE_SCALE);
        anyhow::ensure!(steps > 0, "steps must be positive");
        anyhow::ensure!(guidance >= 0.0, "guidance scale must be non-negative");

        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let mut scheduler = self.scheduler.build(steps)?;

        // Classifier-free guidance doubles the batch: one unconditional pass,
        // one conditioned on the prompt.
        let use_guidance = guidance > 1.0;
        let text_embeddings = self.encode_prompt(&request.prompt)?;
        let text_embeddings = if use_guidance {
            let uncond_embeddings = self.encode_prompt("")?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        };

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, self.height / 8, self.width / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        for t in timesteps {
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, t)?;

            let noise_pred = self.unet.forward(&latent_input, t as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let noise_uncond = &chunks[0];
                let noise_cond = &chunks[1];
                let scaled = ((noise_cond - noise_uncond)? * guidance)?;
                (noise_uncond + scaled)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, t, &latents)?;
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&image.i(0)?)
    }
}

impl StableDiffusion {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(CLIP_TOKEN_LIMIT, CLIP_PAD_TOKEN);
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.text_encoder.forward(&input_ids)?)
    }
}

fn unet_config() -> UNet2DConditionModelConfig {
    UNet2DConditionModelConfig {
        blocks: vec![
            BlockConfig {
                out_channels: 320,
                use_cross_attn: Some(1),
                attention_head_dim: 8,
            },
            BlockConfig {
                out_channels: 640,
                use_cross_attn: Some(1),
                attention_head_dim: 8,
            },
            BlockConfig {
                out_channels: 1280,
                use_cross_attn: Some(1),
                attention_head_dim: 8,
            },
            BlockConfig {
                out_channels: 1280,
                use_cross_attn: None,
                attention_head_dim: 8,
            },
        ],
        center_input_sample: false,
        cross_attention_dim: 768,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection: false,
    }
}

fn vae_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 4,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}
