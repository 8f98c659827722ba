use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{PipelineSettings, TextToImage};

/// Builds one pipeline architecture from hub weights.
pub trait Loader {
    type Pipeline: TextToImage;

    fn load(
        source: &str,
        api: Api,
        settings: &PipelineSettings,
    ) -> impl Future<Output = Result<Self::Pipeline>> + Send
    where
        Self: Sized;
}
