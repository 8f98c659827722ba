use thiserror::Error;

/// Failures surfaced by the dispatcher.
///
/// The variants separate configuration mistakes (fix the key, don't retry)
/// from load and inference failures, which are propagated unchanged with
/// their original cause attached.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested model key is not present in the registry.
    #[error("unknown model key: {0}")]
    UnknownModel(String),
    /// Weight retrieval or pipeline construction failed.
    #[error("failed to load pipeline for {model}: {source}")]
    Load {
        model: String,
        #[source]
        source: anyhow::Error,
    },
    /// The sampling pass itself failed.
    #[error("generation failed: {source}")]
    Inference {
        #[source]
        source: anyhow::Error,
    },
}
