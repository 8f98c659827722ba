use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Registry key of the built-in model.
pub const DEFAULT_MODEL_KEY: &str = "StableDiffusion";

const DEFAULT_MODEL_SOURCE: &str = "runwayml/stable-diffusion-v1-5";

/// Maps short human-readable model keys to Hugging Face repo ids.
///
/// The registry is fixed for the lifetime of the dispatcher that owns it.
/// One key is designated the default and is used by requests that don't name
/// a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistry {
    default: String,
    models: BTreeMap<String, String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self {
            default: DEFAULT_MODEL_KEY.to_string(),
            models: BTreeMap::from([(
                DEFAULT_MODEL_KEY.to_string(),
                DEFAULT_MODEL_SOURCE.to_string(),
            )]),
        }
    }
}

impl ModelRegistry {
    /// Build a registry from explicit entries.
    pub fn new(
        default_key: impl Into<String>,
        models: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let registry = Self {
            default: default_key.into(),
            models: models.into_iter().collect(),
        };
        registry.validate()?;
        Ok(registry)
    }

    /// Load a registry from a JSON file of the shape
    /// `{"default": "...", "models": {"key": "repo/id"}}`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read registry file {}", path.display()))?;
        let registry: Self = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse registry file {}", path.display()))?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.models.is_empty(), "registry has no models");
        ensure!(
            self.models.contains_key(&self.default),
            "default model key {:?} is not registered",
            self.default
        );
        Ok(())
    }

    /// The source repo id registered under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.models.get(key).map(String::as_str)
    }

    /// The key used when a request doesn't name a model.
    pub fn default_key(&self) -> &str {
        &self.default
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_one_stable_diffusion_entry() {
        let registry = ModelRegistry::default();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.default_key(), "StableDiffusion");
        assert_eq!(
            registry.get("StableDiffusion"),
            Some("runwayml/stable-diffusion-v1-5")
        );
    }

    #[test]
    fn unregistered_keys_resolve_to_none() {
        let registry = ModelRegistry::default();
        assert_eq!(registry.get("Unknown"), None);
        assert_eq!(registry.get("stablediffusion"), None);
    }

    #[test]
    fn registry_parses_from_json() {
        let registry: ModelRegistry = serde_json::from_str(
            r#"{
                "default": "sd",
                "models": {
                    "sd": "runwayml/stable-diffusion-v1-5",
                    "sd-pruned": "stable-diffusion-v1-5/stable-diffusion-v1-5"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(registry.default_key(), "sd");
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.keys().collect::<Vec<_>>(),
            vec!["sd", "sd-pruned"]
        );
    }

    #[test]
    fn new_rejects_a_default_key_that_is_not_registered() {
        let result = ModelRegistry::new(
            "missing",
            [("sd".to_string(), "runwayml/stable-diffusion-v1-5".to_string())],
        );
        assert!(result.is_err());
    }

    #[test]
    fn new_rejects_an_empty_registry() {
        assert!(ModelRegistry::new("sd", []).is_err());
    }
}
