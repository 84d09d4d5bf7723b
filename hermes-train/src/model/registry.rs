use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarMap;

use super::{GPT, PretrainedModel};
use crate::config::Config;
use crate::error::{Error, Result};

/// Where and how parameters are created when a model is built.
#[derive(Debug, Clone)]
pub struct ModelBuildOptions {
    pub dtype: DType,
    pub device: Device,
    pub use_flash_attn: bool,
}

impl ModelBuildOptions {
    pub fn cpu() -> Self {
        Self {
            dtype: DType::F32,
            device: Device::Cpu,
            use_flash_attn: false,
        }
    }
}

/// Builds a model on top of a (possibly pre-filled) var map.
pub type ModelConstructor =
    Arc<dyn Fn(&Config, VarMap, &ModelBuildOptions) -> Result<Box<dyn PretrainedModel>> + Send + Sync>;

/// What an architecture can do, declared when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelCapabilities {
    pub supports_padding_free: bool,
    /// Takes decoder targets in its forward pass and predicts them unshifted
    pub is_encoder_decoder: bool,
}

impl ModelCapabilities {
    pub fn decoder_only(supports_padding_free: bool) -> Self {
        Self {
            supports_padding_free,
            is_encoder_decoder: false,
        }
    }
}

struct Entry {
    constructor: ModelConstructor,
    capabilities: ModelCapabilities,
}

/// Maps `model_type` identifiers to constructors.
pub struct ModelRegistry {
    entries: HashMap<String, Entry>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        model_type: impl Into<String>,
        capabilities: ModelCapabilities,
        constructor: ModelConstructor,
    ) {
        self.entries.insert(
            model_type.into(),
            Entry {
                constructor,
                capabilities,
            },
        );
    }

    pub fn resolve(&self, model_type: &str) -> Result<ModelConstructor> {
        self.entry(model_type).map(|entry| entry.constructor.clone())
    }

    pub fn capabilities(&self, model_type: &str) -> Result<ModelCapabilities> {
        self.entry(model_type).map(|entry| entry.capabilities)
    }

    fn entry(&self, model_type: &str) -> Result<&Entry> {
        self.entries.get(model_type).ok_or_else(|| {
            Error::Configuration(format!(
                "unknown model_type ({model_type}), registered: {}",
                self.model_types().join(", ")
            ))
        })
    }

    pub fn model_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let gpt: ModelConstructor = Arc::new(
            |config: &Config, var_map: VarMap, options: &ModelBuildOptions| {
                Ok(Box::new(GPT::new(config, var_map, options)?) as Box<dyn PretrainedModel>)
            },
        );
        registry.register("gpt", ModelCapabilities::decoder_only(true), gpt.clone());
        registry.register("llama", ModelCapabilities::decoder_only(true), gpt);
        registry
    }
}
