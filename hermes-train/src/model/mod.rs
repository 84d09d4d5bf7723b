//! Model abstraction used by [`crate::model_wrapper::ModelWrapper`].
//!
//! Architectures implement [`PretrainedModel`] and are looked up by
//! `model_type` through the [`ModelRegistry`]. Parameters always live in a
//! [`VarMap`], so placement strategies only differ in how that map is filled
//! before the model is built on top of it.

mod gpt;
mod neftune;
mod registry;

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Module, VarMap};

use crate::config::Config;
use crate::error::Result;

pub use gpt::GPT;
pub use neftune::NeftuneEmbedding;
pub use registry::{ModelBuildOptions, ModelCapabilities, ModelConstructor, ModelRegistry};

/// Token embedding lookup, the seam NEFTune decorates.
pub trait EmbeddingLookup: Send + Sync {
    fn lookup(&self, input_ids: &Tensor, train: bool) -> candle_core::Result<Tensor>;

    fn embedding_dim(&self) -> usize;
}

impl EmbeddingLookup for Embedding {
    fn lookup(&self, input_ids: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        self.forward(input_ids)
    }

    fn embedding_dim(&self) -> usize {
        self.embeddings().dims2().map_or(0, |(_, hidden)| hidden)
    }
}

/// One forward call worth of input.
pub enum ModelInput<'a> {
    /// `[batch, seq]` token ids with an optional `[batch, seq]` padding mask.
    Dense {
        input_ids: &'a Tensor,
        attention_mask: Option<&'a Tensor>,
        /// Decoder targets for encoder-decoder models
        labels: Option<&'a Tensor>,
    },
    /// Unpadded sequences concatenated into `[1, total]`, split by `cu_seqlens`.
    Packed {
        input_ids: &'a Tensor,
        cu_seqlens: &'a [u32],
        max_seqlen: usize,
    },
}

#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Greedy decoding when absent or zero
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
}

pub trait PretrainedModel {
    fn config(&self) -> &Config;

    /// Returns logits of shape `[batch, seq, vocab]`.
    fn forward(&self, input: &ModelInput<'_>, train: bool) -> candle_core::Result<Tensor>;

    /// Parameter storage backing the model.
    fn var_map(&self) -> &VarMap;

    fn input_embeddings(&self) -> Option<Arc<dyn EmbeddingLookup>> {
        None
    }

    fn set_input_embeddings(&mut self, _embeddings: Arc<dyn EmbeddingLookup>) -> Result<()> {
        Err(crate::error::Error::MissingCapability(
            "model does not expose its input embeddings".to_string(),
        ))
    }

    /// Grows (or shrinks) the token embedding and output projection to `vocab_size` rows.
    fn resize_token_embeddings(&mut self, vocab_size: usize) -> Result<()>;

    /// Re-draws every parameter from its initial distribution.
    fn reset_parameters(&mut self) -> Result<()>;

    /// Autoregressive decoding; decoder-only models return prompt + continuation.
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        generation_config: &GenerationConfig,
        eos_token_id: u32,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Tensor>;
}

/// Draws the initial value of a named parameter.
///
/// Norm weights start at one, biases at zero, everything else from `N(0, std)`.
pub(crate) fn init_parameter(
    name: &str,
    shape: &[usize],
    std: f64,
    dtype: DType,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let tensor = if name.ends_with("bias") {
        Tensor::zeros(shape, DType::F32, device)?
    } else if name.contains("norm") {
        Tensor::ones(shape, DType::F32, device)?
    } else {
        Tensor::randn(0f32, std as f32, shape, device)?
    };
    tensor.to_dtype(dtype)
}
