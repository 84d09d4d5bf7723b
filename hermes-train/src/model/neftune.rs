//! NEFTune: uniform noise on input embeddings while training.
//!
//! ```text
//! noisy = embeds + U(-m, m),  m = alpha / sqrt(embedding_dim)
//! ```

use std::sync::Arc;

use candle_core::Tensor;

use super::EmbeddingLookup;

pub struct NeftuneEmbedding {
    inner: Arc<dyn EmbeddingLookup>,
    alpha: f64,
}

impl NeftuneEmbedding {
    pub fn new(inner: Arc<dyn EmbeddingLookup>, alpha: f64) -> Self {
        Self { inner, alpha }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn magnitude(&self) -> f64 {
        self.alpha / (self.inner.embedding_dim().max(1) as f64).sqrt()
    }
}

impl EmbeddingLookup for NeftuneEmbedding {
    fn lookup(&self, input_ids: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let embeds = self.inner.lookup(input_ids, train)?;
        if !train {
            return Ok(embeds);
        }
        let m = self.magnitude() as f32;
        let noise = Tensor::rand(-m, m, embeds.shape(), embeds.device())?.to_dtype(embeds.dtype())?;
        embeds + noise
    }

    fn embedding_dim(&self) -> usize {
        self.inner.embedding_dim()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::Embedding;

    use super::*;

    fn embedding() -> Arc<dyn EmbeddingLookup> {
        let weights = Tensor::zeros((10, 16), DType::F32, &Device::Cpu).unwrap();
        Arc::new(Embedding::new(weights, 16))
    }

    #[test]
    fn test_noise_only_while_training() {
        let neft = NeftuneEmbedding::new(embedding(), 8.0);
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();

        let clean = neft.lookup(&ids, false).unwrap();
        assert_eq!(clean.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

        let noisy = neft.lookup(&ids, true).unwrap();
        let max = noisy.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max > 0.0);
        assert!(max <= 2.0 + 1e-6);
    }

    #[test]
    fn test_magnitude_scales_with_embedding_dim() {
        let neft = NeftuneEmbedding::new(embedding(), 8.0);
        assert!((neft.magnitude() - 2.0).abs() < 1e-12);
        assert_eq!(neft.embedding_dim(), 16);
    }
}
