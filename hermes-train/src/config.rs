use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Feed-forward activation. The `*glu` variants gate the up projection with a second one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFunction {
    Gelu,
    GeluTanh,
    Relu,
    Silu,
    Swiglu,
    Geglu,
    Reglu,
}

impl ActivationFunction {
    pub fn is_glu(self) -> bool {
        matches!(
            self,
            ActivationFunction::Swiglu | ActivationFunction::Geglu | ActivationFunction::Reglu
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Architecture identifier, resolved through the model registry
    pub model_type: String,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length (context window)
    pub max_seq_len: usize,
    /// Embedding dimension
    pub hidden_size: usize,
    /// Number of transformer layers
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Number of key/value heads (grouped-query attention when < num_heads)
    pub num_kv_heads: usize,
    /// Intermediate size in FFN
    pub intermediate_size: usize,
    pub activation_function: ActivationFunction,
    /// Dropout probability
    pub dropout: f64,
    /// Norm epsilon
    pub layer_norm_eps: f64,
    /// Whether to use bias in linear layers
    pub use_bias: bool,
    /// RoPE base frequency
    pub rope_theta: f64,
    #[serde(default)]
    pub is_encoder_decoder: bool,
}

impl Config {
    /// GPT-2 Small configuration (124M parameters)
    pub fn gpt2_small() -> Self {
        Self {
            model_type: "gpt".to_string(),
            vocab_size: 50257,
            max_seq_len: 1024,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            num_kv_heads: 12,
            intermediate_size: 3072,
            activation_function: ActivationFunction::Gelu,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
            use_bias: true,
            rope_theta: 10000.0,
            is_encoder_decoder: false,
        }
    }

    /// GPT-2 Medium configuration (355M parameters)
    pub fn gpt2_medium() -> Self {
        Self {
            hidden_size: 1024,
            num_layers: 24,
            num_heads: 16,
            num_kv_heads: 16,
            intermediate_size: 4096,
            ..Self::gpt2_small()
        }
    }

    /// Nano configuration - fastest for testing
    pub fn nano() -> Self {
        Self {
            model_type: "gpt".to_string(),
            vocab_size: 1000,
            max_seq_len: 128,
            hidden_size: 64,
            num_layers: 2,
            num_heads: 2,
            num_kv_heads: 2,
            intermediate_size: 256,
            activation_function: ActivationFunction::Gelu,
            dropout: 0.0,
            layer_norm_eps: 1e-5,
            use_bias: true,
            rope_theta: 10000.0,
            is_encoder_decoder: false,
        }
    }

    /// Tiny configuration for testing/debugging
    pub fn tiny() -> Self {
        Self {
            max_seq_len: 256,
            hidden_size: 128,
            num_layers: 4,
            num_heads: 4,
            num_kv_heads: 4,
            intermediate_size: 512,
            dropout: 0.1,
            ..Self::nano()
        }
    }

    /// LLaMA-style configuration (no bias, SwiGLU, grouped-query attention)
    pub fn llama_small() -> Self {
        Self {
            model_type: "llama".to_string(),
            vocab_size: 32000,
            max_seq_len: 2048,
            hidden_size: 1024,
            num_layers: 16,
            num_heads: 16,
            num_kv_heads: 4,
            intermediate_size: 2752, // 8/3 * hidden_size for SwiGLU
            activation_function: ActivationFunction::Swiglu,
            dropout: 0.0,
            layer_norm_eps: 1e-6,
            use_bias: false,
            rope_theta: 10000.0,
            is_encoder_decoder: false,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "nano" => Some(Self::nano()),
            "tiny" => Some(Self::tiny()),
            "gpt2-small" => Some(Self::gpt2_small()),
            "gpt2-medium" => Some(Self::gpt2_medium()),
            "llama-small" => Some(Self::llama_small()),
            _ => None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_size % self.num_heads != 0 {
            return Err(Error::Configuration(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if self.num_kv_heads == 0 || self.num_heads % self.num_kv_heads != 0 {
            return Err(Error::Configuration(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        Ok(())
    }

    pub fn num_parameters(&self) -> usize {
        let kv_dim = self.num_kv_heads * self.head_dim();
        let mlp_in = if self.activation_function.is_glu() {
            2 * self.intermediate_size
        } else {
            self.intermediate_size
        };
        let embed_params = self.vocab_size * self.hidden_size;
        let attn_params = 2 * self.hidden_size * self.hidden_size + 2 * self.hidden_size * kv_dim;
        let ff_params = self.hidden_size * mlp_in + self.intermediate_size * self.hidden_size;
        let layer_params = attn_params + ff_params + 2 * self.hidden_size;
        let head_params = self.hidden_size * self.vocab_size;
        embed_params + self.num_layers * layer_params + self.hidden_size + head_params
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
