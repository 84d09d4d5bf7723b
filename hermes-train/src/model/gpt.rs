use std::sync::Arc;

use candle_core::{D, DType, Device, Module, Tensor, Var};
use candle_nn::{Dropout, Linear, VarBuilder, VarMap, embedding, linear_b, linear_no_bias};

use super::{
    EmbeddingLookup, GenerationConfig, ModelBuildOptions, ModelInput, PretrainedModel,
    init_parameter,
};
use crate::config::{ActivationFunction, Config};
use crate::error::{Error, Result};
use crate::generate;

const INITIALIZER_RANGE: f64 = 0.02;
const EMBEDDING_WEIGHT: &str = "embedding.weight";
const LM_HEAD_WEIGHT: &str = "lm_head.weight";

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> candle_core::Result<Tensor> {
    let shape = on_false.shape();
    let mask = mask.broadcast_as(shape.dims())?;
    let on_true = Tensor::new(on_true, on_false.device())?
        .to_dtype(on_false.dtype())?
        .broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

fn repeat_kv(x: Tensor, n_rep: usize) -> candle_core::Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv_heads, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .broadcast_as((b, n_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((b, n_kv_heads * n_rep, seq_len, head_dim))
}

#[derive(Debug, Clone)]
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }
}

impl Module for RMSNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x = x.to_dtype(dtype)?;
        x.broadcast_mul(&self.weight)
    }
}

pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.unsqueeze(1)?;
        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotates `q` and `k` (`[batch, heads, seq, head_dim]`) by per-token positions (`[batch, seq]`).
    pub fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        position_ids: &Tensor,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let (b, seq_len) = position_ids.dims2()?;
        let half = self.cos.dim(1)?;
        let flat = position_ids.flatten_all()?;
        let cos = self.cos.index_select(&flat, 0)?.reshape((b, 1, seq_len, half))?;
        let sin = self.sin.index_select(&flat, 0)?.reshape((b, 1, seq_len, half))?;
        let cos = Tensor::cat(&[&cos, &cos], 3)?.to_dtype(q.dtype())?;
        let sin = Tensor::cat(&[&sin, &sin], 3)?.to_dtype(q.dtype())?;

        Ok((rotate(q, &cos, &sin)?, rotate(k, &cos, &sin)?))
    }
}

fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> candle_core::Result<Tensor> {
    let d = x.dim(3)?;
    let x1 = x.narrow(3, 0, d / 2)?;
    let x2 = x.narrow(3, d / 2, d / 2)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], 3)?;
    x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?
}

/// Sequence boundaries of a packed batch, for the varlen flash kernel.
struct Varlen {
    #[cfg_attr(not(feature = "flash-attn"), allow(dead_code))]
    cu_seqlens: Tensor,
    #[cfg_attr(not(feature = "flash-attn"), allow(dead_code))]
    max_seqlen: usize,
}

pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    dropout: Dropout,
    use_flash_attn: bool,
}

impl Attention {
    pub fn new(config: &Config, use_flash_attn: bool, vb: VarBuilder) -> candle_core::Result<Self> {
        let head_dim = config.head_dim();
        let q_dim = config.num_heads * head_dim;
        let kv_dim = config.num_kv_heads * head_dim;
        Ok(Self {
            q_proj: linear_b(config.hidden_size, q_dim, config.use_bias, vb.pp("q_proj"))?,
            k_proj: linear_b(config.hidden_size, kv_dim, config.use_bias, vb.pp("k_proj"))?,
            v_proj: linear_b(config.hidden_size, kv_dim, config.use_bias, vb.pp("v_proj"))?,
            o_proj: linear_b(q_dim, config.hidden_size, config.use_bias, vb.pp("o_proj"))?,
            num_heads: config.num_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim,
            dropout: Dropout::new(config.dropout as f32),
            use_flash_attn,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        varlen: Option<&Varlen>,
        rope: &RotaryEmbedding,
        position_ids: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rope.apply(&q, &k, position_ids)?;

        let attn_output = match mask {
            None if self.use_flash_attn => self.flash_attention(&q, &k, &v, varlen)?,
            _ => self.eager_attention(&q, &k, v, mask, train)?,
        };

        self.o_proj.forward(&attn_output)
    }

    fn eager_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let (batch_size, _, seq_len, _) = q.dims4()?;
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k.clone(), n_rep)?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let attn_weights = q.matmul(&k_t)?.affine(1.0 / scale, 0.0)?;

        let attn_weights = match mask {
            Some(m) => masked_fill(&attn_weights, m, f32::NEG_INFINITY)?,
            None => attn_weights,
        };

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))
    }

    #[cfg(feature = "flash-attn")]
    fn flash_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        varlen: Option<&Varlen>,
    ) -> candle_core::Result<Tensor> {
        // flash kernels take (batch, seq, heads, head_dim)
        let (batch_size, _, seq_len, _) = q.dims4()?;
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;
        let softmax_scale = 1.0 / (self.head_dim as f32).sqrt();
        let attn = match varlen {
            Some(varlen) => candle_flash_attn::flash_attn_varlen(
                &q.squeeze(0)?,
                &k.squeeze(0)?,
                &v.squeeze(0)?,
                &varlen.cu_seqlens,
                &varlen.cu_seqlens,
                varlen.max_seqlen,
                varlen.max_seqlen,
                softmax_scale,
                true,
            )?,
            None => candle_flash_attn::flash_attn(&q, &k, &v, softmax_scale, true)?,
        };
        attn.reshape((batch_size, seq_len, self.num_heads * self.head_dim))
    }

    #[cfg(not(feature = "flash-attn"))]
    fn flash_attention(
        &self,
        _q: &Tensor,
        _k: &Tensor,
        _v: &Tensor,
        _varlen: Option<&Varlen>,
    ) -> candle_core::Result<Tensor> {
        candle_core::bail!("flash attention requires building with --features flash-attn")
    }
}

pub struct Mlp {
    gate_proj: Option<Linear>,
    up_proj: Linear,
    down_proj: Linear,
    activation: ActivationFunction,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(config: &Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let (h, f, bias) = (config.hidden_size, config.intermediate_size, config.use_bias);
        let gate_proj = if config.activation_function.is_glu() {
            Some(linear_b(h, f, bias, vb.pp("gate_proj"))?)
        } else {
            None
        };
        Ok(Self {
            gate_proj,
            up_proj: linear_b(h, f, bias, vb.pp("up_proj"))?,
            down_proj: linear_b(f, h, bias, vb.pp("down_proj"))?,
            activation: config.activation_function,
            dropout: Dropout::new(config.dropout as f32),
        })
    }

    fn activate(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self.activation {
            ActivationFunction::Gelu | ActivationFunction::Geglu => x.gelu_erf(),
            ActivationFunction::GeluTanh => x.gelu(),
            ActivationFunction::Relu | ActivationFunction::Reglu => x.relu(),
            ActivationFunction::Silu | ActivationFunction::Swiglu => x.silu(),
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let up = self.up_proj.forward(x)?;
        let hidden = match &self.gate_proj {
            Some(gate_proj) => (self.activate(&gate_proj.forward(x)?)? * up)?,
            None => self.activate(&up)?,
        };
        let hidden = self.dropout.forward(&hidden, train)?;
        self.down_proj.forward(&hidden)
    }
}

pub struct TransformerBlock {
    attention: Attention,
    feed_forward: Mlp,
    input_layernorm: RMSNorm,
    post_attention_layernorm: RMSNorm,
}

impl TransformerBlock {
    pub fn new(config: &Config, use_flash_attn: bool, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            attention: Attention::new(config, use_flash_attn, vb.pp("attention"))?,
            feed_forward: Mlp::new(config, vb.pp("feed_forward"))?,
            input_layernorm: RMSNorm::new(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: RMSNorm::new(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        varlen: Option<&Varlen>,
        rope: &RotaryEmbedding,
        position_ids: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self
            .attention
            .forward(&x, mask, varlen, rope, position_ids, train)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.feed_forward.forward(&x, train)?;
        residual + x
    }
}

/// Decoder-only transformer: RMSNorm, RoPE, grouped-query attention, plain or gated MLP.
pub struct GPT {
    embedding: Arc<dyn EmbeddingLookup>,
    layers: Vec<TransformerBlock>,
    norm: RMSNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    config: Config,
    var_map: VarMap,
    options: ModelBuildOptions,
}

impl GPT {
    /// Builds the model on top of `var_map`, creating any parameter it does not hold yet.
    pub fn new(config: &Config, var_map: VarMap, options: &ModelBuildOptions) -> Result<Self> {
        config.validate()?;
        let vb = VarBuilder::from_varmap(&var_map, options.dtype, &options.device);
        let embedding: Arc<dyn EmbeddingLookup> = Arc::new(embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("embedding"),
        )?);
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(TransformerBlock::new(
                config,
                options.use_flash_attn,
                vb.pp(format!("layers.{}", i)),
            )?);
        }
        let norm = RMSNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("norm"))?;
        let lm_head = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?;
        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_seq_len,
            config.rope_theta,
            &options.device,
        )?;
        Ok(Self {
            embedding,
            layers,
            norm,
            lm_head,
            rope,
            config: config.clone(),
            var_map,
            options: options.clone(),
        })
    }

    pub fn num_parameters(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    fn run(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        mask: Option<&Tensor>,
        varlen: Option<&Varlen>,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let mut x = self.embedding.lookup(input_ids, train)?;
        for layer in &self.layers {
            x = layer.forward(&x, mask, varlen, &self.rope, position_ids, train)?;
        }
        let x = self.norm.forward(&x)?;
        self.lm_head.forward(&x)
    }

    fn check_length(&self, seq_len: usize) -> candle_core::Result<()> {
        if seq_len > self.config.max_seq_len {
            candle_core::bail!(
                "sequence of length {seq_len} exceeds max_seq_len ({})",
                self.config.max_seq_len
            );
        }
        Ok(())
    }
}

/// Positions that skip padding: `cumsum(mask) - 1`, clamped at zero.
fn position_ids(
    attention_mask: Option<&[Vec<u8>]>,
    batch_size: usize,
    seq_len: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut positions = Vec::with_capacity(batch_size * seq_len);
    match attention_mask {
        Some(rows) => {
            for row in rows {
                let mut seen = 0u32;
                for &m in row {
                    seen += m as u32;
                    positions.push(seen.saturating_sub(1));
                }
            }
        }
        None => {
            for _ in 0..batch_size {
                positions.extend(0..seq_len as u32);
            }
        }
    }
    Tensor::from_vec(positions, (batch_size, seq_len), device)
}

/// `[batch, 1, seq, seq]` mask, 1 where attention is blocked.
///
/// Padding queries keep their own key so no row is fully masked.
fn causal_padding_mask(
    attention_mask: Option<&[Vec<u8>]>,
    batch_size: usize,
    seq_len: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut data = vec![0u8; batch_size * seq_len * seq_len];
    for b in 0..batch_size {
        let row = attention_mask.map(|rows| rows[b].as_slice());
        for i in 0..seq_len {
            for j in 0..seq_len {
                let is_pad = row.is_some_and(|r| r[j] == 0);
                if j > i || (is_pad && j != i) {
                    data[(b * seq_len + i) * seq_len + j] = 1;
                }
            }
        }
    }
    Tensor::from_vec(data, (batch_size, 1, seq_len, seq_len), device)
}

/// Block-diagonal causal mask over a packed batch.
fn packed_mask(cu_seqlens: &[u32], device: &Device) -> candle_core::Result<Tensor> {
    let total = cu_seqlens.last().copied().unwrap_or(0) as usize;
    let mut segment = vec![0usize; total];
    for (s, bounds) in cu_seqlens.windows(2).enumerate() {
        for slot in &mut segment[bounds[0] as usize..bounds[1] as usize] {
            *slot = s;
        }
    }
    let mut data = vec![0u8; total * total];
    for i in 0..total {
        for j in 0..total {
            if j > i || segment[i] != segment[j] {
                data[i * total + j] = 1;
            }
        }
    }
    Tensor::from_vec(data, (1, 1, total, total), device)
}

fn packed_position_ids(cu_seqlens: &[u32], device: &Device) -> candle_core::Result<Tensor> {
    let positions: Vec<u32> = cu_seqlens
        .windows(2)
        .flat_map(|bounds| 0..bounds[1] - bounds[0])
        .collect();
    let total = positions.len();
    Tensor::from_vec(positions, (1, total), device)
}

impl PretrainedModel for GPT {
    fn config(&self) -> &Config {
        &self.config
    }

    fn forward(&self, input: &ModelInput<'_>, train: bool) -> candle_core::Result<Tensor> {
        match input {
            ModelInput::Dense {
                input_ids,
                attention_mask,
                ..
            } => {
                let (batch_size, seq_len) = input_ids.dims2()?;
                self.check_length(seq_len)?;
                let device = input_ids.device();
                let mask_rows = attention_mask.map(|m| m.to_vec2::<u8>()).transpose()?;
                let position_ids =
                    position_ids(mask_rows.as_deref(), batch_size, seq_len, device)?;
                let mask = if self.options.use_flash_attn && mask_rows.is_none() {
                    None
                } else {
                    Some(causal_padding_mask(
                        mask_rows.as_deref(),
                        batch_size,
                        seq_len,
                        device,
                    )?)
                };
                self.run(input_ids, &position_ids, mask.as_ref(), None, train)
            }
            ModelInput::Packed {
                input_ids,
                cu_seqlens,
                max_seqlen,
            } => {
                self.check_length(*max_seqlen)?;
                let device = input_ids.device();
                let position_ids = packed_position_ids(cu_seqlens, device)?;
                if self.options.use_flash_attn {
                    let varlen = Varlen {
                        cu_seqlens: Tensor::new(*cu_seqlens, device)?,
                        max_seqlen: *max_seqlen,
                    };
                    self.run(input_ids, &position_ids, None, Some(&varlen), train)
                } else {
                    let mask = packed_mask(cu_seqlens, device)?;
                    self.run(input_ids, &position_ids, Some(&mask), None, train)
                }
            }
        }
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn input_embeddings(&self) -> Option<Arc<dyn EmbeddingLookup>> {
        Some(self.embedding.clone())
    }

    fn set_input_embeddings(&mut self, embeddings: Arc<dyn EmbeddingLookup>) -> Result<()> {
        self.embedding = embeddings;
        Ok(())
    }

    fn resize_token_embeddings(&mut self, vocab_size: usize) -> Result<()> {
        let old_vocab_size = self.config.vocab_size;
        if vocab_size == old_vocab_size {
            return Ok(());
        }
        {
            let mut data = self
                .var_map
                .data()
                .lock()
                .map_err(|_| Error::Internal("var map lock poisoned".to_string()))?;
            for name in [EMBEDDING_WEIGHT, LM_HEAD_WEIGHT] {
                let weight = data
                    .get(name)
                    .ok_or_else(|| Error::Internal(format!("missing parameter {name}")))?
                    .as_tensor()
                    .clone();
                let resized = if vocab_size > old_vocab_size {
                    let extra = init_parameter(
                        name,
                        &[vocab_size - old_vocab_size, self.config.hidden_size],
                        INITIALIZER_RANGE,
                        weight.dtype(),
                        weight.device(),
                    )?;
                    Tensor::cat(&[&weight, &extra], 0)?
                } else {
                    weight.narrow(0, 0, vocab_size)?
                };
                data.insert(name.to_string(), Var::from_tensor(&resized)?);
            }
        }
        let config = Config {
            vocab_size,
            ..self.config.clone()
        };
        *self = Self::new(&config, self.var_map.clone(), &self.options)?;
        Ok(())
    }

    fn reset_parameters(&mut self) -> Result<()> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::Internal("var map lock poisoned".to_string()))?;
        for (name, var) in data.iter() {
            let value = init_parameter(
                name,
                var.dims(),
                INITIALIZER_RANGE,
                var.dtype(),
                var.device(),
            )?;
            var.set(&value)?;
        }
        Ok(())
    }

    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        generation_config: &GenerationConfig,
        eos_token_id: u32,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Tensor> {
        generate::generate(
            self,
            input_ids,
            attention_mask,
            generation_config,
            eos_token_id,
            rng,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivationFunction;

    fn tiny_config() -> Config {
        Config {
            vocab_size: 32,
            max_seq_len: 16,
            hidden_size: 16,
            num_layers: 2,
            num_heads: 4,
            num_kv_heads: 2,
            intermediate_size: 32,
            activation_function: ActivationFunction::Swiglu,
            dropout: 0.0,
            ..Config::nano()
        }
    }

    fn build(config: &Config) -> GPT {
        GPT::new(config, VarMap::new(), &ModelBuildOptions::cpu()).unwrap()
    }

    fn dense_logits(model: &GPT, ids: &[u32], mask: Option<&[u8]>) -> Tensor {
        let input_ids = Tensor::new(ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        let mask = mask.map(|m| Tensor::new(m, &Device::Cpu).unwrap().unsqueeze(0).unwrap());
        model
            .forward(
                &ModelInput::Dense {
                    input_ids: &input_ids,
                    attention_mask: mask.as_ref(),
                    labels: None,
                },
                false,
            )
            .unwrap()
            .squeeze(0)
            .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let model = build(&tiny_config());
        let logits = dense_logits(&model, &[1, 2, 3, 4], None);
        assert_eq!(logits.dims(), &[4, 32]);
    }

    #[test]
    fn test_left_padding_matches_unpadded() {
        let model = build(&tiny_config());
        let unpadded = dense_logits(&model, &[5, 6, 7], None);
        let padded = dense_logits(&model, &[0, 0, 5, 6, 7], Some(&[0, 0, 1, 1, 1]));
        let real = padded.narrow(0, 2, 3).unwrap();
        assert!(max_abs_diff(&unpadded, &real) < 1e-4);
    }

    #[test]
    fn test_packed_matches_separate_sequences() {
        let model = build(&tiny_config());
        let first = dense_logits(&model, &[3, 4, 5], None);
        let second = dense_logits(&model, &[9, 8], None);

        let input_ids = Tensor::new(&[[3u32, 4, 5, 9, 8]], &Device::Cpu).unwrap();
        let packed = model
            .forward(
                &ModelInput::Packed {
                    input_ids: &input_ids,
                    cu_seqlens: &[0, 3, 5],
                    max_seqlen: 3,
                },
                false,
            )
            .unwrap()
            .squeeze(0)
            .unwrap();

        assert!(max_abs_diff(&first, &packed.narrow(0, 0, 3).unwrap()) < 1e-4);
        assert!(max_abs_diff(&second, &packed.narrow(0, 3, 2).unwrap()) < 1e-4);
    }

    #[test]
    fn test_resize_token_embeddings_keeps_rows() {
        let mut model = build(&tiny_config());
        let before = model
            .var_map()
            .data()
            .lock()
            .unwrap()
            .get(EMBEDDING_WEIGHT)
            .unwrap()
            .as_tensor()
            .clone();
        model.resize_token_embeddings(40).unwrap();
        assert_eq!(model.config().vocab_size, 40);

        let data = model.var_map().data().lock().unwrap();
        let after = data.get(EMBEDDING_WEIGHT).unwrap().as_tensor().clone();
        assert_eq!(after.dims(), &[40, 16]);
        assert_eq!(data.get(LM_HEAD_WEIGHT).unwrap().dims(), &[40, 16]);
        assert_eq!(max_abs_diff(&before, &after.narrow(0, 0, 32).unwrap()), 0.0);
        drop(data);

        let logits = dense_logits(&model, &[39, 1], None);
        assert_eq!(logits.dims(), &[2, 40]);
    }

    #[test]
    fn test_reset_parameters_initializes_norms_to_one() {
        let mut model = build(&tiny_config());
        model.reset_parameters().unwrap();
        let data = model.var_map().data().lock().unwrap();
        let norm = data.get("norm.weight").unwrap().as_tensor().clone();
        assert_eq!(norm.to_vec1::<f32>().unwrap(), vec![1.0; 16]);
    }

    #[test]
    fn test_too_long_sequence_rejected() {
        let model = build(&tiny_config());
        let ids: Vec<u32> = (0..17).collect();
        let input_ids = Tensor::new(ids.as_slice(), &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let result = model.forward(
            &ModelInput::Dense {
                input_ids: &input_ids,
                attention_mask: None,
                labels: None,
            },
            false,
        );
        assert!(result.is_err());
    }
}
