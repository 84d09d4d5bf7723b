//! Owns the tokenizer and the model for one process.
//!
//! The wrapper resolves the architecture config, picks where parameters are
//! materialized, pads batches for the configured regime and computes the
//! causal language-modelling loss.

use std::path::Path;
use std::sync::Arc;

use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::{debug, info, instrument, warn};

use crate::arguments::{DistributedArgs, ModelWrapperArgs};
use crate::config::Config;
use crate::ensure;
use crate::enums::{
    AttentionImplementation, DistributedBackend, GradientCheckpointingMethod, LossMask, Mode,
    PaddingSide, TuningMethod,
};
use crate::error::{Error, Result};
use crate::generate::count_generated_tokens;
use crate::metrics::MetricsTrackingDict;
use crate::model::{
    GenerationConfig, ModelBuildOptions, ModelInput, ModelRegistry, NeftuneEmbedding,
    PretrainedModel,
};
use crate::padding::{LABELS_MASK_VALUE, Labels, PaddedBatch, TokenIds, cumulative_seqlens, pad};
use crate::tokenizer::Tokenizer;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// How parameters reach the target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// One host copy, moved to the device once built (host-managed backend).
    SingleInstance,
    /// Built on the device, pretrained weights copied in afterwards.
    DirectToDevice,
    /// Fresh parameters drawn directly on the device; no pretrained weights.
    MetaMaterialize,
    /// Pretrained tensors loaded straight onto the device before the model is built.
    DeviceMap,
    /// Loaded in the configured reduced precision for inference or export.
    ReducedPrecision,
}

impl Placement {
    pub fn resolve(mode: Mode, distributed_args: &DistributedArgs, efficient_initialization: bool) -> Self {
        if mode != Mode::Training {
            return Placement::ReducedPrecision;
        }
        match distributed_args.distributed_backend {
            DistributedBackend::HostManaged => Placement::SingleInstance,
            DistributedBackend::Native if distributed_args.stage == 0 => Placement::DirectToDevice,
            DistributedBackend::Native if efficient_initialization => Placement::MetaMaterialize,
            DistributedBackend::Native => Placement::DeviceMap,
        }
    }
}

/// Loss of one forward pass plus the scalars reported for it.
pub struct ForwardOutput {
    pub loss: Tensor,
    pub metrics: MetricsTrackingDict,
}

pub struct ModelWrapper {
    mode: Mode,
    model: Box<dyn PretrainedModel>,
    tokenizer: Tokenizer,
    device: Device,
    padding_side: PaddingSide,
    loss_mask: Option<LossMask>,
    use_padding_free_transformer: bool,
    is_encoder_decoder: bool,
    distributed_backend: Option<DistributedBackend>,
    stage: Option<u8>,
    tuning_method: TuningMethod,
    gradient_checkpointing_method: Option<GradientCheckpointingMethod>,
    checkpoint_every: usize,
    training: bool,
}

impl ModelWrapper {
    pub fn new<A: ModelWrapperArgs>(args: &A, mode: Mode, local_rank: usize) -> Result<Self> {
        Self::with_registry(args, mode, local_rank, &ModelRegistry::default())
    }

    #[instrument(name = "initialize_model", skip_all, fields(mode = ?mode))]
    pub fn with_registry<A: ModelWrapperArgs>(
        args: &A,
        mode: Mode,
        local_rank: usize,
        registry: &ModelRegistry,
    ) -> Result<Self> {
        let model_args = args.model_args();
        let tokenizer_args = args.tokenizer_args();
        let device = resolve_device(mode, local_rank)?;

        let distributed_args = args.distributed_args().cloned().unwrap_or_default();
        let (distributed_backend, stage) = if mode == Mode::Training {
            (
                Some(distributed_args.distributed_backend),
                Some(distributed_args.stage),
            )
        } else {
            (None, None)
        };

        let config = match (&model_args.model_name, &model_args.pretrained_config) {
            (Some(name), _) => Config::from_json(Path::new(name).join(CONFIG_FILE))?,
            (None, Some(config)) => config.clone(),
            (None, None) => {
                return Err(Error::Configuration(
                    "either model_name or pretrained_config must be specified".to_string(),
                ));
            }
        };
        debug!(?config, "resolved model config");

        let capabilities = registry.capabilities(&config.model_type)?;
        if config.is_encoder_decoder != capabilities.is_encoder_decoder {
            let architecture = if capabilities.is_encoder_decoder {
                "encoder-decoder"
            } else {
                "decoder-only"
            };
            return Err(Error::Configuration(format!(
                "config sets is_encoder_decoder = {} but model_type ({}) is {architecture}",
                config.is_encoder_decoder, config.model_type
            )));
        }

        let use_padding_free_transformer = model_args.use_padding_free_transformer;
        let flash_requested =
            model_args.attention_implementation == Some(AttentionImplementation::FlashAttention2);
        if use_padding_free_transformer {
            ensure!(
                capabilities.supports_padding_free,
                "padding free transformer is not supported with the specified model ({})",
                config.model_type
            );
            ensure!(
                flash_requested,
                "padding free transformer only works with flash attention"
            );
        }
        let use_flash_attn = flash_requested && cfg!(feature = "flash-attn");
        if flash_requested && !use_flash_attn {
            warn!("flash attention kernels are not compiled in, using eager attention");
        }

        let tokenizer_name = tokenizer_args
            .tokenizer_name
            .as_ref()
            .or(model_args.model_name.as_ref())
            .ok_or_else(|| Error::Configuration("pass a tokenizer".to_string()))?;
        let mut tokenizer = Tokenizer::from_pretrained(tokenizer_name)?;
        let padding_side = tokenizer_args
            .padding_side
            .unwrap_or_else(|| tokenizer.padding_side());

        let placement = Placement::resolve(
            mode,
            &distributed_args,
            model_args.efficient_initialization,
        );
        let dtype = if mode == Mode::Training {
            args.training_dtype().dtype()
        } else {
            model_args.dtype.dtype()
        };
        let options = ModelBuildOptions {
            dtype,
            device: device.clone(),
            use_flash_attn,
        };
        let weights = model_args
            .model_name
            .as_ref()
            .map(|name| Path::new(name).join(WEIGHTS_FILE));
        info!(?placement, ?dtype, ?device, "instantiating model");
        let mut model = instantiate(registry, &config, placement, &options, weights.as_deref())?;

        let is_encoder_decoder = config.is_encoder_decoder;
        let loss_mask = if mode == Mode::Training {
            let loss_mask = args.loss_mask();
            if is_encoder_decoder && loss_mask != Some(LossMask::OutputOnly) {
                return Err(Error::Configuration(
                    "only output_only loss mask is supported with encoder decoder models".to_string(),
                ));
            }
            loss_mask
        } else {
            None
        };

        if !tokenizer_args.additional_special_tokens.is_empty() {
            let original_vocab_size = tokenizer.vocab_size();
            tokenizer.add_special_tokens(&tokenizer_args.additional_special_tokens);
            info!(
                "added {} tokens",
                tokenizer_args.additional_special_tokens.len()
            );
            if tokenizer.vocab_size() != original_vocab_size {
                model.resize_token_embeddings(tokenizer.vocab_size())?;
            }
        }

        // installed after any resize, which rebuilds the embedding
        if mode == Mode::Training
            && let Some(neft_alpha) = args.neft_alpha().filter(|&alpha| alpha > 0.0)
        {
            let embeddings = model.input_embeddings().ok_or_else(|| {
                Error::MissingCapability(
                    "model does not expose its input embeddings, so noise cannot be injected; \
                     expose them or unset neft_alpha"
                        .to_string(),
                )
            })?;
            model.set_input_embeddings(Arc::new(NeftuneEmbedding::new(embeddings, neft_alpha)))?;
        }

        Ok(Self {
            mode,
            model,
            tokenizer,
            device,
            padding_side,
            loss_mask,
            use_padding_free_transformer,
            is_encoder_decoder,
            distributed_backend,
            stage,
            tuning_method: args.tuning_method(),
            gradient_checkpointing_method: distributed_args.gradient_checkpointing_method,
            checkpoint_every: distributed_args.gradient_checkpointing_args.checkpoint_every,
            training: mode.is_training(),
        })
    }

    /// Pads `inputs` (and, while training, `outputs`) for the configured regime.
    ///
    /// Tensors stay on the host; labels are only produced in training modes.
    #[instrument(skip_all, fields(batch_size = inputs.len()))]
    pub fn prepare_batch(
        &self,
        inputs: &[Vec<u32>],
        outputs: Option<&[Vec<u32>]>,
    ) -> Result<PaddedBatch> {
        let outputs = if self.mode.is_training() {
            ensure!(outputs.is_some(), "outputs can't be None during training");
            outputs
        } else {
            None
        };

        pad(
            inputs,
            outputs,
            self.tokenizer.eos_token_id(),
            self.padding_side,
            self.is_encoder_decoder,
            self.loss_mask,
            self.use_padding_free_transformer,
        )
    }

    /// Decodes continuations of `inputs`, returning texts and generated-token counts.
    #[instrument(skip_all, fields(batch_size = inputs.len()))]
    pub fn generate(
        &self,
        inputs: &[Vec<u32>],
        generation_config: &GenerationConfig,
        rng: &mut dyn rand::RngCore,
    ) -> Result<(Vec<String>, Vec<usize>)> {
        if self.use_padding_free_transformer {
            return Err(Error::UnsupportedOperation(
                "padding free transformer doesn't support generation".to_string(),
            ));
        }

        let batch = self.prepare_batch(inputs, None)?.to_device(&self.device)?;
        let TokenIds::Dense(input_ids) = &batch.input_ids else {
            return Err(Error::Internal("generation needs a padded batch".to_string()));
        };
        let eos_token_id = self.tokenizer.eos_token_id();

        let mut generated = self.model.generate(
            input_ids,
            batch.attention_mask.as_ref(),
            generation_config,
            eos_token_id,
            rng,
        )?;
        if !self.is_encoder_decoder {
            let prompt_len = input_ids.dim(1)?;
            generated = generated.narrow(1, prompt_len, generated.dim(1)? - prompt_len)?;
        }

        let generated: Vec<Vec<u32>> = generated.to_vec2()?;
        let num_generated_tokens = count_generated_tokens(&generated, eos_token_id);
        let texts = self.tokenizer.batch_decode(&generated, true)?;
        Ok((texts, num_generated_tokens))
    }

    /// Model TFLOPs for one forward + backward over a `[batch_size, sequence_length]` batch.
    pub fn get_model_tflops(&self, batch_size: usize, sequence_length: usize) -> f64 {
        get_model_tflops(
            self.config(),
            batch_size,
            sequence_length,
            self.gradient_checkpointing_method,
            self.checkpoint_every,
        )
    }

    /// Runs the model on a training batch and returns the masked causal LM loss.
    pub fn forward(&self, inputs: &[Vec<u32>], outputs: &[Vec<u32>]) -> Result<ForwardOutput> {
        let batch = self
            .prepare_batch(inputs, Some(outputs))?
            .to_device(&self.device)?;
        let labels = batch.labels.ok_or_else(|| {
            Error::Precondition("labels are required to compute the loss".to_string())
        })?;

        let (logits, targets) = match (&batch.input_ids, labels) {
            (TokenIds::Dense(input_ids), Labels::Dense(labels)) => {
                let logits = self.model.forward(
                    &ModelInput::Dense {
                        input_ids,
                        attention_mask: batch.attention_mask.as_ref(),
                        labels: self.is_encoder_decoder.then_some(&labels),
                    },
                    self.training,
                )?;
                let targets = if self.is_encoder_decoder {
                    labels
                } else {
                    shift_labels(&labels)?
                };
                (logits, targets)
            }
            (TokenIds::Packed(rows), Labels::Packed(labels)) => {
                let cu_seqlens = cumulative_seqlens(rows);
                let max_seqlen = rows.iter().map(Vec::len).max().unwrap_or(0);
                let total = rows.iter().map(Vec::len).sum::<usize>();
                let input_ids = Tensor::from_vec(rows.concat(), (1, total), &self.device)?;
                let logits = self.model.forward(
                    &ModelInput::Packed {
                        input_ids: &input_ids,
                        cu_seqlens: &cu_seqlens,
                        max_seqlen,
                    },
                    self.training,
                )?;
                let shifted: Vec<i64> = labels
                    .iter()
                    .flat_map(|row| {
                        row.iter()
                            .skip(1)
                            .copied()
                            .chain(std::iter::once(LABELS_MASK_VALUE))
                    })
                    .collect();
                let targets = Tensor::from_vec(shifted, (1, total), &self.device)?;
                (logits, targets)
            }
            _ => {
                return Err(Error::Internal(
                    "input ids and labels disagree on packing".to_string(),
                ));
            }
        };

        let loss = masked_cross_entropy(&logits, &targets)?;
        let mut metrics = MetricsTrackingDict::new();
        metrics.insert("loss", loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64);
        Ok(ForwardOutput { loss, metrics })
    }

    /// Writes tokenizer, config and weights into `path`.
    pub fn save_pretrained<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        self.tokenizer.save_pretrained(path)?;
        self.config().save_json(path.join(CONFIG_FILE))?;
        self.model.var_map().save(path.join(WEIGHTS_FILE))?;
        Ok(())
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.model.var_map().save(path)?;
        Ok(())
    }

    /// Overwrites every parameter with the tensor of the same name in `path`.
    pub fn load_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        load_weights(self.model.var_map(), path)
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn reset_parameters(&mut self) -> Result<()> {
        self.model.reset_parameters()
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.model.var_map().all_vars()
    }

    pub fn var_map(&self) -> &VarMap {
        self.model.var_map()
    }

    pub fn model(&self) -> &dyn PretrainedModel {
        self.model.as_ref()
    }

    pub fn config(&self) -> &Config {
        self.model.config()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }

    pub fn loss_mask(&self) -> Option<LossMask> {
        self.loss_mask
    }

    pub fn use_padding_free_transformer(&self) -> bool {
        self.use_padding_free_transformer
    }

    pub fn is_encoder_decoder(&self) -> bool {
        self.is_encoder_decoder
    }

    pub fn distributed_backend(&self) -> Option<DistributedBackend> {
        self.distributed_backend
    }

    pub fn stage(&self) -> Option<u8> {
        self.stage
    }

    pub fn tuning_method(&self) -> TuningMethod {
        self.tuning_method
    }
}

/// Model TFLOPs for one forward + backward pass.
///
/// Per layer: MLP `4bshf` (`6bshf` for gated activations) plus attention
/// `4bsh(h(1 + k/n) + s)`; backward costs twice the forward, or
/// `forward / checkpoint_every` under block checkpointing. The LM head adds
/// `6bshv`.
pub fn get_model_tflops(
    config: &Config,
    batch_size: usize,
    sequence_length: usize,
    gradient_checkpointing_method: Option<GradientCheckpointingMethod>,
    checkpoint_every: usize,
) -> f64 {
    let b = batch_size as f64;
    let s = sequence_length as f64;
    let h = config.hidden_size as f64;
    let f = config.intermediate_size as f64;
    let n = config.num_heads as f64;
    let k = config.num_kv_heads as f64;
    let l = config.num_layers as f64;
    let v = config.vocab_size as f64;

    let mut mlp_flops = 4.0 * b * s * h * f;
    if config.activation_function.is_glu() {
        mlp_flops += 2.0 * b * s * h * f;
    }
    let attention_flops = 4.0 * b * s * h * (h * (1.0 + k / n) + s);
    let forward_flops = attention_flops + mlp_flops;

    let backward_flops = match gradient_checkpointing_method {
        Some(GradientCheckpointingMethod::Block) => forward_flops / checkpoint_every.max(1) as f64,
        None => 2.0 * forward_flops,
    };

    let model_flops = l * (forward_flops + backward_flops) + 6.0 * b * s * h * v;
    model_flops / 1e12
}

/// Mean negative log-likelihood over positions whose label is not the mask value.
///
/// `logits` is `[batch, seq, vocab]`, `labels` is `[batch, seq]` i64.
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let logits = logits
        .reshape((batch_size * seq_len, vocab_size))?
        .to_dtype(DType::F32)?;
    let labels = labels.reshape(batch_size * seq_len)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let valid = labels.ge(0i64)?;
    let safe_labels = valid.where_cond(&labels, &labels.zeros_like()?)?;
    let picked = log_probs
        .gather(&safe_labels.unsqueeze(1)?.contiguous()?, 1)?
        .squeeze(1)?;

    let valid = valid.to_dtype(DType::F32)?;
    let total = (picked * &valid)?.sum_all()?;
    let count = valid.sum_all()?.to_scalar::<f32>()?.max(1.0);
    Ok(total.neg()?.affine(1.0 / count as f64, 0.0)?)
}

/// Shifts labels one position left, filling the last column with the mask value.
fn shift_labels(labels: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len) = labels.dims2()?;
    let fill = Tensor::full(LABELS_MASK_VALUE, (batch_size, 1), labels.device())?;
    if seq_len <= 1 {
        return Ok(fill.narrow(1, 0, seq_len)?);
    }
    Ok(Tensor::cat(&[&labels.narrow(1, 1, seq_len - 1)?, &fill], 1)?)
}

fn resolve_device(mode: Mode, local_rank: usize) -> Result<Device> {
    let ordinal = if mode == Mode::Training { local_rank } else { 0 };
    #[cfg(feature = "cuda")]
    {
        return Ok(Device::new_cuda(ordinal)?);
    }
    #[cfg(all(feature = "metal", not(feature = "cuda")))]
    {
        return Ok(Device::new_metal(ordinal)?);
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        let _ = ordinal;
        warn!("no GPU device available, running on CPU");
        Ok(Device::Cpu)
    }
}

fn instantiate(
    registry: &ModelRegistry,
    config: &Config,
    placement: Placement,
    options: &ModelBuildOptions,
    weights: Option<&Path>,
) -> Result<Box<dyn PretrainedModel>> {
    let constructor = registry.resolve(&config.model_type)?;

    match placement {
        Placement::SingleInstance => {
            let host = ModelBuildOptions {
                device: Device::Cpu,
                ..options.clone()
            };
            let var_map = match weights {
                Some(path) => var_map_from_safetensors(path, &Device::Cpu, options.dtype)?,
                None => VarMap::new(),
            };
            let staged = constructor(config, var_map, &host)?;
            let on_device = VarMap::new();
            {
                let staged_data = staged
                    .var_map()
                    .data()
                    .lock()
                    .map_err(|_| Error::Internal("var map lock poisoned".to_string()))?;
                let mut data = on_device
                    .data()
                    .lock()
                    .map_err(|_| Error::Internal("var map lock poisoned".to_string()))?;
                for (name, var) in staged_data.iter() {
                    let tensor = var.as_tensor().to_device(&options.device)?;
                    data.insert(name.clone(), Var::from_tensor(&tensor)?);
                }
            }
            constructor(config, on_device, options)
        }
        Placement::DirectToDevice => {
            let model = constructor(config, VarMap::new(), options)?;
            if let Some(path) = weights {
                load_weights(model.var_map(), path)?;
            }
            Ok(model)
        }
        Placement::MetaMaterialize => {
            ensure!(
                weights.is_none(),
                "efficient initialization cannot load pretrained weights, unset model_name"
            );
            let mut model = constructor(config, VarMap::new(), options)?;
            model.reset_parameters()?;
            Ok(model)
        }
        Placement::DeviceMap | Placement::ReducedPrecision => {
            let var_map = match weights {
                Some(path) => var_map_from_safetensors(path, &options.device, options.dtype)?,
                None => VarMap::new(),
            };
            constructor(config, var_map, options)
        }
    }
}

fn var_map_from_safetensors(path: &Path, device: &Device, dtype: DType) -> Result<VarMap> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let var_map = VarMap::new();
    {
        let mut data = var_map
            .data()
            .lock()
            .map_err(|_| Error::Internal("var map lock poisoned".to_string()))?;
        for (name, tensor) in tensors {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            data.insert(name, Var::from_tensor(&tensor)?);
        }
    }
    Ok(var_map)
}

/// Copies every tensor of a safetensors file into the matching variable of `var_map`.
pub(crate) fn load_weights<P: AsRef<Path>>(var_map: &VarMap, path: P) -> Result<()> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::Internal("var map lock poisoned".to_string()))?;
    for (name, var) in data.iter() {
        let tensor = tensors.get(name).ok_or_else(|| {
            Error::Configuration(format!("{} has no tensor named {name}", path.display()))
        })?;
        var.set(&tensor.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    use super::*;
    use crate::arguments::{ExportArgs, InferenceArgs, ModelArgs, TokenizerArgs};
    use crate::config::ActivationFunction;
    use crate::enums::ParamsDtype;
    use crate::model::{GenerationConfig, ModelCapabilities};
    use crate::tokenizer::tests::word_level;

    const NUM_WORDS: usize = 30;

    fn tiny_config() -> Config {
        Config {
            vocab_size: NUM_WORDS + 2,
            max_seq_len: 32,
            hidden_size: 16,
            num_layers: 1,
            num_heads: 2,
            num_kv_heads: 1,
            intermediate_size: 32,
            dropout: 0.0,
            ..Config::nano()
        }
    }

    fn tokenizer_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("tokenizer.json");
        word_level(NUM_WORDS).save(&path, false).unwrap();
        path
    }

    struct Args {
        model_args: ModelArgs,
        tokenizer_args: TokenizerArgs,
        distributed_args: DistributedArgs,
        loss_mask: LossMask,
        neft_alpha: Option<f64>,
    }

    impl Args {
        fn new(dir: &TempDir) -> Self {
            Self {
                model_args: ModelArgs {
                    pretrained_config: Some(tiny_config()),
                    ..Default::default()
                },
                tokenizer_args: TokenizerArgs {
                    tokenizer_name: Some(tokenizer_file(dir).display().to_string()),
                    ..Default::default()
                },
                distributed_args: DistributedArgs::default(),
                loss_mask: LossMask::NoMask,
                neft_alpha: None,
            }
        }
    }

    impl ModelWrapperArgs for Args {
        fn model_args(&self) -> &ModelArgs {
            &self.model_args
        }

        fn tokenizer_args(&self) -> &TokenizerArgs {
            &self.tokenizer_args
        }

        fn distributed_args(&self) -> Option<&DistributedArgs> {
            Some(&self.distributed_args)
        }

        fn loss_mask(&self) -> Option<LossMask> {
            Some(self.loss_mask)
        }

        fn neft_alpha(&self) -> Option<f64> {
            self.neft_alpha
        }
    }

    fn rows(data: &[&[u32]]) -> Vec<Vec<u32>> {
        data.iter().map(|r| r.to_vec()).collect()
    }

    #[test]
    fn test_glu_adds_half_to_mlp_flops() {
        let base = Config {
            hidden_size: 768,
            intermediate_size: 3072,
            num_heads: 12,
            num_kv_heads: 12,
            num_layers: 1,
            vocab_size: 1,
            activation_function: ActivationFunction::Gelu,
            ..Config::gpt2_small()
        };
        let glu = Config {
            activation_function: ActivationFunction::Swiglu,
            ..base.clone()
        };
        let (b, s, h, f) = (2.0, 128.0, 768.0, 3072.0);

        let plain = get_model_tflops(&base, 2, 128, None, 1);
        let gated = get_model_tflops(&glu, 2, 128, None, 1);
        // forward + 2x backward
        let expected = 3.0 * 2.0 * b * s * h * f / 1e12;
        assert!(((gated - plain) - expected).abs() < 1e-12);

        let checkpointed = get_model_tflops(&base, 2, 128, Some(GradientCheckpointingMethod::Block), 2);
        assert!(checkpointed < plain);
    }

    #[test]
    fn test_placement_resolution() {
        let mut distributed = DistributedArgs::default();
        assert_eq!(
            Placement::resolve(Mode::Inference, &distributed, false),
            Placement::ReducedPrecision
        );
        assert_eq!(
            Placement::resolve(Mode::Training, &distributed, true),
            Placement::DirectToDevice
        );
        distributed.stage = 3;
        assert_eq!(
            Placement::resolve(Mode::Training, &distributed, true),
            Placement::MetaMaterialize
        );
        assert_eq!(
            Placement::resolve(Mode::Training, &distributed, false),
            Placement::DeviceMap
        );
        distributed.distributed_backend = DistributedBackend::HostManaged;
        assert_eq!(
            Placement::resolve(Mode::Training, &distributed, false),
            Placement::SingleInstance
        );
    }

    #[test]
    fn test_prepare_batch_requires_outputs_in_training() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = ModelWrapper::new(&Args::new(&dir), Mode::Training, 0).unwrap();
        let err = wrapper.prepare_batch(&rows(&[&[3, 4]]), None).err().unwrap();
        assert!(matches!(err, Error::Precondition(_)));

        let inputs = rows(&[&[3, 4, 5], &[6, 7, 8]]);
        let batch = wrapper.prepare_batch(&inputs, Some(&inputs)).unwrap();
        assert!(batch.labels.is_some());
        assert_eq!(batch.batch_size(), 2);
    }

    #[test]
    fn test_prepare_batch_pads_with_eos_and_drops_labels_outside_training() {
        let dir = tempfile::tempdir().unwrap();
        let args = InferenceArgs {
            model_args: ModelArgs {
                pretrained_config: Some(tiny_config()),
                ..Default::default()
            },
            tokenizer_args: TokenizerArgs {
                tokenizer_name: Some(tokenizer_file(&dir).display().to_string()),
                padding_side: Some(PaddingSide::Left),
                ..Default::default()
            },
            generation_parameters: crate::arguments::GenerationParameters {
                batch_size: 1,
                max_new_tokens: 1,
                temperature: None,
                top_k: None,
            },
            prompts_path: dir.path().join("prompts.jsonl"),
            output_path: dir.path().join("out.jsonl"),
            random_args: Default::default(),
        };
        let wrapper = ModelWrapper::new(&args, Mode::Inference, 0).unwrap();
        let inputs = rows(&[&[3], &[4, 5, 6]]);
        let batch = wrapper.prepare_batch(&inputs, Some(&inputs)).unwrap();
        assert!(batch.labels.is_none());

        let TokenIds::Dense(ids) = batch.input_ids else {
            panic!("expected a dense batch");
        };
        let eos = wrapper.tokenizer().eos_token_id();
        assert_eq!(ids.to_vec2::<u32>().unwrap()[0], vec![eos, eos, 3]);
    }

    #[test]
    fn test_padding_free_requires_flash_attention() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = Args::new(&dir);
        args.model_args.use_padding_free_transformer = true;
        let err = ModelWrapper::new(&args, Mode::Training, 0).err().unwrap();
        assert!(matches!(err, Error::Precondition(_)));

        args.model_args.attention_implementation = Some(AttentionImplementation::FlashAttention2);
        let wrapper = ModelWrapper::new(&args, Mode::Training, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let err = wrapper
            .generate(&rows(&[&[3, 4]]), &GenerationConfig::default(), &mut rng)
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[test]
    fn test_padding_free_requires_supporting_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = Args::new(&dir);
        args.model_args.use_padding_free_transformer = true;
        args.model_args.attention_implementation = Some(AttentionImplementation::FlashAttention2);

        let mut registry = ModelRegistry::empty();
        let gpt = ModelRegistry::default().resolve("gpt").unwrap();
        registry.register("gpt", ModelCapabilities::decoder_only(false), gpt);

        let err = ModelWrapper::with_registry(&args, Mode::Training, 0, &registry)
            .err()
            .unwrap();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_missing_tokenizer_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = Args::new(&dir);
        args.tokenizer_args.tokenizer_name = None;
        let err = ModelWrapper::new(&args, Mode::Training, 0).err().unwrap();
        assert!(err.to_string().contains("pass a tokenizer"));
    }

    /// Registers the reference decoder under `seq2seq`, declared encoder-decoder.
    fn seq2seq_registry() -> ModelRegistry {
        let mut registry = ModelRegistry::default();
        let gpt = registry.resolve("gpt").unwrap();
        registry.register(
            "seq2seq",
            ModelCapabilities {
                supports_padding_free: false,
                is_encoder_decoder: true,
            },
            gpt,
        );
        registry
    }

    #[test]
    fn test_encoder_decoder_training_requires_output_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = Args::new(&dir);
        args.model_args.pretrained_config = Some(Config {
            model_type: "seq2seq".to_string(),
            is_encoder_decoder: true,
            ..tiny_config()
        });
        let err = ModelWrapper::with_registry(&args, Mode::Training, 0, &seq2seq_registry())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("output_only"));

        args.loss_mask = LossMask::OutputOnly;
        let wrapper = ModelWrapper::with_registry(&args, Mode::Training, 0, &seq2seq_registry()).unwrap();
        assert!(wrapper.is_encoder_decoder());
    }

    #[test]
    fn test_encoder_decoder_flag_must_match_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = Args::new(&dir);
        args.loss_mask = LossMask::OutputOnly;
        args.model_args.pretrained_config = Some(Config {
            is_encoder_decoder: true,
            ..tiny_config()
        });
        let err = ModelWrapper::new(&args, Mode::Training, 0).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("decoder-only"));

        // rejected outside training too, where no loss mask is consulted
        let err = ModelWrapper::new(&args, Mode::Inference, 0).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));

        args.model_args.pretrained_config = Some(Config {
            model_type: "seq2seq".to_string(),
            ..tiny_config()
        });
        let err = ModelWrapper::with_registry(&args, Mode::Training, 0, &seq2seq_registry())
            .err()
            .unwrap();
        assert!(err.to_string().contains("encoder-decoder"));
    }

    #[test]
    fn test_efficient_initialization_rejects_pretrained_weights() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = ModelWrapper::new(&Args::new(&dir), Mode::Training, 0).unwrap();
        let pretrained = dir.path().join("pretrained");
        wrapper.save_pretrained(&pretrained).unwrap();

        let mut args = Args::new(&dir);
        args.model_args.model_name = Some(pretrained.display().to_string());
        args.distributed_args.stage = 3;
        args.model_args.efficient_initialization = true;
        let err = ModelWrapper::new(&args, Mode::Training, 0).err().unwrap();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_save_pretrained_roundtrip_across_placements() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = ModelWrapper::new(&Args::new(&dir), Mode::Training, 0).unwrap();
        let pretrained = dir.path().join("pretrained");
        wrapper.save_pretrained(&pretrained).unwrap();

        let inputs = rows(&[&[3, 4, 5, 6]]);
        let expected = wrapper.forward(&inputs, &inputs).unwrap().metrics["loss"];

        for (backend, stage) in [
            (DistributedBackend::Native, 0),
            (DistributedBackend::Native, 2),
            (DistributedBackend::HostManaged, 0),
        ] {
            let mut args = Args::new(&dir);
            args.model_args.model_name = Some(pretrained.display().to_string());
            args.tokenizer_args.tokenizer_name = None;
            args.distributed_args.distributed_backend = backend;
            args.distributed_args.stage = stage;
            let reloaded = ModelWrapper::new(&args, Mode::Training, 0).unwrap();
            let loss = reloaded.forward(&inputs, &inputs).unwrap().metrics["loss"];
            assert!((loss - expected).abs() < 1e-5, "{backend:?} stage {stage}");
        }

        let export = ExportArgs {
            model_args: ModelArgs {
                model_name: Some(pretrained.display().to_string()),
                dtype: ParamsDtype::Fp32,
                ..Default::default()
            },
            tokenizer_args: TokenizerArgs::default(),
            export_path: dir.path().join("export"),
        };
        let exported = ModelWrapper::new(&export, Mode::Export, 0).unwrap();
        assert_eq!(exported.config().vocab_size, tiny_config().vocab_size);
    }

    #[test]
    fn test_special_tokens_resize_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = Args::new(&dir);
        args.tokenizer_args.additional_special_tokens = vec!["<extra_0>".into(), "<extra_1>".into()];
        args.neft_alpha = Some(5.0);
        let wrapper = ModelWrapper::new(&args, Mode::Training, 0).unwrap();
        assert_eq!(wrapper.config().vocab_size, NUM_WORDS + 4);
        assert_eq!(wrapper.tokenizer().vocab_size(), NUM_WORDS + 4);
        assert!(wrapper.model().input_embeddings().is_some());
    }

    #[test]
    fn test_loss_ignores_masked_positions() {
        let logits = Tensor::new(
            &[[[0f32, 0.0], [10.0, 0.0], [0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(&[[LABELS_MASK_VALUE, 0, LABELS_MASK_VALUE]], &Device::Cpu).unwrap();
        let loss = masked_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected = -(10f32.exp() / (10f32.exp() + 1.0)).ln();
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_shift_labels() {
        let labels = Tensor::new(&[[1i64, 2, 3]], &Device::Cpu).unwrap();
        let shifted: Vec<Vec<i64>> = shift_labels(&labels).unwrap().to_vec2().unwrap();
        assert_eq!(shifted, vec![vec![2, 3, LABELS_MASK_VALUE]]);
    }

    #[test]
    #[cfg(not(feature = "flash-attn"))]
    fn test_packed_forward_matches_padded_forward() {
        let dir = tempfile::tempdir().unwrap();
        let padded = ModelWrapper::new(&Args::new(&dir), Mode::Training, 0).unwrap();
        let weights = dir.path().join("weights.safetensors");
        padded.save_weights(&weights).unwrap();

        let mut args = Args::new(&dir);
        args.model_args.use_padding_free_transformer = true;
        args.model_args.attention_implementation = Some(AttentionImplementation::FlashAttention2);
        let packed = ModelWrapper::new(&args, Mode::Training, 0).unwrap();
        packed.load_weights(&weights).unwrap();

        let inputs = rows(&[&[3, 4, 5, 6]]);
        let a = padded.forward(&inputs, &inputs).unwrap().metrics["loss"];
        let b = packed.forward(&inputs, &inputs).unwrap().metrics["loss"];
        assert!((a - b).abs() < 1e-4);
    }
}
