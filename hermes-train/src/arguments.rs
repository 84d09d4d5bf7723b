//! Typed argument bundles for the training, inference and export entry points.
//!
//! Bundles are plain serde structs loaded from JSON. Every field that has a
//! sensible default carries one, so a minimal training config only names the
//! model, the data and the step counts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::enums::{
    AttentionImplementation, DistributedBackend, GradientCheckpointingMethod, LossMask,
    LrDecayStyle, ParamsDtype, PaddingSide, TuningMethod,
};
use crate::error::{Error, Result};
use crate::tracking::TrackerBackend;

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelArgs {
    /// Directory holding `config.json` (+ `model.safetensors`) of a pretrained model
    #[serde(default)]
    pub model_name: Option<String>,
    /// Architecture config used when no pretrained model is named
    #[serde(default)]
    pub pretrained_config: Option<Config>,
    #[serde(default)]
    pub attention_implementation: Option<AttentionImplementation>,
    #[serde(default)]
    pub use_padding_free_transformer: bool,
    /// Build parameters straight on the target device instead of staging them
    #[serde(default)]
    pub efficient_initialization: bool,
    /// dtype for inference/export loads
    #[serde(default)]
    pub dtype: ParamsDtype,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenizerArgs {
    #[serde(default)]
    pub tokenizer_name: Option<String>,
    #[serde(default)]
    pub padding_side: Option<PaddingSide>,
    #[serde(default)]
    pub additional_special_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParameters {
    pub num_training_steps: usize,
    #[serde(default = "default_one")]
    pub micro_batch_size: usize,
    #[serde(default = "default_one")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub gradient_clipping: Option<f64>,
    #[serde(default = "default_true")]
    pub eval_during_training: bool,
    #[serde(default = "TrainingParameters::default_eval_interval")]
    pub eval_interval: usize,
    #[serde(default = "TrainingParameters::default_loss_mask")]
    pub loss_mask: LossMask,
}

impl TrainingParameters {
    fn default_eval_interval() -> usize {
        500
    }

    fn default_loss_mask() -> LossMask {
        LossMask::NoMask
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientCheckpointingArgs {
    #[serde(default = "default_one")]
    pub checkpoint_every: usize,
}

impl Default for GradientCheckpointingArgs {
    fn default() -> Self {
        Self {
            checkpoint_every: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedArgs {
    #[serde(default)]
    pub distributed_backend: DistributedBackend,
    /// 0 replicates parameters; anything above selects sharded initialization
    #[serde(default)]
    pub stage: u8,
    #[serde(default = "default_one")]
    pub tensor_parallel_size: usize,
    #[serde(default = "default_one")]
    pub pipeline_parallel_size: usize,
    /// Derived from the world size when absent
    #[serde(default)]
    pub data_parallel_size: Option<usize>,
    #[serde(default)]
    pub gradient_checkpointing_method: Option<GradientCheckpointingMethod>,
    #[serde(default)]
    pub gradient_checkpointing_args: GradientCheckpointingArgs,
    #[serde(default = "default_true")]
    pub sync_every_gradient_accumulation_step: bool,
    #[serde(default = "DistributedArgs::default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Path prefix for NCCL id exchange files
    #[serde(default = "DistributedArgs::default_comm_file")]
    pub comm_file: String,
}

impl DistributedArgs {
    fn default_timeout_minutes() -> u64 {
        10
    }

    fn default_comm_file() -> String {
        "nccl_id".to_string()
    }
}

impl Default for DistributedArgs {
    fn default() -> Self {
        Self {
            distributed_backend: DistributedBackend::Native,
            stage: 0,
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
            data_parallel_size: None,
            gradient_checkpointing_method: None,
            gradient_checkpointing_args: GradientCheckpointingArgs::default(),
            sync_every_gradient_accumulation_step: true,
            timeout_minutes: Self::default_timeout_minutes(),
            comm_file: Self::default_comm_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveArgs {
    pub save_path: PathBuf,
    pub save_interval: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadArgs {
    pub load_path: PathBuf,
    /// Latest checkpointed iteration when absent
    #[serde(default)]
    pub iteration: Option<usize>,
    #[serde(default = "default_true")]
    pub load_optimizer: bool,
    #[serde(default = "default_true")]
    pub load_lr_scheduler: bool,
    #[serde(default = "default_true")]
    pub load_dataloader_state: bool,
    #[serde(default = "default_true")]
    pub load_experiments_tracker_state: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingArgs {
    #[serde(default = "default_one")]
    pub log_interval: usize,
    #[serde(default)]
    pub experiments_tracker_name: TrackerBackend,
    /// Output file for the `jsonl` tracker backend
    #[serde(default)]
    pub tracker_path: Option<PathBuf>,
    #[serde(default)]
    pub profiler_trace_path: Option<PathBuf>,
}

impl Default for LoggingArgs {
    fn default() -> Self {
        Self {
            log_interval: 1,
            experiments_tracker_name: TrackerBackend::default(),
            tracker_path: None,
            profiler_trace_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResearchArgs {
    #[serde(default)]
    pub neft_alpha: Option<f64>,
}

/// A named set of JSONL files evaluated together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetGroup {
    #[serde(default)]
    pub name: Option<String>,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetArgs {
    pub train_files: Vec<PathBuf>,
    #[serde(default)]
    pub val: Vec<DatasetGroup>,
    #[serde(default)]
    pub test: Vec<DatasetGroup>,
    pub sequence_length: usize,
    #[serde(default = "default_one")]
    pub eval_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerArgs {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for OptimizerArgs {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LrSchedulerArgs {
    #[serde(default)]
    pub num_warmup_steps: usize,
    #[serde(default)]
    pub num_constant_steps: usize,
    /// Remaining steps after warmup and constant phases when absent
    #[serde(default)]
    pub num_decay_steps: Option<usize>,
    #[serde(default)]
    pub lr_decay_style: LrDecayStyle,
    /// Final learning rate as a fraction of the peak
    #[serde(default)]
    pub lr_decay_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomArgs {
    pub seed: u64,
}

impl Default for RandomArgs {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MixedPrecisionArgs {
    #[serde(default)]
    pub dtype: ParamsDtype,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TuningArgs {
    #[serde(default)]
    pub tuning_method: TuningMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArgs {
    pub model_args: ModelArgs,
    #[serde(default)]
    pub tokenizer_args: TokenizerArgs,
    pub training_parameters: TrainingParameters,
    #[serde(default)]
    pub distributed_args: DistributedArgs,
    pub save_args: SaveArgs,
    #[serde(default)]
    pub load_args: Option<LoadArgs>,
    #[serde(default)]
    pub logging_args: LoggingArgs,
    #[serde(default)]
    pub research_args: ResearchArgs,
    pub datasets: DatasetArgs,
    #[serde(default)]
    pub optimizer_args: OptimizerArgs,
    #[serde(default)]
    pub lr_scheduler_args: LrSchedulerArgs,
    #[serde(default)]
    pub random_args: RandomArgs,
    #[serde(default)]
    pub mixed_precision_args: MixedPrecisionArgs,
    #[serde(default)]
    pub tuning_args: TuningArgs,
}

impl TrainingArgs {
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let args: Self = serde_json::from_str(&content)?;
        args.validate()?;
        Ok(args)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("training_parameters.micro_batch_size", self.training_parameters.micro_batch_size),
            (
                "training_parameters.gradient_accumulation_steps",
                self.training_parameters.gradient_accumulation_steps,
            ),
            ("training_parameters.eval_interval", self.training_parameters.eval_interval),
            ("save_args.save_interval", self.save_args.save_interval),
            ("logging_args.log_interval", self.logging_args.log_interval),
            ("datasets.sequence_length", self.datasets.sequence_length),
            ("datasets.eval_steps", self.datasets.eval_steps),
            (
                "distributed_args.tensor_parallel_size",
                self.distributed_args.tensor_parallel_size,
            ),
            (
                "distributed_args.pipeline_parallel_size",
                self.distributed_args.pipeline_parallel_size,
            ),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(Error::Configuration(format!("{name} must be positive")));
            }
        }
        if self.model_args.model_name.is_none() && self.model_args.pretrained_config.is_none() {
            return Err(Error::Configuration(
                "one of model_args.model_name or model_args.pretrained_config is required".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParameters {
    #[serde(default = "default_one")]
    pub batch_size: usize,
    pub max_new_tokens: usize,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceArgs {
    pub model_args: ModelArgs,
    #[serde(default)]
    pub tokenizer_args: TokenizerArgs,
    pub generation_parameters: GenerationParameters,
    /// JSONL with one `{"text": ...}` prompt per line
    pub prompts_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub random_args: RandomArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportArgs {
    pub model_args: ModelArgs,
    #[serde(default)]
    pub tokenizer_args: TokenizerArgs,
    pub export_path: PathBuf,
}

/// What [`crate::model_wrapper::ModelWrapper`] reads from any argument bundle.
pub trait ModelWrapperArgs {
    fn model_args(&self) -> &ModelArgs;

    fn tokenizer_args(&self) -> &TokenizerArgs;

    fn distributed_args(&self) -> Option<&DistributedArgs> {
        None
    }

    fn loss_mask(&self) -> Option<LossMask> {
        None
    }

    fn neft_alpha(&self) -> Option<f64> {
        None
    }

    fn tuning_method(&self) -> TuningMethod {
        TuningMethod::Pretraining
    }

    /// dtype of trainable parameters, when training
    fn training_dtype(&self) -> ParamsDtype {
        ParamsDtype::Fp32
    }
}

impl ModelWrapperArgs for TrainingArgs {
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
        Some(self.training_parameters.loss_mask)
    }

    fn neft_alpha(&self) -> Option<f64> {
        self.research_args.neft_alpha
    }

    fn tuning_method(&self) -> TuningMethod {
        self.tuning_args.tuning_method
    }

    fn training_dtype(&self) -> ParamsDtype {
        self.mixed_precision_args.dtype
    }
}

impl ModelWrapperArgs for InferenceArgs {
    fn model_args(&self) -> &ModelArgs {
        &self.model_args
    }

    fn tokenizer_args(&self) -> &TokenizerArgs {
        &self.tokenizer_args
    }
}

impl ModelWrapperArgs for ExportArgs {
    fn model_args(&self) -> &ModelArgs {
        &self.model_args
    }

    fn tokenizer_args(&self) -> &TokenizerArgs {
        &self.tokenizer_args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "model_args": {"pretrained_config": {
            "model_type": "gpt", "vocab_size": 100, "max_seq_len": 32, "hidden_size": 16,
            "num_layers": 1, "num_heads": 2, "num_kv_heads": 2, "intermediate_size": 32,
            "activation_function": "gelu", "dropout": 0.0, "layer_norm_eps": 1e-5,
            "use_bias": true, "rope_theta": 10000.0
        }},
        "training_parameters": {"num_training_steps": 10},
        "save_args": {"save_path": "ckpt", "save_interval": 5},
        "datasets": {"train_files": ["train.jsonl"], "sequence_length": 16}
    }"#;

    #[test]
    fn test_minimal_training_args_defaults() {
        let args: TrainingArgs = serde_json::from_str(MINIMAL).unwrap();
        args.validate().unwrap();
        assert_eq!(args.training_parameters.gradient_accumulation_steps, 1);
        assert_eq!(args.training_parameters.loss_mask, LossMask::NoMask);
        assert_eq!(args.distributed_args.tensor_parallel_size, 1);
        assert!(args.distributed_args.sync_every_gradient_accumulation_step);
        assert_eq!(args.random_args.seed, 42);
        assert!(args.load_args.is_none());
        assert_eq!(args.loss_mask(), Some(LossMask::NoMask));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut args: TrainingArgs = serde_json::from_str(MINIMAL).unwrap();
        args.save_args.save_interval = 0;
        let err = args.validate().unwrap_err();
        assert!(err.to_string().contains("save_args.save_interval"));
    }

    #[test]
    fn test_model_source_required() {
        let mut args: TrainingArgs = serde_json::from_str(MINIMAL).unwrap();
        args.model_args.pretrained_config = None;
        assert!(matches!(args.validate(), Err(Error::Configuration(_))));
    }
}
