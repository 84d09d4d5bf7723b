use std::fmt;

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// What the process is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Training,
    Inference,
    Export,
    Distillation,
}

impl Mode {
    /// Modes that compute a loss and need labels from `prepare_batch`.
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Training | Mode::Distillation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossMask {
    /// Only output tokens contribute to the loss.
    OutputOnly,
    /// Every (unpadded) input token contributes to the loss.
    NoMask,
}

impl fmt::Display for LossMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossMask::OutputOnly => write!(f, "output_only"),
            LossMask::NoMask => write!(f, "no_mask"),
        }
    }
}

/// Who owns gradient aggregation and parameter placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributedBackend {
    /// In-crate NCCL data parallelism; `stage` selects replicated (0) or sharded init.
    #[default]
    Native,
    /// An external engine stages one host copy and manages device placement itself.
    HostManaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionImplementation {
    Eager,
    Sdpa,
    FlashAttention2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientCheckpointingMethod {
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TuningMethod {
    #[default]
    Pretraining,
    FullFinetuning,
    Distillation,
}

impl fmt::Display for TuningMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningMethod::Pretraining => write!(f, "pretraining"),
            TuningMethod::FullFinetuning => write!(f, "full_finetuning"),
            TuningMethod::Distillation => write!(f, "distillation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrDecayStyle {
    Linear,
    #[default]
    Cosine,
    Exponential,
}

/// Parameter dtype for training and reduced-precision loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamsDtype {
    #[default]
    Fp32,
    Bf16,
    Fp16,
}

impl ParamsDtype {
    pub fn dtype(self) -> DType {
        match self {
            ParamsDtype::Fp32 => DType::F32,
            ParamsDtype::Bf16 => DType::BF16,
            ParamsDtype::Fp16 => DType::F16,
        }
    }
}
