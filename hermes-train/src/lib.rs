//! Distributed LLM pretraining on candle.
//!
//! [`model_wrapper::ModelWrapper`] owns the model, tokenizer and the
//! batch/loss plumbing; [`pretrain`] drives the step loop on top of it.

pub mod arguments;
pub mod checkpointing;
pub mod config;
pub mod data;
pub mod distributed;
pub mod enums;
pub mod error;
pub mod generate;
pub mod io;
pub mod metrics;
pub mod model;
pub mod model_wrapper;
pub mod optimization;
pub mod padding;
pub mod pretrain;
pub mod profiler;
pub mod tokenizer;
pub mod tracking;
pub mod train_utils;

pub use arguments::{ExportArgs, InferenceArgs, TrainingArgs};
pub use config::Config;
pub use distributed::ProcessGroupManager;
pub use enums::Mode;
pub use error::{Error, Result};
pub use metrics::MetricsTrackingDict;
pub use model_wrapper::ModelWrapper;
