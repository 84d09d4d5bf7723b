//! Training checkpoints.
//!
//! ```text
//! <save_path>/
//!   latest_checkpointed_iteration.json
//!   global_step<N>/
//!     model.safetensors
//!     optimizer.safetensors
//!     lr_scheduler.json
//!     experiments_tracker.json
//!     metadata.json
//!     args.json
//! ```

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::arguments::TrainingArgs;
use crate::distributed::ProcessGroupManager;
use crate::error::{Error, Result};
use crate::model_wrapper::ModelWrapper;
use crate::optimization::{AdamW, LrScheduler, LrSchedulerState};
use crate::tracking::{ExperimentsTracker, TrackerState};

const LATEST_FILE: &str = "latest_checkpointed_iteration.json";
const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const LR_SCHEDULER_FILE: &str = "lr_scheduler.json";
const TRACKER_FILE: &str = "experiments_tracker.json";
const METADATA_FILE: &str = "metadata.json";
const ARGS_FILE: &str = "args.json";

/// Dataloader position stored alongside the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub consumed_samples: usize,
}

#[derive(Serialize, Deserialize)]
struct LatestCheckpoint {
    latest_checkpointed_iteration: usize,
}

pub fn checkpoint_dir(save_path: &Path, iteration: usize) -> PathBuf {
    save_path.join(format!("global_step{iteration}"))
}

/// Writes a full checkpoint from the main process; every rank waits on a barrier.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(iteration = iteration))]
pub fn save_checkpoint(
    args: &TrainingArgs,
    model: &ModelWrapper,
    optimizer: &AdamW,
    lr_scheduler: &LrScheduler,
    experiments_tracker: &ExperimentsTracker,
    iteration: usize,
    metadata: &CheckpointMetadata,
    pg: &ProcessGroupManager,
) -> Result<()> {
    if pg.is_main_process() {
        let save_path = &args.save_args.save_path;
        let dir = checkpoint_dir(save_path, iteration);
        std::fs::create_dir_all(&dir)?;

        model.save_weights(dir.join(MODEL_FILE))?;
        optimizer.save(dir.join(OPTIMIZER_FILE))?;
        write_json(&dir.join(LR_SCHEDULER_FILE), &lr_scheduler.state_dict())?;
        write_json(&dir.join(TRACKER_FILE), &experiments_tracker.state_dict())?;
        write_json(&dir.join(METADATA_FILE), metadata)?;
        args.save_json(dir.join(ARGS_FILE))?;

        write_json(
            &save_path.join(LATEST_FILE),
            &LatestCheckpoint {
                latest_checkpointed_iteration: iteration,
            },
        )?;
        info!("saved checkpoint to {}", dir.display());
    }
    pg.barrier()
}

/// Restores weights and, as configured, optimizer and scheduler state.
///
/// Returns the checkpointed iteration, the dataloader metadata (with
/// `consumed_samples` reset to 0 unless `load_dataloader_state`) and the
/// tracker state.
pub fn load_checkpoint_for_training(
    args: &TrainingArgs,
    model: &ModelWrapper,
    optimizer: &mut AdamW,
    lr_scheduler: &mut LrScheduler,
) -> Result<(usize, Option<CheckpointMetadata>, Option<TrackerState>)> {
    let load_args = args.load_args.as_ref().ok_or_else(|| {
        Error::Configuration("load_args are required to resume training".to_string())
    })?;
    let load_path = &load_args.load_path;

    let iteration = match load_args.iteration {
        Some(iteration) => iteration,
        None => read_json::<LatestCheckpoint>(&load_path.join(LATEST_FILE))?.latest_checkpointed_iteration,
    };
    let dir = checkpoint_dir(load_path, iteration);
    if !dir.is_dir() {
        return Err(Error::Configuration(format!(
            "checkpoint directory {} does not exist",
            dir.display()
        )));
    }

    model.load_weights(dir.join(MODEL_FILE))?;
    if load_args.load_optimizer {
        optimizer.load(dir.join(OPTIMIZER_FILE))?;
    }
    if load_args.load_lr_scheduler {
        lr_scheduler.load_state_dict(read_json::<LrSchedulerState>(&dir.join(LR_SCHEDULER_FILE))?);
    }

    let metadata_path = dir.join(METADATA_FILE);
    let mut metadata = if metadata_path.exists() {
        Some(read_json::<CheckpointMetadata>(&metadata_path)?)
    } else {
        None
    };
    // the metadata carries the dataloader position
    if !load_args.load_dataloader_state
        && let Some(metadata) = metadata.as_mut()
    {
        metadata.consumed_samples = 0;
    }

    let tracker_path = dir.join(TRACKER_FILE);
    let tracker_state = if load_args.load_experiments_tracker_state && tracker_path.exists() {
        Some(read_json::<TrackerState>(&tracker_path)?)
    } else {
        None
    };

    info!("loaded checkpoint from {}", dir.display());
    Ok((iteration, metadata, tracker_state))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
