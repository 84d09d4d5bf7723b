//! One optimizer step and the metric plumbing around it.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::optim::Optimizer;
use tracing::{info, instrument};

use crate::data::TensorParallelBatchSource;
use crate::distributed::{ProcessGroup, ProcessGroupManager};
use crate::error::{Error, Result};
use crate::metrics::MetricsTrackingDict;
use crate::model_wrapper::ModelWrapper;
use crate::optimization::{AdamW, LrScheduler};
use crate::tracking::ExperimentsTracker;

pub use crate::model_wrapper::get_model_tflops;

/// Knobs of a single optimizer step.
#[derive(Debug, Clone, Copy)]
pub struct TrainStepOptions {
    pub gradient_accumulation_steps: usize,
    pub gradient_clipping: Option<f64>,
    pub sync_every_gradient_accumulation_step: bool,
}

/// Runs `gradient_accumulation_steps` micro-batches, then one optimizer and scheduler step.
///
/// Each micro loss is scaled by `1 / gradient_accumulation_steps` so the
/// summed gradients are the window mean. Data-parallel gradients are averaged
/// after every micro-batch or once at the end of the window. Returns the
/// window-averaged metrics plus `grad_norm`, averaged over all ranks.
#[instrument(skip_all)]
pub fn train_step(
    model: &ModelWrapper,
    optimizer: &mut AdamW,
    lr_scheduler: &mut LrScheduler,
    train_dataloader: &mut TensorParallelBatchSource,
    options: &TrainStepOptions,
    pg: &ProcessGroupManager,
) -> Result<MetricsTrackingDict> {
    let accumulation_steps = options.gradient_accumulation_steps;
    if accumulation_steps == 0 {
        return Err(Error::Precondition(
            "gradient_accumulation_steps must be positive".to_string(),
        ));
    }

    let vars = model.trainable_vars();
    let mut grads: Option<GradStore> = None;
    let mut metrics = MetricsTrackingDict::new();

    for _ in 0..accumulation_steps {
        let (inputs, outputs) = train_dataloader.get_next_batch(pg)?;
        let output = model.forward(&inputs, &outputs)?;
        let loss = output.loss.affine(1.0 / accumulation_steps as f64, 0.0)?;

        let mut micro_grads = loss.backward()?;
        if options.sync_every_gradient_accumulation_step {
            all_reduce_gradients(&mut micro_grads, &vars, pg)?;
        }
        grads = Some(match grads {
            None => micro_grads,
            Some(accumulated) => accumulate_gradients(accumulated, &micro_grads, &vars)?,
        });
        metrics = metrics + output.metrics;
    }

    let mut grads = grads.ok_or_else(|| Error::Internal("no gradients were produced".to_string()))?;
    if !options.sync_every_gradient_accumulation_step {
        all_reduce_gradients(&mut grads, &vars, pg)?;
    }

    let grad_norm = clip_grad_norm(&mut grads, &vars, options.gradient_clipping)?;

    optimizer.set_learning_rate(lr_scheduler.get_lr());
    optimizer.step(&grads)?;
    lr_scheduler.step();

    let mut metrics = metrics / accumulation_steps as f64;
    metrics.insert("grad_norm", grad_norm);
    all_reduce_metrics_tracker(metrics, pg)
}

/// Averages every metric over the whole world.
pub fn all_reduce_metrics_tracker(
    mut metrics: MetricsTrackingDict,
    pg: &ProcessGroupManager,
) -> Result<MetricsTrackingDict> {
    let mut values = metrics.values_f32();
    pg.all_reduce_mean(&mut values, ProcessGroup::World)?;
    metrics.set_values_f32(&values);
    Ok(metrics)
}

/// Logs `metrics` on the main process and sends them to the tracker.
pub fn track_metrics(
    global_step: usize,
    experiments_tracker: &mut ExperimentsTracker,
    metrics: &MetricsTrackingDict,
    context: &str,
    pg: &ProcessGroupManager,
) -> Result<()> {
    if pg.is_main_process() {
        let mut message = format!("step = {global_step}");
        for (key, value) in metrics.iter() {
            if key == "learning_rate" {
                message.push_str(&format!(", {key} = {value:.4e}"));
            } else {
                message.push_str(&format!(", {context}-{key} = {value:.4}"));
            }
        }
        info!("{message}");
    }
    experiments_tracker.track(metrics, global_step, Some(context))
}

fn accumulate_gradients(mut accumulated: GradStore, micro: &GradStore, vars: &[Var]) -> Result<GradStore> {
    for var in vars {
        let Some(grad) = micro.get(var) else {
            continue;
        };
        let sum = match accumulated.get(var) {
            Some(previous) => (previous + grad)?,
            None => grad.clone(),
        };
        accumulated.insert(var, sum);
    }
    Ok(accumulated)
}

/// Averages gradients over the data-parallel group in one flattened collective.
fn all_reduce_gradients(grads: &mut GradStore, vars: &[Var], pg: &ProcessGroupManager) -> Result<()> {
    if pg.data_parallel_world_size() == 1 {
        return Ok(());
    }

    let mut flat = Vec::new();
    let mut present = Vec::new();
    for var in vars {
        if let Some(grad) = grads.get(var) {
            flat.extend(grad.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
            present.push(var);
        }
    }

    pg.all_reduce_mean(&mut flat, ProcessGroup::DataParallel)?;

    let mut offset = 0;
    for var in present {
        let elem_count = var.elem_count();
        let reduced = Tensor::from_slice(&flat[offset..offset + elem_count], var.shape(), var.device())?
            .to_dtype(var.dtype())?;
        grads.insert(var, reduced);
        offset += elem_count;
    }
    Ok(())
}

/// Returns the global L2 norm, rescaling gradients when it exceeds `max_norm`.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: Option<f64>) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            sum_sq += grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()? as f64;
        }
    }
    let total_norm = sum_sq.sqrt();

    if let Some(max_norm) = max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        if clip_coef < 1.0 {
            for var in vars {
                if let Some(grad) = grads.get(var) {
                    let clipped = grad.affine(clip_coef, 0.0)?;
                    grads.insert(var, clipped);
                }
            }
        }
    }
    Ok(total_norm)
}
