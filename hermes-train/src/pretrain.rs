//! Pretraining entry point: the step loop, evaluation and checkpoint cadence.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, instrument};

use crate::arguments::TrainingArgs;
use crate::checkpointing::{CheckpointMetadata, load_checkpoint_for_training, save_checkpoint};
use crate::data::{EvalDataLoader, PretrainingDataLoaders, get_pretraining_dataloaders};
use crate::distributed::{ProcessGroup, ProcessGroupManager};
use crate::enums::{Mode, TuningMethod};
use crate::error::{Error, Result};
use crate::metrics::MetricsTrackingDict;
use crate::model_wrapper::ModelWrapper;
use crate::optimization::{AdamW, LrScheduler};
use crate::profiler::StepProfiler;
use crate::tracking::ExperimentsTracker;
use crate::train_utils::{TrainStepOptions, all_reduce_metrics_tracker, track_metrics, train_step};

/// Logs validation metrics as `val-<key>`; the tracker receives `<group>-<key>` for named groups.
pub fn track_val_metrics(
    global_step: usize,
    experiments_tracker: &mut ExperimentsTracker,
    metrics: &MetricsTrackingDict,
    group_name: Option<&str>,
    pg: &ProcessGroupManager,
) -> Result<()> {
    let context = "val";

    if pg.is_main_process() {
        let mut message = format!("step = {global_step}");
        if let Some(name) = group_name {
            message.push_str(&format!(", group_name = {name}"));
        }
        for (key, value) in metrics.iter() {
            message.push_str(&format!(", {context}-{key} = {value:.4}"));
        }
        info!("{message}");
    }

    match group_name {
        None => experiments_tracker.track(metrics, global_step, Some(context)),
        Some(name) => {
            let named: MetricsTrackingDict = metrics
                .iter()
                .map(|(key, value)| (format!("{name}-{key}"), value))
                .collect();
            experiments_tracker.track(&named, global_step, Some(context))
        }
    }
}

/// Runs `eval_steps` forward passes per group and reports the averaged metrics.
///
/// With tensor parallelism the group's first rank decides whether there is
/// anything to evaluate. Without groups nothing runs, not even a collective.
/// Returns the metrics of the last group.
#[instrument(skip_all, fields(global_step = global_step))]
pub fn evaluate(
    val_dataloaders: &mut [EvalDataLoader],
    model: &mut ModelWrapper,
    global_step: usize,
    experiments_tracker: &mut ExperimentsTracker,
    eval_steps: usize,
    pg: &ProcessGroupManager,
) -> Result<Option<MetricsTrackingDict>> {
    let no_val_dataloaders = if pg.tensor_parallel_world_size() > 1 {
        let local = (pg.tensor_parallel_rank() == 0).then(|| val_dataloaders.is_empty());
        pg.broadcast_bool(local, 0, ProcessGroup::TensorParallel)?
    } else {
        val_dataloaders.is_empty()
    };
    if no_val_dataloaders {
        return Ok(None);
    }

    model.eval();
    let result = evaluate_groups(
        val_dataloaders,
        model,
        global_step,
        experiments_tracker,
        eval_steps,
        pg,
    );
    model.train();
    result.map(Some)
}

fn evaluate_groups(
    val_dataloaders: &mut [EvalDataLoader],
    model: &ModelWrapper,
    global_step: usize,
    experiments_tracker: &mut ExperimentsTracker,
    eval_steps: usize,
    pg: &ProcessGroupManager,
) -> Result<MetricsTrackingDict> {
    let mut last = MetricsTrackingDict::new();
    for group in val_dataloaders.iter_mut() {
        let mut metrics = MetricsTrackingDict::new();
        for _ in 0..eval_steps {
            let (inputs, outputs) = group.source.get_next_batch(pg)?;
            metrics = metrics + model.forward(&inputs, &outputs)?.metrics;
        }
        let metrics = all_reduce_metrics_tracker(metrics / eval_steps.max(1) as f64, pg)?;

        track_val_metrics(
            global_step,
            experiments_tracker,
            &metrics,
            group.name.as_deref(),
            pg,
        )?;
        last = metrics;
    }
    Ok(last)
}

/// Main training loop, from `starting_iteration` (exclusive) to `num_training_steps`.
///
/// The profiler trace is written even when a step fails; the step error wins.
#[allow(clippy::too_many_arguments)]
pub fn train(
    args: &TrainingArgs,
    model: &mut ModelWrapper,
    optimizer: &mut AdamW,
    lr_scheduler: &mut LrScheduler,
    dataloaders: &mut PretrainingDataLoaders,
    experiments_tracker: &mut ExperimentsTracker,
    pg: &ProcessGroupManager,
    starting_iteration: usize,
) -> Result<()> {
    let mut profiler = StepProfiler::new(args.logging_args.profiler_trace_path.as_deref(), pg.rank());
    let result = run_steps(
        args,
        model,
        optimizer,
        lr_scheduler,
        dataloaders,
        experiments_tracker,
        pg,
        starting_iteration,
        profiler.as_mut(),
    );
    let trace = profiler.map(StepProfiler::finish).transpose();

    result?;
    if let Some(path) = trace? {
        info!("wrote profiler trace to {}", path.display());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_steps(
    args: &TrainingArgs,
    model: &mut ModelWrapper,
    optimizer: &mut AdamW,
    lr_scheduler: &mut LrScheduler,
    dataloaders: &mut PretrainingDataLoaders,
    experiments_tracker: &mut ExperimentsTracker,
    pg: &ProcessGroupManager,
    starting_iteration: usize,
    mut profiler: Option<&mut StepProfiler>,
) -> Result<()> {
    let params = &args.training_parameters;
    let num_training_steps = params.num_training_steps;
    let eval_during_training = params.eval_during_training;
    let eval_interval = params.eval_interval;
    let eval_steps = args.datasets.eval_steps;
    let save_interval = args.save_args.save_interval;
    let log_interval = args.logging_args.log_interval;
    let step_options = TrainStepOptions {
        gradient_accumulation_steps: params.gradient_accumulation_steps,
        gradient_clipping: params.gradient_clipping,
        sync_every_gradient_accumulation_step: args
            .distributed_args
            .sync_every_gradient_accumulation_step,
    };

    model.train();

    if eval_during_training {
        evaluate(
            &mut dataloaders.val,
            model,
            starting_iteration,
            experiments_tracker,
            eval_steps,
            pg,
        )?;
    }

    let dp_world_size = pg.data_parallel_world_size();
    let sequence_length = args.datasets.sequence_length;
    let global_batch_size = params.micro_batch_size * params.gradient_accumulation_steps * dp_world_size;
    let tokens_per_batch = global_batch_size * sequence_length;
    // model TFLOPs per GPU
    let model_flops = model.get_model_tflops(global_batch_size, sequence_length) / pg.world_size() as f64;

    let progress = progress_bar(pg, starting_iteration, num_training_steps)?;

    let mut start_time = Instant::now();
    let mut steps_since_start_time = 0usize;
    let mut metrics = MetricsTrackingDict::new();

    let mut global_step = starting_iteration;
    while global_step < num_training_steps {
        global_step += 1;
        steps_since_start_time += 1;

        let step_metrics = train_step(
            model,
            optimizer,
            lr_scheduler,
            &mut dataloaders.train,
            &step_options,
            pg,
        )?;
        if let Some(loss) = step_metrics.get("loss") {
            progress.set_message(format!("{loss:.4}"));
        }
        progress.inc(1);
        metrics = metrics + step_metrics;

        if let Some(profiler) = profiler.as_mut() {
            profiler.step();
        }

        if global_step % log_interval == 0 {
            metrics = metrics / log_interval as f64;

            let time_elapsed = start_time.elapsed().as_secs_f64();
            let step_time = time_elapsed / steps_since_start_time as f64;

            metrics.insert("learning_rate", lr_scheduler.get_lr());
            metrics.insert("FLOPs", model_flops * steps_since_start_time as f64 / time_elapsed);
            metrics.insert(
                "billion_tokens_per_day",
                tokens_per_batch as f64 * 86400.0 / step_time / 1e9,
            );
            metrics.insert("step_time (sec)", step_time);

            track_metrics(global_step, experiments_tracker, &metrics, "train", pg)?;

            start_time = Instant::now();
            steps_since_start_time = 0;
            metrics = MetricsTrackingDict::new();
        }

        if eval_during_training && (global_step % eval_interval == 0 || global_step == num_training_steps) {
            evaluate(
                &mut dataloaders.val,
                model,
                global_step,
                experiments_tracker,
                eval_steps,
                pg,
            )?;
        }

        if global_step % save_interval == 0 || global_step == num_training_steps {
            let metadata = CheckpointMetadata {
                consumed_samples: global_step
                    * params.micro_batch_size
                    * params.gradient_accumulation_steps
                    * dp_world_size,
            };
            save_checkpoint(
                args,
                model,
                optimizer,
                lr_scheduler,
                experiments_tracker,
                global_step,
                &metadata,
                pg,
            )?;

            start_time = Instant::now();
            steps_since_start_time = 0;
        }
    }
    progress.finish_with_message("done");

    if eval_during_training {
        evaluate(
            &mut dataloaders.test,
            model,
            global_step,
            experiments_tracker,
            eval_steps,
            pg,
        )?;
    }
    Ok(())
}

/// Builds every component from `args` and runs pretraining to completion.
///
/// `pg` is torn down at the end of the run.
pub fn run(args: &TrainingArgs, mode: Mode, pg: ProcessGroupManager) -> Result<()> {
    match mode {
        Mode::Training if args.tuning_args.tuning_method != TuningMethod::Pretraining => {
            return Err(Error::Configuration(format!(
                "unexpected tuning method ({})",
                args.tuning_args.tuning_method
            )));
        }
        Mode::Training => {}
        other => {
            return Err(Error::UnsupportedOperation(format!(
                "pretraining does not run in {other:?} mode"
            )));
        }
    }
    args.validate()?;

    let mut model = ModelWrapper::new(args, mode, pg.local_rank())?;
    if pg.is_main_process() {
        info!(
            "model has {} parameters",
            model
                .trainable_vars()
                .iter()
                .map(|v| v.elem_count())
                .sum::<usize>()
        );
    }

    let mut optimizer = AdamW::from_var_map(
        model.var_map(),
        AdamW::params_from_args(&args.optimizer_args),
    )?;
    let mut lr_scheduler = LrScheduler::new(
        args.optimizer_args.learning_rate,
        &args.lr_scheduler_args,
        args.training_parameters.num_training_steps,
    )?;
    if pg.is_main_process() {
        info!(
            "optimizer: AdamW over {} tensors, {:?}",
            optimizer.num_params(),
            args.optimizer_args
        );
    }

    let mut starting_iteration = 0;
    let mut metadata = None;
    let mut tracker_state = None;
    if args.load_args.is_some() {
        (starting_iteration, metadata, tracker_state) =
            load_checkpoint_for_training(args, &model, &mut optimizer, &mut lr_scheduler)?;
    }

    let consumed_samples = metadata.map_or(0, |m: CheckpointMetadata| m.consumed_samples);
    let mut dataloaders = get_pretraining_dataloaders(args, model.tokenizer(), consumed_samples, &pg)?;

    let mut experiments_tracker = ExperimentsTracker::new(
        args.logging_args.experiments_tracker_name,
        args.logging_args.tracker_path.as_deref(),
        tracker_state,
        pg.is_main_process(),
    )?;
    experiments_tracker.log_args(args)?;

    train(
        args,
        &mut model,
        &mut optimizer,
        &mut lr_scheduler,
        &mut dataloaders,
        &mut experiments_tracker,
        &pg,
        starting_iteration,
    )?;

    pg.destroy_process_groups()
}

fn progress_bar(pg: &ProcessGroupManager, starting_iteration: usize, num_training_steps: usize) -> Result<ProgressBar> {
    if !pg.is_main_process() {
        return Ok(ProgressBar::hidden());
    }
    let progress = ProgressBar::new(num_training_steps as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")
            .map_err(|e| Error::Internal(e.to_string()))?
            .progress_chars("##-"),
    );
    progress.set_position(starting_iteration as u64);
    Ok(progress)
}
