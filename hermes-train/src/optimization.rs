//! AdamW with checkpointable state and the warmup/constant/decay LR schedule.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::optim::{Optimizer, ParamsAdamW};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::arguments::{LrSchedulerArgs, OptimizerArgs};
use crate::enums::LrDecayStyle;
use crate::error::{Error, Result};

const STEP_KEY: &str = "__step";

struct ParamState {
    name: String,
    var: Var,
    exp_avg: Var,
    exp_avg_sq: Var,
}

/// Decoupled weight decay Adam over named parameters.
pub struct AdamW {
    params: Vec<ParamState>,
    step_t: usize,
    config: ParamsAdamW,
}

impl AdamW {
    pub fn from_named_vars(vars: Vec<(String, Var)>, config: ParamsAdamW) -> Result<Self> {
        let params = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let exp_avg = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let exp_avg_sq = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(ParamState {
                    name,
                    var,
                    exp_avg,
                    exp_avg_sq,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            params,
            step_t: 0,
            config,
        })
    }

    /// Optimizes every parameter of `var_map`, in name order.
    pub fn from_var_map(var_map: &VarMap, config: ParamsAdamW) -> Result<Self> {
        let mut vars: Vec<(String, Var)> = var_map
            .data()
            .lock()
            .map_err(|_| Error::Internal("var map lock poisoned".to_string()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Self::from_named_vars(vars, config)
    }

    pub fn params_from_args(args: &OptimizerArgs) -> ParamsAdamW {
        ParamsAdamW {
            lr: args.learning_rate,
            beta1: args.beta1,
            beta2: args.beta2,
            eps: args.eps,
            weight_decay: args.weight_decay,
        }
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Writes moments and the step counter as safetensors.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for param in &self.params {
            tensors.insert(format!("{}.exp_avg", param.name), param.exp_avg.as_tensor().clone());
            tensors.insert(
                format!("{}.exp_avg_sq", param.name),
                param.exp_avg_sq.as_tensor().clone(),
            );
        }
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step_t as u32], &Device::Cpu)?,
        );
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let state = |key: String| {
            tensors.get(&key).ok_or_else(|| {
                Error::Configuration(format!("optimizer state has no entry for {key}"))
            })
        };
        for param in &self.params {
            let exp_avg = state(format!("{}.exp_avg", param.name))?;
            let exp_avg_sq = state(format!("{}.exp_avg_sq", param.name))?;
            param.exp_avg.set(
                &exp_avg
                    .to_device(param.var.device())?
                    .to_dtype(param.var.dtype())?,
            )?;
            param.exp_avg_sq.set(
                &exp_avg_sq
                    .to_device(param.var.device())?
                    .to_dtype(param.var.dtype())?,
            )?;
        }
        let step = state(STEP_KEY.to_string())?.to_vec1::<u32>()?;
        self.step_t = step.first().copied().unwrap_or(0) as usize;
        Ok(())
    }
}

impl Optimizer for AdamW {
    type Config = ParamsAdamW;

    fn new(vars: Vec<Var>, config: ParamsAdamW) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param.{i}"), var))
            .collect();
        Self::from_named_vars(named, config).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let lr = self.config.lr;
        let lr_lambda = lr * self.config.weight_decay;
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));

        for param in &self.params {
            let theta = &param.var;
            let Some(g) = grads.get(theta) else {
                continue;
            };
            let next_m = ((param.exp_avg.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
            let next_v = ((param.exp_avg_sq.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let next_theta = (theta.as_tensor() * (1f64 - lr_lambda))?;
            let adjusted_grad = (m_hat / (v_hat.sqrt()? + self.config.eps)?)?;
            let next_theta = (next_theta - (adjusted_grad * lr)?)?;
            param.exp_avg.set(&next_m)?;
            param.exp_avg_sq.set(&next_v)?;
            theta.set(&next_theta)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LrSchedulerState {
    pub last_step: usize,
}

/// Linear warmup, constant plateau, then decay to `lr_decay_factor * base_lr`.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    base_lr: f64,
    num_warmup_steps: usize,
    num_constant_steps: usize,
    num_decay_steps: usize,
    lr_decay_style: LrDecayStyle,
    lr_decay_factor: f64,
    current_step: usize,
}

impl LrScheduler {
    pub fn new(base_lr: f64, args: &LrSchedulerArgs, num_training_steps: usize) -> Result<Self> {
        let num_decay_steps = match args.num_decay_steps {
            Some(steps) => steps,
            None => num_training_steps
                .checked_sub(args.num_warmup_steps + args.num_constant_steps)
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "num_warmup_steps ({}) + num_constant_steps ({}) exceed num_training_steps ({})",
                        args.num_warmup_steps, args.num_constant_steps, num_training_steps
                    ))
                })?,
        };
        let total = args.num_warmup_steps + args.num_constant_steps + num_decay_steps;
        if total != num_training_steps {
            return Err(Error::Configuration(format!(
                "warmup + constant + decay steps ({total}) must equal num_training_steps ({num_training_steps})"
            )));
        }
        Ok(Self {
            base_lr,
            num_warmup_steps: args.num_warmup_steps,
            num_constant_steps: args.num_constant_steps,
            num_decay_steps,
            lr_decay_style: args.lr_decay_style,
            lr_decay_factor: args.lr_decay_factor,
            current_step: 0,
        })
    }

    /// Multiplier applied to the base learning rate at `step`.
    pub fn lr_lambda(&self, step: usize) -> f64 {
        if step < self.num_warmup_steps {
            return step as f64 / self.num_warmup_steps.max(1) as f64;
        }
        let step = step - self.num_warmup_steps;
        if step < self.num_constant_steps {
            return 1.0;
        }
        let step = step - self.num_constant_steps;
        if step >= self.num_decay_steps {
            return self.lr_decay_factor;
        }

        let progress = step as f64 / self.num_decay_steps as f64;
        let factor = self.lr_decay_factor;
        match self.lr_decay_style {
            LrDecayStyle::Linear => 1.0 - (1.0 - factor) * progress,
            LrDecayStyle::Cosine => factor + (1.0 - factor) * 0.5 * (1.0 + (PI * progress).cos()),
            LrDecayStyle::Exponential => factor.powf(progress),
        }
    }

    /// Learning rate for the current step.
    pub fn get_lr(&self) -> f64 {
        self.base_lr * self.lr_lambda(self.current_step)
    }

    pub fn step(&mut self) {
        self.current_step += 1;
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn state_dict(&self) -> LrSchedulerState {
        LrSchedulerState {
            last_step: self.current_step,
        }
    }

    pub fn load_state_dict(&mut self, state: LrSchedulerState) {
        self.current_step = state.last_step;
    }
}
