//! Experiment tracking.
//!
//! The `jsonl` backend appends one JSON object per call:
//!
//! ```json
//! {"run_id": "5f0c...", "step": 10, "context": "train", "timestamp": 1700000000.0, "metrics": {"loss": 2.5}}
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::MetricsTrackingDict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackerBackend {
    #[default]
    Disabled,
    Jsonl,
}

/// What a checkpoint keeps of the tracker so a resumed run appends to the same run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerState {
    pub run_id: String,
}

pub struct ExperimentsTracker {
    writer: Option<BufWriter<File>>,
    run_id: String,
}

impl ExperimentsTracker {
    /// Only the main process writes; other ranks get a silent tracker.
    pub fn new(
        backend: TrackerBackend,
        path: Option<&Path>,
        state: Option<TrackerState>,
        is_main_process: bool,
    ) -> Result<Self> {
        let run_id = match state {
            Some(state) => state.run_id,
            None => format!("{:016x}", rand::random::<u64>()),
        };

        let writer = match backend {
            _ if !is_main_process => None,
            TrackerBackend::Disabled => None,
            TrackerBackend::Jsonl => {
                let path = path.ok_or_else(|| {
                    Error::Configuration(
                        "logging_args.tracker_path is required for the jsonl tracker".to_string(),
                    )
                })?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(BufWriter::new(file))
            }
        };

        Ok(Self { writer, run_id })
    }

    pub fn disabled() -> Self {
        Self {
            writer: None,
            run_id: String::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_args<T: Serialize>(&mut self, args: &T) -> Result<()> {
        let entry = serde_json::json!({
            "run_id": self.run_id,
            "event": "args",
            "timestamp": timestamp(),
            "args": serde_json::to_value(args)?,
        });
        self.write_entry(&entry)
    }

    pub fn track(
        &mut self,
        metrics: &MetricsTrackingDict,
        step: usize,
        context: Option<&str>,
    ) -> Result<()> {
        let entry = serde_json::json!({
            "run_id": self.run_id,
            "step": step,
            "context": context,
            "timestamp": timestamp(),
            "metrics": metrics,
        });
        self.write_entry(&entry)
    }

    pub fn state_dict(&self) -> TrackerState {
        TrackerState {
            run_id: self.run_id.clone(),
        }
    }

    fn write_entry(&mut self, entry: &serde_json::Value) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", serde_json::to_string(entry)?)?;
            writer.flush()?;
        }
        Ok(())
    }
}

fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
