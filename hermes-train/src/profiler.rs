//! Per-step wall-clock profiler writing Chrome trace files (`chrome://tracing`, Perfetto).

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;

use crate::error::Result;

#[derive(Serialize)]
struct TraceEvent {
    name: String,
    cat: &'static str,
    ph: &'static str,
    /// microseconds since the profiler started
    ts: u64,
    dur: u64,
    pid: usize,
    tid: usize,
}

#[derive(Serialize)]
struct Trace<'a> {
    #[serde(rename = "traceEvents")]
    trace_events: &'a [TraceEvent],
}

pub struct StepProfiler {
    path: PathBuf,
    rank: usize,
    origin: Instant,
    step_start: Instant,
    step: usize,
    events: Vec<TraceEvent>,
}

impl StepProfiler {
    /// Returns `None` when no trace directory is configured.
    pub fn new(trace_dir: Option<&Path>, rank: usize) -> Option<Self> {
        let now = Instant::now();
        trace_dir.map(|dir| Self {
            path: dir.join(format!("rank{rank}.json")),
            rank,
            origin: now,
            step_start: now,
            step: 0,
            events: Vec::new(),
        })
    }

    /// Closes the current step span and opens the next one.
    pub fn step(&mut self) {
        let now = Instant::now();
        self.events.push(TraceEvent {
            name: format!("step {}", self.step),
            cat: "train",
            ph: "X",
            ts: self.step_start.duration_since(self.origin).as_micros() as u64,
            dur: now.duration_since(self.step_start).as_micros() as u64,
            pid: self.rank,
            tid: 0,
        });
        self.step += 1;
        self.step_start = now;
    }

    pub fn num_steps(&self) -> usize {
        self.step
    }

    /// Writes the trace and returns its path.
    pub fn finish(self) -> Result<PathBuf> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let trace = Trace {
            trace_events: &self.events,
        };
        std::fs::write(&self.path, serde_json::to_string(&trace)?)?;
        Ok(self.path)
    }
}
