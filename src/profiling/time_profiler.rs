//! Aggregated execution metrics.
//!
//! Plan-wide totals and per-task values keyed by [`ProfilerType`]. Times
//! are in nanoseconds, sizes in bytes.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ForgeResult, TaskForgeError};
use crate::profiling::KernelTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfilerType {
    TotalTime,
    CompileTime,
    CopyInTime,
    CopyOutTime,
    TotalKernelTime,
    TotalCopyInSizeBytes,
    TotalCopyOutSizeBytes,
    /// Per task
    KernelTime,
    /// Per task
    TaskCompileTime,
}

impl ProfilerType {
    pub fn name(&self) -> &'static str {
        match self {
            ProfilerType::TotalTime => "TOTAL_TIME",
            ProfilerType::CompileTime => "COMPILE_TIME",
            ProfilerType::CopyInTime => "COPY_IN_TIME",
            ProfilerType::CopyOutTime => "COPY_OUT_TIME",
            ProfilerType::TotalKernelTime => "TOTAL_KERNEL_TIME",
            ProfilerType::TotalCopyInSizeBytes => "TOTAL_COPY_IN_SIZE_BYTES",
            ProfilerType::TotalCopyOutSizeBytes => "TOTAL_COPY_OUT_SIZE_BYTES",
            ProfilerType::KernelTime => "KERNEL_TIME",
            ProfilerType::TaskCompileTime => "TASK_COMPILE_TIME",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimeProfiler {
    totals: BTreeMap<ProfilerType, u64>,
    tasks: BTreeMap<String, BTreeMap<ProfilerType, u64>>,
    timers: HashMap<ProfilerType, KernelTimer>,
}

impl TimeProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, metric: ProfilerType) {
        self.timers
            .entry(metric)
            .or_insert_with(|| KernelTimer::for_phase(metric.name()))
            .start();
    }

    /// Stop a running timer and add its elapsed time to `metric`
    pub fn stop(&mut self, metric: ProfilerType) {
        if let Some(timer) = self.timers.get_mut(&metric) {
            timer.stop();
            if let Some(ns) = timer.elapsed_ns() {
                self.add(metric, ns);
            }
        }
    }

    pub fn add(&mut self, metric: ProfilerType, value: u64) {
        *self.totals.entry(metric).or_insert(0) += value;
    }

    pub fn add_task(&mut self, task: &str, metric: ProfilerType, value: u64) {
        *self
            .tasks
            .entry(task.to_string())
            .or_default()
            .entry(metric)
            .or_insert(0) += value;
    }

    pub fn get(&self, metric: ProfilerType) -> u64 {
        self.totals.get(&metric).copied().unwrap_or(0)
    }

    pub fn task_value(&self, task: &str, metric: ProfilerType) -> u64 {
        self.tasks
            .get(task)
            .and_then(|m| m.get(&metric))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty() && self.tasks.is_empty()
    }

    pub fn clean(&mut self) {
        self.totals.clear();
        self.tasks.clear();
        self.timers.clear();
    }

    pub fn to_json(&self) -> Value {
        let totals: serde_json::Map<String, Value> = self
            .totals
            .iter()
            .map(|(metric, value)| (metric.name().to_string(), json!(value)))
            .collect();
        let tasks: serde_json::Map<String, Value> = self
            .tasks
            .iter()
            .map(|(task, metrics)| {
                let metrics: serde_json::Map<String, Value> = metrics
                    .iter()
                    .map(|(metric, value)| (metric.name().to_string(), json!(value)))
                    .collect();
                (task.clone(), Value::Object(metrics))
            })
            .collect();
        json!({ "totals": totals, "tasks": tasks })
    }

    /// Pretty-printed JSON profile log
    pub fn profile_log(&self) -> ForgeResult<String> {
        serde_json::to_string_pretty(&self.to_json())
            .map_err(|e| TaskForgeError::InternalError(format!("profile serialization failed: {}", e)))
    }
}
