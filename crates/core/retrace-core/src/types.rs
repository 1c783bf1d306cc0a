//! Core types shared across Retrace components

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Memory requested by a workflow task when the trace does not say otherwise (MB)
pub const DEFAULT_TASK_MEMORY_MB: u64 = 1000;

/// A single timed submission read from a trace.
///
/// `start_offset_ms` is relative to the trace's own epoch, not to the
/// simulation clock. Events are expected in non-decreasing offset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent<W> {
    pub start_offset_ms: i64,
    pub workload: W,
}

impl<W> TraceEvent<W> {
    pub fn new(start_offset_ms: i64, workload: W) -> Self {
        Self {
            start_offset_ms,
            workload,
        }
    }
}

/// Parsed description of one simulated machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub id: u64,
    pub name: String,
    pub cores: u32,
    pub cpu_speed_mhz: u32,
    pub memory_mb: u64,
}

/// A unit of work inside a workflow job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: u64,
    pub submit_ms: i64,
    pub runtime: Duration,
    pub cores: u32,
    pub memory_mb: u64,
    /// Ids of tasks (within the same job) that must finish first
    pub dependencies: Vec<u64>,
}

impl TaskSpec {
    pub fn new(id: u64, runtime: Duration, cores: u32) -> Self {
        Self {
            id,
            submit_ms: 0,
            runtime,
            cores,
            memory_mb: DEFAULT_TASK_MEMORY_MB,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = u64>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }
}

/// A workflow: the payload of one trace event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub name: String,
    pub tasks: Vec<TaskSpec>,
}

impl Job {
    pub fn new(id: u64, tasks: Vec<TaskSpec>) -> Self {
        Self {
            id,
            name: format!("workflow-{id}"),
            tasks,
        }
    }
}

/// One recorded value of a long-sum metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp_ms: u64,
    pub value: i64,
}

/// All recorded points of a named metric, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricData {
    pub name: String,
    pub points: Vec<MetricPoint>,
}

impl MetricData {
    /// Most recent value, if any point was recorded
    pub fn last_value(&self) -> Option<i64> {
        self.points.last().map(|p| p.value)
    }
}

/// Final counter values of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_active: u64,
    pub jobs_finished: u64,
    pub tasks_submitted: u64,
    pub tasks_active: u64,
    pub tasks_finished: u64,
}

impl MetricsSnapshot {
    /// The two-line human readable summary printed at the end of a run
    pub fn summary(&self) -> String {
        format!(
            "Jobs: {}/{}\nTasks: {}/{}",
            self.jobs_finished, self.jobs_submitted, self.tasks_finished, self.tasks_submitted
        )
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.summary())
    }
}
