//! Error types for Retrace

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for simulation-level operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Errors produced while reading a trace
#[derive(Error, Debug)]
pub enum TraceError {
    /// `next_event` was called after the last event
    #[error("trace exhausted: no remaining events")]
    Exhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("missing trace column: {0}")]
    MissingColumn(String),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: u64, dependency: u64 },
}

/// Errors produced while reading an environment description
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("the cpu id {0} is not recognized")]
    UnknownCpu(u32),

    #[error("the memory id {0} is not recognized")]
    UnknownMemory(u32),
}

/// A single submission failed downstream.
///
/// Isolated to the task that produced it; never aborts replay.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionError {
    #[error("scheduling target is closed")]
    Closed,

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("task {task} needs {cores} cores / {memory_mb}MB, no host can ever fit it")]
    Unplaceable { task: u64, cores: u32, memory_mb: u64 },

    #[error("submission failed: {0}")]
    Failed(String),

    #[error("submission task panicked: {0}")]
    Panicked(String),
}

impl SubmissionError {
    /// Create a rejection error
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create a generic failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Closing a host or service failed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("failed to close {resource}: {reason}")]
pub struct ResourceCloseError {
    pub resource: String,
    pub reason: String,
}

impl ResourceCloseError {
    pub fn new(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

/// The virtual clock could not be obtained
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("no simulation runtime is active on this thread")]
    Unavailable,
}

/// Top-level simulation error
#[derive(Error, Debug)]
pub enum SimError {
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SimError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
