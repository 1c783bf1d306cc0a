//! Core traits for Retrace
//!
//! The replay driver and the lifecycle coordinator work through these
//! interfaces only. Hosts, services and clocks are pluggable.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{ResourceCloseError, SubmissionError, TraceError};
use crate::types::{MetricData, TraceEvent};

/// Monotonic simulated time source.
///
/// `now()` is measured from the start of the simulation run.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current simulated time
    fn now(&self) -> Duration;

    /// Suspend the calling task until simulated time reaches `deadline`.
    ///
    /// Returns immediately when `deadline <= now()`.
    async fn suspend_until(&self, deadline: Duration);
}

/// Finite, forward-only sequence of timed submissions
pub trait TraceSource {
    type Workload;

    fn has_next(&self) -> bool;

    /// Fails with `TraceError::Exhausted` once no events remain
    fn next_event(&mut self) -> Result<TraceEvent<Self::Workload>, TraceError>;
}

/// A simulated resource that must be released at the end of a run
pub trait Closeable: Send + Sync {
    /// Name used in logs and close errors
    fn name(&self) -> String;

    /// Release the resource. Calling it again has no further effect.
    fn close(&self) -> Result<(), ResourceCloseError>;
}

/// A service that accepts workloads and reports when each one completes.
///
/// `submit` is called concurrently from many submission tasks.
#[async_trait]
pub trait SchedulingTarget<W: Send + 'static>: Closeable {
    async fn submit(&self, workload: W) -> Result<(), SubmissionError>;
}

/// Source of named long-sum metrics
pub trait MetricProducer {
    /// Names of every metric this producer may report
    fn metric_names(&self) -> Vec<String>;

    /// Snapshot of every metric with its recorded points
    fn collect_all(&self) -> Vec<MetricData>;
}
