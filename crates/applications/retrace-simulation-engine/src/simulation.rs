//! Simulation runner
//!
//! Wires the pieces of one run together:
//! environment → hosts → compute service → workflow service → replay → shutdown → metrics

use chrono::{DateTime, Utc};
use retrace_core::{
    Clock, Closeable, HostSpec, Job, MetricsSnapshot, ResourceCloseError, Result, TraceSource,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::{simulation_runtime, VirtualClock};
use crate::compute::{ComputeService, SimHost};
use crate::config::SimulationConfig;
use crate::driver::{ReplayDriver, SubmissionFailure};
use crate::environment::read_environment_file;
use crate::lifecycle::shutdown;
use crate::metrics::{self, MeterRegistry};
use crate::trace::GwfTraceReader;
use crate::workflow::WorkflowService;

/// Result of one simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Wall-clock time the run started
    pub started_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    /// Trace events dispatched to the workflow service
    pub submissions: usize,
    pub submission_failures: Vec<SubmissionFailure>,
    pub close_errors: Vec<ResourceCloseError>,
    /// Virtual time from start to the end of shutdown
    pub virtual_duration_ms: u64,
    pub cancelled: bool,
    /// Submissions aborted by cancellation
    pub aborted: usize,
}

impl SimulationReport {
    /// `Jobs: x/y` and `Tasks: x/y`
    pub fn summary(&self) -> String {
        self.metrics.summary()
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// A configured simulation
pub struct Simulation {
    config: SimulationConfig,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Read the configured inputs and run to completion
    pub fn run(&self) -> Result<SimulationReport> {
        self.run_until_cancelled(CancellationToken::new())
    }

    /// Like [`Simulation::run`], stopping early once `cancel` fires
    pub fn run_until_cancelled(&self, cancel: CancellationToken) -> Result<SimulationReport> {
        let hosts = read_environment_file(&self.config.environment)?;
        let mut trace = GwfTraceReader::open(&self.config.trace)?;

        let runtime = simulation_runtime()?;
        runtime.block_on(self.execute(hosts, &mut trace, cancel))
    }

    /// Run on already-parsed hosts and trace
    pub fn run_with<S>(&self, hosts: Vec<HostSpec>, trace: &mut S) -> Result<SimulationReport>
    where
        S: TraceSource<Workload = Job>,
    {
        let runtime = simulation_runtime()?;
        runtime.block_on(self.execute(hosts, trace, CancellationToken::new()))
    }

    /// Run inside an existing paused-time runtime
    pub async fn execute<S>(
        &self,
        hosts: Vec<HostSpec>,
        trace: &mut S,
        cancel: CancellationToken,
    ) -> Result<SimulationReport>
    where
        S: TraceSource<Workload = Job>,
    {
        let started_at = Utc::now();
        let clock = VirtualClock::attach()?;
        let shared: Arc<dyn Clock> = Arc::new(clock);
        let registry = MeterRegistry::new(shared.clone());

        let hosts: Vec<Arc<SimHost>> = hosts.into_iter().map(|spec| Arc::new(SimHost::new(spec))).collect();
        let compute = Arc::new(ComputeService::new(
            hosts.clone(),
            self.config.placement.build(),
            shared.clone(),
            self.config.scheduling_quantum(),
        ));
        let workflow = Arc::new(WorkflowService::new(
            shared.clone(),
            compute.new_client(),
            self.config.workflow_mode,
            self.config.job_admission,
            &registry,
        ));
        metrics::validate(&registry);

        let mut driver = ReplayDriver::new(shared).with_cancellation(cancel);
        let replay = driver.replay(trace, workflow.clone()).await;
        // Aborted jobs leave their task runs queued for cancellation; let them
        // drop their host reservations before anything closes
        tokio::task::yield_now().await;

        let replay = match replay {
            Ok(replay) => replay,
            Err(e) => {
                shutdown(
                    hosts.iter().map(|host| &**host as &dyn Closeable),
                    workflow.as_ref(),
                    compute.as_ref(),
                );
                return Err(e.into());
            }
        };
        info!(
            submissions = replay.submissions(),
            at_ms = clock.now_ms(),
            "Workflow trace finished"
        );

        let closed = shutdown(
            hosts.iter().map(|host| &**host as &dyn Closeable),
            workflow.as_ref(),
            compute.as_ref(),
        );
        let metrics = metrics::collect(&registry);

        Ok(SimulationReport {
            started_at,
            metrics,
            submissions: replay.submissions(),
            submission_failures: replay.failures,
            close_errors: closed.errors,
            virtual_duration_ms: clock.now_ms(),
            cancelled: replay.cancelled,
            aborted: replay.aborted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::VecTraceSource;
    use crate::workflow::WorkflowSchedulerMode;
    use retrace_core::{SimError, TaskSpec, TraceError, TraceEvent};
    use std::time::Duration;

    fn hosts(n: u64) -> Vec<HostSpec> {
        (0..n)
            .map(|id| HostSpec {
                id,
                name: format!("node-0-0-{id}"),
                cores: 4,
                cpu_speed_mhz: 4100,
                memory_mb: 8000,
            })
            .collect()
    }

    fn job(id: u64, runtimes: &[u64]) -> Job {
        let tasks = runtimes
            .iter()
            .enumerate()
            .map(|(i, &secs)| TaskSpec::new(id * 100 + i as u64, Duration::from_secs(secs), 1))
            .collect();
        Job::new(id, tasks)
    }

    #[test]
    fn test_run_with_in_memory_trace() {
        let simulation = Simulation::new(SimulationConfig::default()).unwrap();
        let mut trace = VecTraceSource::new([
            TraceEvent::new(0, job(1, &[10, 20])),
            TraceEvent::new(5_000, job(2, &[5])),
        ]);

        let report = simulation.run_with(hosts(2), &mut trace).unwrap();

        assert_eq!(report.submissions, 2);
        assert_eq!(report.summary(), "Jobs: 2/2\nTasks: 3/3");
        assert_eq!(report.metrics.jobs_active, 0);
        assert_eq!(report.metrics.tasks_active, 0);
        assert!(report.submission_failures.is_empty());
        assert!(report.close_errors.is_empty());
        assert_eq!(report.virtual_duration_ms, 20_000);
        assert!(!report.cancelled);
    }

    #[test]
    fn test_empty_trace_reports_zeros() {
        let simulation = Simulation::new(SimulationConfig::default()).unwrap();
        let mut trace = VecTraceSource::<Job>::new([]);

        let report = simulation.run_with(hosts(1), &mut trace).unwrap();

        assert_eq!(report.submissions, 0);
        assert_eq!(report.metrics, MetricsSnapshot::default());
        assert_eq!(report.virtual_duration_ms, 0);
    }

    #[test]
    fn test_unplaceable_job_is_isolated() {
        let simulation = Simulation::new(
            SimulationConfig::default().with_workflow_mode(WorkflowSchedulerMode::Interactive),
        )
        .unwrap();
        let huge = Job::new(9, vec![TaskSpec::new(900, Duration::from_secs(1), 64)]);
        let mut trace = VecTraceSource::new([
            TraceEvent::new(0, job(1, &[3])),
            TraceEvent::new(0, huge),
            TraceEvent::new(1_000, job(2, &[3])),
        ]);

        let report = simulation.run_with(hosts(1), &mut trace).unwrap();

        assert_eq!(report.submissions, 3);
        assert_eq!(report.submission_failures.len(), 1);
        assert_eq!(report.submission_failures[0].index, Some(1));
        assert_eq!(report.summary(), "Jobs: 2/3\nTasks: 2/3");
    }

    /// Yields one job, then reports a malformed record
    struct TruncatedTrace(VecTraceSource<Job>);

    impl TraceSource for TruncatedTrace {
        type Workload = Job;

        fn has_next(&self) -> bool {
            true
        }

        fn next_event(&mut self) -> std::result::Result<TraceEvent<Job>, TraceError> {
            if self.0.has_next() {
                return self.0.next_event();
            }
            Err(TraceError::Parse {
                line: 2,
                reason: "truncated record".to_string(),
            })
        }
    }

    #[test]
    fn test_trace_failure_mid_run_is_reported() {
        let simulation = Simulation::new(SimulationConfig::default()).unwrap();
        let mut trace = TruncatedTrace(VecTraceSource::new([TraceEvent::new(0, job(1, &[30]))]));

        let err = simulation.run_with(hosts(1), &mut trace).unwrap_err();

        assert!(matches!(err, SimError::Trace(TraceError::Parse { line: 2, .. })));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Simulation::new(SimulationConfig::default().with_scheduling_quantum_ms(0));
        assert!(matches!(result, Err(SimError::Config(_))));
    }

    #[test]
    fn test_missing_environment_file() {
        let config = SimulationConfig::default().with_environment("/nonexistent/environment.json");
        let err = Simulation::new(config).unwrap().run().unwrap_err();
        assert!(matches!(err, SimError::Environment(_)));
    }

    #[test]
    fn test_report_serializes() {
        let simulation = Simulation::new(SimulationConfig::default()).unwrap();
        let mut trace = VecTraceSource::new([TraceEvent::new(0, job(1, &[1]))]);
        let report = simulation.run_with(hosts(1), &mut trace).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["metrics"]["jobs_finished"], 1);
        assert_eq!(json["submissions"], 1);
        assert!(json["started_at"].is_string());
    }
}
