//! Workflow service
//!
//! Accepts whole jobs (task DAGs) and runs their tasks on the compute service
//! as dependencies are satisfied. This is the scheduling target the replay
//! driver submits into; `submit` resolves once every task of the job finished.
//!
//! ## Scheduling
//!
//! 1. **Admission**: the job waits until the admission policy lets it start
//! 2. **Eligibility**: a task is eligible once all of its dependencies finished
//! 3. **Release**: eligible tasks go to compute immediately (interactive) or on
//!    the next workflow quantum boundary (batch), in submission order

use async_trait::async_trait;
use retrace_core::{
    Clock, Closeable, Job, ResourceCloseError, SchedulingTarget, SubmissionError, TaskSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clock::next_boundary;
use crate::compute::ComputeClient;
use crate::metrics::{LongCounter, MeterRegistry, WorkflowCounters};
use crate::policies::JobAdmissionPolicy;

/// How eligible tasks are released to the compute service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowSchedulerMode {
    /// Release as soon as a task becomes eligible
    Interactive,

    /// Release on the next multiple of `quantum_ms`
    Batch { quantum_ms: u64 },
}

impl Default for WorkflowSchedulerMode {
    fn default() -> Self {
        WorkflowSchedulerMode::Batch { quantum_ms: 1000 }
    }
}

impl WorkflowSchedulerMode {
    pub fn quantum(&self) -> Option<Duration> {
        match self {
            WorkflowSchedulerMode::Interactive => None,
            WorkflowSchedulerMode::Batch { quantum_ms } => Some(Duration::from_millis(*quantum_ms)),
        }
    }
}

/// Check that a job's tasks form a DAG over known ids
fn validate_job(job: &Job) -> Result<(), SubmissionError> {
    let mut indegree: HashMap<u64, usize> = HashMap::with_capacity(job.tasks.len());
    for task in &job.tasks {
        if indegree.insert(task.id, task.dependencies.len()).is_some() {
            return Err(SubmissionError::rejected(format!(
                "job {} contains task {} twice",
                job.id, task.id
            )));
        }
    }

    let mut dependents: HashMap<u64, Vec<u64>> = HashMap::new();
    for task in &job.tasks {
        for dep in &task.dependencies {
            if !indegree.contains_key(dep) {
                return Err(SubmissionError::rejected(format!(
                    "task {} of job {} depends on unknown task {dep}",
                    task.id, job.id
                )));
            }
            dependents.entry(*dep).or_default().push(task.id);
        }
    }

    let mut ready: VecDeque<u64> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop_front() {
        visited += 1;
        for next in dependents.get(&id).into_iter().flatten() {
            if let Some(n) = indegree.get_mut(next) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(*next);
                }
            }
        }
    }

    if visited != job.tasks.len() {
        return Err(SubmissionError::rejected(format!(
            "job {} has a dependency cycle",
            job.id
        )));
    }
    Ok(())
}

/// Task id with how its compute run ended
type TaskOutcome = (u64, Result<(), SubmissionError>);

/// Decrements a gauge-style counter when dropped
struct Active(LongCounter);

impl Active {
    fn enter(counter: &LongCounter) -> Self {
        counter.add(1);
        Self(counter.clone())
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.0.add(-1);
    }
}

/// An admitted job; frees its admission slot when dropped
struct AdmittedJob<'a> {
    service: &'a WorkflowService,
    _active: Active,
}

impl Drop for AdmittedJob<'_> {
    fn drop(&mut self) {
        self.service.active_jobs.fetch_sub(1, Ordering::SeqCst);
        self.service.admission_slot.notify_waiters();
    }
}

/// Runs workflow jobs on a compute client
pub struct WorkflowService {
    clock: Arc<dyn Clock>,
    compute: Arc<ComputeClient>,
    mode: WorkflowSchedulerMode,
    admission: JobAdmissionPolicy,
    counters: WorkflowCounters,
    active_jobs: AtomicUsize,
    admission_slot: Notify,
    closed: AtomicBool,
}

impl WorkflowService {
    pub fn new(
        clock: Arc<dyn Clock>,
        compute: ComputeClient,
        mode: WorkflowSchedulerMode,
        admission: JobAdmissionPolicy,
        registry: &MeterRegistry,
    ) -> Self {
        info!(?mode, ?admission, "Workflow service started");
        Self {
            clock,
            compute: Arc::new(compute),
            mode,
            admission,
            counters: WorkflowCounters::register(registry),
            active_jobs: AtomicUsize::new(0),
            admission_slot: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Jobs admitted and not yet finished
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    async fn admit(&self) -> Result<AdmittedJob<'_>, SubmissionError> {
        loop {
            let slot_freed = self.admission_slot.notified();
            tokio::pin!(slot_freed);
            slot_freed.as_mut().enable();

            if self.is_closed() {
                return Err(SubmissionError::Closed);
            }
            let active = self.active_jobs.load(Ordering::SeqCst);
            if self.admission.admits(active) {
                self.active_jobs.fetch_add(1, Ordering::SeqCst);
                return Ok(AdmittedJob {
                    service: self,
                    _active: Active::enter(&self.counters.jobs_active),
                });
            }

            slot_freed.await;
        }
    }

    /// Start one task on compute
    fn dispatch(&self, running: &mut JoinSet<TaskOutcome>, task: TaskSpec) {
        let clock = Arc::clone(&self.clock);
        let compute = Arc::clone(&self.compute);
        let counters = self.counters.clone();
        let quantum = self.mode.quantum();

        running.spawn(async move {
            if let Some(quantum) = quantum {
                clock.suspend_until(next_boundary(clock.now(), quantum)).await;
            }
            let result = {
                let _active = Active::enter(&counters.tasks_active);
                compute.run(&task).await
            };
            if result.is_ok() {
                counters.tasks_finished.add(1);
            }
            (task.id, result)
        });
    }

    async fn execute(&self, job: &Job) -> Result<(), SubmissionError> {
        let mut order: Vec<&TaskSpec> = job.tasks.iter().collect();
        order.sort_by_key(|t| (t.submit_ms, t.id));

        let mut started: HashSet<u64> = HashSet::with_capacity(order.len());
        let mut finished: HashSet<u64> = HashSet::with_capacity(order.len());
        let mut running = JoinSet::new();

        loop {
            for task in &order {
                if !started.contains(&task.id)
                    && task.dependencies.iter().all(|d| finished.contains(d))
                {
                    started.insert(task.id);
                    self.dispatch(&mut running, (*task).clone());
                }
            }

            let failure = match running.join_next().await {
                None => break,
                Some(Ok((task_id, Ok(())))) => {
                    debug!(job = job.id, task = task_id, "Task finished");
                    finished.insert(task_id);
                    continue;
                }
                Some(Ok((task_id, Err(e)))) => {
                    warn!(job = job.id, task = task_id, error = %e, "Task failed, abandoning job");
                    e
                }
                Some(Err(join_err)) => SubmissionError::Panicked(join_err.to_string()),
            };

            running.abort_all();
            while running.join_next().await.is_some() {}
            return Err(failure);
        }

        if finished.len() != order.len() {
            return Err(SubmissionError::rejected(format!(
                "job {} stalled with {} unfinished task(s)",
                job.id,
                order.len() - finished.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulingTarget<Job> for WorkflowService {
    async fn submit(&self, job: Job) -> Result<(), SubmissionError> {
        if self.is_closed() {
            return Err(SubmissionError::Closed);
        }
        validate_job(&job)?;

        self.counters.jobs_submitted.add(1);
        self.counters.tasks_submitted.add(job.tasks.len() as i64);

        let admitted = self.admit().await?;
        debug!(job = job.id, tasks = job.tasks.len(), "Job admitted");

        let result = self.execute(&job).await;
        drop(admitted);

        if result.is_ok() {
            self.counters.jobs_finished.add(1);
            debug!(job = job.id, "Job finished");
        }
        result
    }
}

impl Closeable for WorkflowService {
    fn name(&self) -> String {
        "workflow service".to_string()
    }

    fn close(&self) -> Result<(), ResourceCloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.compute.close();
        self.admission_slot.notify_waiters();
        info!("Workflow service closed");

        let active = self.active_jobs();
        if active > 0 {
            return Err(ResourceCloseError::new(
                self.name(),
                format!("closed with {active} job(s) still active"),
            ));
        }
        Ok(())
    }
}
