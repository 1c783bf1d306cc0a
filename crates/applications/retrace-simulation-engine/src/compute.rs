//! Simulated hosts and the compute service that places tasks on them
//!
//! Placement is attempted on scheduling-quantum boundaries. A task holds its
//! cores and memory for its runtime in virtual time; capacity released by a
//! finishing task wakes every task still waiting for a host.

use retrace_core::{Clock, Closeable, HostSpec, ResourceCloseError, SubmissionError, TaskSpec};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::clock::{duration_to_ms, next_boundary};
use crate::policies::{FilterScheduler, HostView};

#[derive(Debug, Default)]
struct HostState {
    provisioned_cores: u32,
    provisioned_memory_mb: u64,
    running: usize,
    closed: bool,
}

/// A simulated machine
#[derive(Debug)]
pub struct SimHost {
    spec: HostSpec,
    state: Mutex<HostState>,
}

impl SimHost {
    pub fn new(spec: HostSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_open(&self) -> bool {
        !self.state().closed
    }

    /// Tasks currently holding resources on this host
    pub fn running(&self) -> usize {
        self.state().running
    }

    /// Whether the task could run here on an otherwise idle host
    pub fn could_ever_fit(&self, task: &TaskSpec) -> bool {
        task.cores <= self.spec.cores && task.memory_mb <= self.spec.memory_mb
    }

    pub fn view(&self, index: usize) -> HostView {
        let state = self.state();
        HostView {
            index,
            open: !state.closed,
            cores: self.spec.cores,
            memory_mb: self.spec.memory_mb,
            provisioned_cores: state.provisioned_cores,
            provisioned_memory_mb: state.provisioned_memory_mb,
        }
    }

    fn try_reserve(&self, task: &TaskSpec) -> bool {
        let mut state = self.state();
        let free_cores = self.spec.cores.saturating_sub(state.provisioned_cores);
        let free_memory = self.spec.memory_mb.saturating_sub(state.provisioned_memory_mb);
        if state.closed || task.cores > free_cores || task.memory_mb > free_memory {
            return false;
        }
        state.provisioned_cores += task.cores;
        state.provisioned_memory_mb += task.memory_mb;
        state.running += 1;
        true
    }

    fn release(&self, cores: u32, memory_mb: u64) {
        let mut state = self.state();
        state.provisioned_cores = state.provisioned_cores.saturating_sub(cores);
        state.provisioned_memory_mb = state.provisioned_memory_mb.saturating_sub(memory_mb);
        state.running = state.running.saturating_sub(1);
    }
}

impl Closeable for SimHost {
    fn name(&self) -> String {
        format!("host {}", self.spec.name)
    }

    fn close(&self) -> Result<(), ResourceCloseError> {
        let mut state = self.state();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        debug!(host = %self.spec.name, "Host closed");

        if state.running > 0 {
            return Err(ResourceCloseError::new(
                self.name(),
                format!("closed with {} task(s) still running", state.running),
            ));
        }
        Ok(())
    }
}

/// Resources held on a host; released on drop, including when the owning
/// future is cancelled mid-run.
struct Reservation<'a> {
    service: &'a ComputeService,
    host: &'a SimHost,
    cores: u32,
    memory_mb: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.host.release(self.cores, self.memory_mb);
        self.service.capacity.notify_waiters();
    }
}

/// Places tasks on simulated hosts
pub struct ComputeService {
    hosts: Vec<Arc<SimHost>>,
    scheduler: FilterScheduler,
    clock: Arc<dyn Clock>,
    quantum: Duration,
    capacity: Notify,
    open_clients: AtomicUsize,
    closed: AtomicBool,
}

impl ComputeService {
    pub fn new(
        hosts: Vec<Arc<SimHost>>,
        scheduler: FilterScheduler,
        clock: Arc<dyn Clock>,
        quantum: Duration,
    ) -> Self {
        info!(
            hosts = hosts.len(),
            quantum_ms = duration_to_ms(quantum),
            "Compute service started"
        );
        Self {
            hosts,
            scheduler,
            clock,
            quantum,
            capacity: Notify::new(),
            open_clients: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn hosts(&self) -> &[Arc<SimHost>] {
        &self.hosts
    }

    /// Open a client handle; it must be closed before the service is
    pub fn new_client(self: &Arc<Self>) -> ComputeClient {
        self.open_clients.fetch_add(1, Ordering::SeqCst);
        ComputeClient {
            service: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run a task to completion on some host
    pub async fn run(&self, task: &TaskSpec) -> Result<(), SubmissionError> {
        if self.is_closed() {
            return Err(SubmissionError::Closed);
        }
        if !self.hosts.iter().any(|h| h.is_open() && h.could_ever_fit(task)) {
            return Err(SubmissionError::Unplaceable {
                task: task.id,
                cores: task.cores,
                memory_mb: task.memory_mb,
            });
        }

        let reservation = loop {
            self.clock
                .suspend_until(next_boundary(self.clock.now(), self.quantum))
                .await;

            let capacity_freed = self.capacity.notified();
            tokio::pin!(capacity_freed);
            capacity_freed.as_mut().enable();

            if self.is_closed() {
                return Err(SubmissionError::Closed);
            }
            if let Some(reservation) = self.try_place(task) {
                break reservation;
            }

            capacity_freed.await;
        };

        debug!(
            task = task.id,
            host = %reservation.host.spec.name,
            at_ms = duration_to_ms(self.clock.now()),
            "Task placed"
        );

        let finish = self.clock.now() + task.runtime;
        self.clock.suspend_until(finish).await;
        drop(reservation);
        Ok(())
    }

    fn try_place(&self, task: &TaskSpec) -> Option<Reservation<'_>> {
        let views: Vec<HostView> = self.hosts.iter().enumerate().map(|(i, h)| h.view(i)).collect();
        // The chosen host may still refuse when the policy has no capacity filter
        self.scheduler.rank(&views, task).into_iter().find_map(move |index| {
            let host: &SimHost = self.hosts.get(index)?;
            host.try_reserve(task).then(|| Reservation {
                service: self,
                host,
                cores: task.cores,
                memory_mb: task.memory_mb,
            })
        })
    }
}

impl Closeable for ComputeService {
    fn name(&self) -> String {
        "compute service".to_string()
    }

    fn close(&self) -> Result<(), ResourceCloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.capacity.notify_waiters();
        info!("Compute service closed");

        let open = self.open_clients.load(Ordering::SeqCst);
        if open > 0 {
            warn!(open_clients = open, "Compute service closed while clients are still open");
            return Err(ResourceCloseError::new(
                self.name(),
                format!("{open} client(s) still open"),
            ));
        }
        Ok(())
    }
}

/// A consumer's handle on the compute service
pub struct ComputeClient {
    service: Arc<ComputeService>,
    closed: AtomicBool,
}

impl ComputeClient {
    pub async fn run(&self, task: &TaskSpec) -> Result<(), SubmissionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmissionError::Closed);
        }
        self.service.run(task).await
    }

    /// Release the client. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.service.open_clients.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ComputeClient {
    fn drop(&mut self) {
        self.close();
    }
}
