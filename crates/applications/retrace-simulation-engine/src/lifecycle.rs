//! Shutdown sequencing
//!
//! Hosts close first, then the workflow service, then the compute service.
//! The workflow service holds a compute client, so it has to let go of it
//! before compute closes. Shutdown is best-effort: a failed close is logged
//! and recorded, and the remaining resources are still closed.

use retrace_core::{Closeable, ResourceCloseError};
use serde::Serialize;
use tracing::{error, info};

/// What happened during shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every resource a close was attempted on, in order
    pub closed: Vec<String>,
    pub errors: Vec<ResourceCloseError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn close(&mut self, resource: &dyn Closeable) {
        let name = resource.name();
        if let Err(e) = resource.close() {
            error!(resource = %name, error = %e, "Failed to close resource");
            self.errors.push(e);
        }
        self.closed.push(name);
    }
}

/// Close `hosts`, then `workflow`, then `compute`
pub fn shutdown<'a>(
    hosts: impl IntoIterator<Item = &'a dyn Closeable>,
    workflow: &dyn Closeable,
    compute: &dyn Closeable,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for host in hosts {
        report.close(host);
    }
    let host_count = report.closed.len();

    report.close(workflow);
    report.close(compute);

    info!(
        hosts = host_count,
        errors = report.errors.len(),
        "Simulated resources closed"
    );
    report
}
