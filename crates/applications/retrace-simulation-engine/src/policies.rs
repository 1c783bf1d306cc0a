//! Placement and admission policies
//!
//! Placement follows a filter/weigh scheme:
//! - Filters drop hosts that cannot take the task right now
//! - Weighers score the remaining hosts; the highest weighted sum wins
//!
//! Job admission decides when a submitted workflow may start running.

use retrace_core::TaskSpec;
use serde::{Deserialize, Serialize};

/// Point-in-time view of a host, as seen by the placement policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostView {
    pub index: usize,
    pub open: bool,
    pub cores: u32,
    pub memory_mb: u64,
    pub provisioned_cores: u32,
    pub provisioned_memory_mb: u64,
}

impl HostView {
    pub fn free_cores(&self) -> u32 {
        self.cores.saturating_sub(self.provisioned_cores)
    }

    pub fn free_memory_mb(&self) -> u64 {
        self.memory_mb.saturating_sub(self.provisioned_memory_mb)
    }
}

/// Host filter trait
pub trait HostFilter: Send + Sync {
    /// Whether `host` may take `task`
    fn test(&self, host: &HostView, task: &TaskSpec) -> bool;

    fn name(&self) -> &str;
}

/// Host weigher trait
pub trait HostWeigher: Send + Sync {
    /// Raw score, scaled by the weigher's multiplier
    fn weigh(&self, host: &HostView, task: &TaskSpec) -> f64;

    fn name(&self) -> &str;
}

/// Rejects hosts that have been closed
pub struct ComputeFilter;

impl HostFilter for ComputeFilter {
    fn test(&self, host: &HostView, _task: &TaskSpec) -> bool {
        host.open
    }

    fn name(&self) -> &str {
        "ComputeFilter"
    }
}

/// Rejects hosts without enough free cores or memory for the task
pub struct CapabilitiesFilter;

impl HostFilter for CapabilitiesFilter {
    fn test(&self, host: &HostView, task: &TaskSpec) -> bool {
        host.free_cores() >= task.cores && host.free_memory_mb() >= task.memory_mb
    }

    fn name(&self) -> &str {
        "CapabilitiesFilter"
    }
}

/// Scores hosts by how many cores are already provisioned on them.
///
/// With a negative multiplier this spreads load across hosts.
pub struct ProvisionedCoresWeigher;

impl HostWeigher for ProvisionedCoresWeigher {
    fn weigh(&self, host: &HostView, _task: &TaskSpec) -> f64 {
        f64::from(host.provisioned_cores)
    }

    fn name(&self) -> &str {
        "ProvisionedCoresWeigher"
    }
}

/// Filter/weigh host selection
pub struct FilterScheduler {
    filters: Vec<Box<dyn HostFilter>>,
    weighers: Vec<(Box<dyn HostWeigher>, f64)>,
}

impl FilterScheduler {
    pub fn new(filters: Vec<Box<dyn HostFilter>>, weighers: Vec<(Box<dyn HostWeigher>, f64)>) -> Self {
        Self { filters, weighers }
    }

    /// Hosts passing every filter, best weighted score first; ties keep host order
    pub fn rank(&self, hosts: &[HostView], task: &TaskSpec) -> Vec<usize> {
        let mut scored: Vec<(usize, f64)> = hosts
            .iter()
            .filter(|host| self.filters.iter().all(|f| f.test(host, task)))
            .map(|host| {
                let score: f64 = self
                    .weighers
                    .iter()
                    .map(|(weigher, multiplier)| weigher.weigh(host, task) * multiplier)
                    .sum();
                (host.index, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().map(|(index, _)| index).collect()
    }

    /// Pick a host for `task`; ties go to the lowest host index
    pub fn select(&self, hosts: &[HostView], task: &TaskSpec) -> Option<usize> {
        self.rank(hosts, task).first().copied()
    }

    /// Names of the configured filters, in evaluation order
    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Names of the configured weighers, in evaluation order
    pub fn weigher_names(&self) -> Vec<&str> {
        self.weighers.iter().map(|(w, _)| w.name()).collect()
    }
}

/// Filter selection in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    Compute,
    Capabilities,
}

/// Weigher selection in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeigherKind {
    ProvisionedCores,
}

/// A weigher with its multiplier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeigherConfig {
    pub kind: WeigherKind,
    pub multiplier: f64,
}

/// Serializable placement configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementPolicy {
    pub filters: Vec<FilterKind>,
    pub weighers: Vec<WeigherConfig>,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            filters: vec![FilterKind::Compute, FilterKind::Capabilities],
            weighers: vec![WeigherConfig {
                kind: WeigherKind::ProvisionedCores,
                multiplier: -1.0,
            }],
        }
    }
}

impl PlacementPolicy {
    pub fn build(&self) -> FilterScheduler {
        let filters = self
            .filters
            .iter()
            .map(|kind| -> Box<dyn HostFilter> {
                match kind {
                    FilterKind::Compute => Box::new(ComputeFilter),
                    FilterKind::Capabilities => Box::new(CapabilitiesFilter),
                }
            })
            .collect();

        let weighers = self
            .weighers
            .iter()
            .map(|w| -> (Box<dyn HostWeigher>, f64) {
                match w.kind {
                    WeigherKind::ProvisionedCores => (Box::new(ProvisionedCoresWeigher), w.multiplier),
                }
            })
            .collect();

        FilterScheduler::new(filters, weighers)
    }
}

/// When a submitted workflow may start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobAdmissionPolicy {
    /// Admit every job immediately
    #[default]
    Null,

    /// Admit while fewer than `max_active_jobs` jobs are running
    Limit { max_active_jobs: usize },
}

impl JobAdmissionPolicy {
    pub fn admits(&self, active_jobs: usize) -> bool {
        match self {
            JobAdmissionPolicy::Null => true,
            JobAdmissionPolicy::Limit { max_active_jobs } => active_jobs < *max_active_jobs,
        }
    }
}
