//! Simulation configuration

use retrace_core::{Result, SimError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policies::{JobAdmissionPolicy, PlacementPolicy};
use crate::workflow::WorkflowSchedulerMode;

/// Inputs and scheduler settings for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// SC18 environment description
    pub environment: PathBuf,

    /// GWF workflow trace
    pub trace: PathBuf,

    /// Compute placement happens on multiples of this
    pub scheduling_quantum_ms: u64,

    pub workflow_mode: WorkflowSchedulerMode,

    pub job_admission: JobAdmissionPolicy,

    pub placement: PlacementPolicy,

    /// Where to write the JSON report, if anywhere
    pub output: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            environment: PathBuf::from("data/environment.json"),
            trace: PathBuf::from("data/trace.gwf"),
            scheduling_quantum_ms: 1000,
            workflow_mode: WorkflowSchedulerMode::default(),
            job_admission: JobAdmissionPolicy::default(),
            placement: PlacementPolicy::default(),
            output: None,
        }
    }
}

impl SimulationConfig {
    /// Load from a JSON file; absent fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn with_environment(mut self, path: impl Into<PathBuf>) -> Self {
        self.environment = path.into();
        self
    }

    pub fn with_trace(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace = path.into();
        self
    }

    pub fn with_scheduling_quantum_ms(mut self, quantum_ms: u64) -> Self {
        self.scheduling_quantum_ms = quantum_ms;
        self
    }

    pub fn with_workflow_mode(mut self, mode: WorkflowSchedulerMode) -> Self {
        self.workflow_mode = mode;
        self
    }

    pub fn with_job_admission(mut self, policy: JobAdmissionPolicy) -> Self {
        self.job_admission = policy;
        self
    }

    pub fn with_placement(mut self, placement: PlacementPolicy) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn scheduling_quantum(&self) -> Duration {
        Duration::from_millis(self.scheduling_quantum_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduling_quantum_ms == 0 {
            return Err(SimError::config("scheduling quantum must be positive"));
        }
        if let WorkflowSchedulerMode::Batch { quantum_ms: 0 } = self.workflow_mode {
            return Err(SimError::config("batch quantum must be positive"));
        }
        if let JobAdmissionPolicy::Limit { max_active_jobs: 0 } = self.job_admission {
            return Err(SimError::config("job admission limit must be positive"));
        }
        if self.placement.filters.is_empty() && self.placement.weighers.is_empty() {
            return Err(SimError::config("placement policy needs at least one filter or weigher"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduling_quantum(), Duration::from_secs(1));
        assert_eq!(config.workflow_mode, WorkflowSchedulerMode::Batch { quantum_ms: 1000 });
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let zero_quantum = SimulationConfig::default().with_scheduling_quantum_ms(0);
        assert!(matches!(zero_quantum.validate(), Err(SimError::Config(_))));

        let zero_batch = SimulationConfig::default()
            .with_workflow_mode(WorkflowSchedulerMode::Batch { quantum_ms: 0 });
        assert!(zero_batch.validate().is_err());

        let zero_limit = SimulationConfig::default()
            .with_job_admission(JobAdmissionPolicy::Limit { max_active_jobs: 0 });
        assert!(zero_limit.validate().is_err());

        let interactive = SimulationConfig::default().with_workflow_mode(WorkflowSchedulerMode::Interactive);
        assert!(interactive.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "trace": "traces/montage.gwf",
            "workflow_mode": "Interactive",
            "job_admission": { "Limit": { "max_active_jobs": 4 } }
        }"#;
        let config: SimulationConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.trace, PathBuf::from("traces/montage.gwf"));
        assert_eq!(config.environment, PathBuf::from("data/environment.json"));
        assert_eq!(config.workflow_mode, WorkflowSchedulerMode::Interactive);
        assert_eq!(config.job_admission, JobAdmissionPolicy::Limit { max_active_jobs: 4 });
        assert_eq!(config.scheduling_quantum_ms, 1000);
        assert_eq!(config.output, None);
    }

    #[test]
    fn test_from_missing_file() {
        let err = SimulationConfig::from_json_file("/nonexistent/retrace.json").unwrap_err();
        assert!(matches!(err, SimError::Io(_)));
    }
}
