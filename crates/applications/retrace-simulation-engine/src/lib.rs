//! Retrace Simulation Engine
//!
//! Replays a workflow trace against a simulated cluster in virtual time.
//!
//! ## Modules
//! - `clock`: paused-time tokio runtime and the virtual clock on top of it
//! - `trace`, `environment`: GWF trace and SC18 environment readers
//! - `driver`: the replay loop
//! - `compute`, `workflow`, `policies`: simulated hosts and the services scheduling onto them
//! - `lifecycle`: shutdown ordering
//! - `metrics`: counters and the end-of-run snapshot
//! - `simulation`, `config`: one configured run, end to end

pub mod clock;
pub mod compute;
pub mod config;
pub mod driver;
pub mod environment;
pub mod lifecycle;
pub mod metrics;
pub mod policies;
pub mod simulation;
pub mod trace;
pub mod workflow;

pub use config::SimulationConfig;
pub use driver::{ReplayDriver, ReplayError, ReplayReport, ReplayState};
pub use simulation::{Simulation, SimulationReport};
