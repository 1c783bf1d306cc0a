//! Retrace Core - Shared types and traits
//!
//! This crate defines the abstractions the replay driver is written against:
//! - `Clock` (virtual time source)
//! - `TraceSource` (ordered, forward-only workload submissions)
//! - `SchedulingTarget` and `Closeable` (the services a trace is replayed into)
//! - `MetricProducer` (counter snapshots read after shutdown)
//!
//! Concrete implementations live in `retrace-simulation-engine`.

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
