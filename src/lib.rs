//! Fabricbench - fleet-wide RDMA bandwidth test orchestration
//!
//! Drives a test backend through PRECHECK, RUN, PROBE, COLLECT and REPORT,
//! and turns what comes back into fleet-wide health and bandwidth verdicts.
//!
//! - `workflow`: the stage sequencer and its continuation policy
//! - `probe`: bounded, cancellable polling of remote processes
//! - `consistency`: frequency-based outlier detection over HCA attributes
//! - `report`: bandwidth deltas against the theoretical baseline
//! - `backend`: the `TestBackend` seam and its HTTP implementation

pub mod api;
pub mod backend;
pub mod config;
pub mod consistency;
pub mod error;
pub mod models;
pub mod probe;
pub mod report;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{HttpBackend, TestBackend};
pub use config::ConsoleConfig;
pub use error::{BackendError, EngineError, ReportError};
pub use workflow::{Stage, StageStatus, WorkflowEngine, WorkflowState};
