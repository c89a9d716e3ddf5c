//! Orchestration layer: lock, persisted state, phase controller and coordinator.

/// Installation paths for state and lock files.
pub mod context;
/// Run coordinator.
pub mod coordinator;
/// Phase controller.
pub mod engine;
/// Single-instance run lock.
pub mod lock;
/// Run requests and reports.
pub mod model;
/// Persisted installation state.
pub mod state;

pub use context::OrchestrationContext;
pub use coordinator::RunCoordinator;
pub use engine::{PhaseController, PhasePlan};
pub use lock::{AssumeAlive, LockError, LockRecord, ProcessProbe, RunLock};
pub use model::{
    PhaseSummary, ResetOptions, ResetReport, ResourceSummary, RunOutcome, RunReport, RunRequest,
};
pub use state::{InstallState, StateError};
