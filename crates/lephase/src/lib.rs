#![warn(missing_docs)]

//! lephase - phased deployment orchestration for LeDeploy.
//!
//! A deployment advances through four persisted phases. Each phase groups the
//! provisioners that must all verify before the phase is committed to the state
//! file; a failed or interrupted run therefore resumes at the first phase that
//! was not committed.

/// Read-only verification pass over every provisioner.
pub mod diagnostics;
/// Error types for phases and runs.
pub mod error;
/// Run lock, state persistence, phase controller and run coordinator.
pub mod orchestrate;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use diagnostics::{DiagnosticsReport, DiagnosticsReporter, Issue, PortCheck, Severity};
pub use error::{PhaseError, RunError};
pub use orchestrate::{
    InstallState, LockRecord, OrchestrationContext, PhaseController, PhasePlan, ProcessProbe,
    ResetOptions, ResetReport, RunCoordinator, RunLock, RunOutcome, RunReport, RunRequest,
};

/// Installation phase. Ordered; the persisted phase only ever moves forward.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing has been committed yet.
    #[default]
    NotStarted,
    /// System packages are installed.
    DependenciesReady,
    /// Database, environment file and application build are in place.
    ResourcesProvisioned,
    /// The service is installed, enabled and running.
    Complete,
}

impl Phase {
    /// All phases in order.
    pub const ALL: [Phase; 4] = [
        Phase::NotStarted,
        Phase::DependenciesReady,
        Phase::ResourcesProvisioned,
        Phase::Complete,
    ];

    /// The phase after this one, if any.
    pub const fn next(self) -> Option<Phase> {
        match self {
            Self::NotStarted => Some(Self::DependenciesReady),
            Self::DependenciesReady => Some(Self::ResourcesProvisioned),
            Self::ResourcesProvisioned => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    /// Stable snake_case name, as written to the state file.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::DependenciesReady => "dependencies_ready",
            Self::ResourcesProvisioned => "resources_provisioned",
            Self::Complete => "complete",
        }
    }

    /// Whether committing this phase ends the session.
    ///
    /// Dependency installation can change which executables a fresh login shell
    /// finds, so the run stops after committing it and the operator starts a new
    /// session before provisioning resources.
    pub const fn is_session_boundary(self) -> bool {
        matches!(self, Self::DependenciesReady)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
