use leprovision::TeardownOptions;
use serde::Serialize;

use crate::Phase;

/// What an `install` invocation asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Re-run the resource and service phases of a complete installation.
    pub reconfigure: bool,
}

impl RunRequest {
    /// Run the next incomplete phases.
    pub fn install() -> Self {
        Self::default()
    }

    /// Re-apply resources and service on a complete installation.
    pub fn reconfigure() -> Self {
        Self { reconfigure: true }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Dependencies were committed; start a new session and run `install` again.
    SessionBoundary,
    /// Every remaining phase was committed.
    Completed,
    /// The installation was already complete; nothing ran.
    AlreadyComplete,
    /// Resources and service were re-applied.
    Reconfigured,
}

/// Per-resource outcome inside a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    /// Resource name
    pub resource: String,
    /// Whether it existed before this run
    pub already_present: bool,
    /// Non-blocking verification warnings
    pub warnings: Vec<String>,
}

/// A committed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSummary {
    /// Phase committed
    pub phase: Phase,
    /// Resources ensured, in order
    pub resources: Vec<ResourceSummary>,
}

/// Result of a coordinated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Persisted phase when the run started
    pub starting_phase: Phase,
    /// Persisted phase when the run ended
    pub final_phase: Phase,
    /// How the run ended
    pub outcome: RunOutcome,
    /// Phases committed by this run
    pub phases: Vec<PhaseSummary>,
}

/// What a reset should do besides clearing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOptions {
    /// Tear down provisioned resources, in reverse phase order
    pub teardown: Option<TeardownOptions>,
    /// Override a lock held by a live process
    pub force: bool,
}

/// Result of a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    /// Phase recorded before the reset
    pub previous_phase: Phase,
    /// Resources torn down, in order
    pub torn_down: Vec<String>,
    /// A foreign lock was removed
    pub lock_overridden: bool,
    /// A state file existed and was removed
    pub state_removed: bool,
}
