use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{PhaseError, RunError};
use crate::Phase;

use super::{
    context::OrchestrationContext,
    engine::PhaseController,
    lock::{AssumeAlive, LockError, ProcessProbe, RunLock},
    model::{ResetOptions, ResetReport, RunReport, RunRequest},
    state::InstallState,
};

/// Serialises runs against one installation and dispatches to the controller.
pub struct RunCoordinator {
    context: OrchestrationContext,
    controller: PhaseController,
    probe: Arc<dyn ProcessProbe>,
}

impl RunCoordinator {
    /// Coordinator for `context` driving `controller`.
    pub fn new(context: OrchestrationContext, controller: PhaseController) -> Self {
        Self {
            context,
            controller,
            probe: Arc::new(AssumeAlive),
        }
    }

    /// Probe used to tell stale locks from live ones during reset.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Installation context.
    pub fn context(&self) -> &OrchestrationContext {
        &self.context
    }

    /// Phase controller.
    pub fn controller(&self) -> &PhaseController {
        &self.controller
    }

    /// Persisted phase, without taking the lock.
    pub fn current_phase(&self) -> Result<Phase, RunError> {
        Ok(InstallState::load_or_default(&self.context.state_path())?.phase)
    }

    /// Take the lock, load state and run the phases not yet committed.
    ///
    /// Fails fast with a conflict when another run holds the lock. The lock is
    /// released on every return path.
    pub fn run(&self, request: RunRequest) -> Result<RunReport, RunError> {
        let lock = RunLock::acquire(&self.context.lock_path())?;

        let state_path = self.context.state_path();
        let mut state = InstallState::load_or_default(&state_path)?;
        if let Some(recorded) = &state.project_path {
            if recorded != &self.context.project_path {
                return Err(RunError::ProjectPathChanged {
                    recorded: recorded.clone(),
                    requested: self.context.project_path.clone(),
                });
            }
        }

        info!(phase = %state.phase, reconfigure = request.reconfigure, "starting run");
        let report = self.controller.advance(
            &mut state,
            &state_path,
            &self.context.project_path,
            request,
        )?;
        info!(
            from = %report.starting_phase,
            to = %report.final_phase,
            outcome = ?report.outcome,
            "run finished"
        );

        lock.release()?;
        Ok(report)
    }

    /// Clear installation state, optionally tearing resources down first.
    ///
    /// A lock whose holder is no longer running is removed. A lock held by a
    /// live process is only removed with `force`.
    pub fn reset(&self, options: ResetOptions) -> Result<ResetReport, RunError> {
        let lock_path = self.context.lock_path();
        let (lock, lock_overridden) = match RunLock::acquire(&lock_path) {
            Ok(lock) => (lock, false),
            Err(LockError::Held { path, holder }) => {
                let stale = holder
                    .as_ref()
                    .map(|record| !self.probe.is_alive(record.pid))
                    .unwrap_or(false);
                if !stale && !options.force {
                    return Err(RunError::Conflict { path, holder });
                }
                warn!(
                    lock = %path.display(),
                    stale,
                    forced = options.force,
                    "overriding run lock for reset"
                );
                RunLock::force_remove(&path)?;
                (RunLock::acquire(&lock_path)?, true)
            }
            Err(err) => return Err(err.into()),
        };

        let state_path = self.context.state_path();
        let previous_phase = match InstallState::load_or_default(&state_path) {
            Ok(state) => state.phase,
            Err(err) => {
                warn!(error = %err, "state file unreadable; resetting anyway");
                Phase::NotStarted
            }
        };

        let mut torn_down = Vec::new();
        if let Some(teardown) = options.teardown {
            for plan in self.controller.plans().iter().rev() {
                for provisioner in plan.provisioners.iter().rev() {
                    let resource = provisioner.resource();
                    info!(phase = %plan.target, resource = %resource, "tearing down");
                    provisioner
                        .teardown(&teardown)
                        .map_err(|err| PhaseError::from_provision(plan.target, err))?;
                    torn_down.push(resource);
                }
            }
        }

        let state_removed = InstallState::remove(&state_path)?;
        info!(previous = %previous_phase, "installation reset");
        lock.release()?;

        Ok(ResetReport {
            previous_phase,
            torn_down,
            lock_overridden,
            state_removed,
        })
    }
}
