use leprovision::Provisioner;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{PhaseError, RunError};
use crate::Phase;

use super::{
    model::{PhaseSummary, ResourceSummary, RunOutcome, RunReport, RunRequest},
    state::InstallState,
};

/// Provisioners that must all verify before `target` is committed.
#[derive(Clone)]
pub struct PhasePlan {
    /// Phase committed when every provisioner verifies.
    pub target: Phase,
    /// Provisioners, applied in order.
    pub provisioners: Vec<Arc<dyn Provisioner>>,
}

impl PhasePlan {
    /// Empty plan for `target`.
    pub fn new(target: Phase) -> Self {
        Self {
            target,
            provisioners: Vec::new(),
        }
    }

    /// Append a provisioner.
    pub fn with(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioners.push(provisioner);
        self
    }

    /// Resource names, in order.
    pub fn resources(&self) -> Vec<String> {
        self.provisioners.iter().map(|p| p.resource()).collect()
    }
}

impl fmt::Debug for PhasePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhasePlan")
            .field("target", &self.target)
            .field("resources", &self.resources())
            .finish()
    }
}

/// Orders provisioners into phases and commits each phase once it verifies.
#[derive(Debug, Clone)]
pub struct PhaseController {
    plans: Vec<PhasePlan>,
}

impl PhaseController {
    /// Controller over `plans`. Every phase after `NotStarted` gets a plan,
    /// empty if none was supplied; plans are kept in phase order.
    pub fn new(plans: Vec<PhasePlan>) -> Self {
        let mut ordered = Vec::new();
        for phase in Phase::ALL.into_iter().filter(|p| *p != Phase::NotStarted) {
            let mut plan = PhasePlan::new(phase);
            for supplied in plans.iter().filter(|p| p.target == phase) {
                plan.provisioners.extend(supplied.provisioners.iter().cloned());
            }
            ordered.push(plan);
        }
        Self { plans: ordered }
    }

    /// Plans in phase order.
    pub fn plans(&self) -> &[PhasePlan] {
        &self.plans
    }

    /// Ensure every provisioner in `plan`. Fails on the first error or
    /// unverified resource; never touches persisted state.
    pub fn apply(&self, plan: &PhasePlan) -> Result<PhaseSummary, PhaseError> {
        info!(phase = %plan.target, resources = plan.provisioners.len(), "applying phase");
        let mut resources = Vec::with_capacity(plan.provisioners.len());

        for provisioner in &plan.provisioners {
            let resource = provisioner.resource();
            let result = provisioner.ensure().map_err(|err| {
                error!(phase = %plan.target, resource = %resource, kind = %err.kind, "{}", err.message);
                PhaseError::from_provision(plan.target, err)
            })?;

            if !result.verified {
                error!(phase = %plan.target, resource = %resource, "resource did not verify");
                return Err(PhaseError::unverified(
                    plan.target,
                    resource,
                    &result.verification.problems,
                ));
            }

            resources.push(ResourceSummary {
                resource,
                already_present: result.already_present,
                warnings: result.verification.warnings,
            });
        }

        Ok(PhaseSummary {
            phase: plan.target,
            resources,
        })
    }

    fn commit(
        &self,
        state: &mut InstallState,
        phase: Phase,
        state_path: &Path,
        project_path: &Path,
    ) -> Result<(), RunError> {
        let mut next = state.clone();
        next.commit(phase);
        if next.project_path.is_none() {
            next.project_path = Some(project_path.to_path_buf());
        }
        next.save_to_path(state_path)?;
        *state = next;
        info!(phase = %phase, state = %state_path.display(), "phase committed");
        Ok(())
    }

    /// Run the phases `state` has not committed yet, stopping after the
    /// session boundary. With `reconfigure`, re-apply every phase after the
    /// boundary on a complete installation.
    pub fn advance(
        &self,
        state: &mut InstallState,
        state_path: &Path,
        project_path: &Path,
        request: RunRequest,
    ) -> Result<RunReport, RunError> {
        let starting_phase = state.phase;
        let mut phases = Vec::new();

        if request.reconfigure {
            if starting_phase != Phase::Complete {
                return Err(RunError::ReconfigureRequiresComplete {
                    phase: starting_phase,
                });
            }
            for plan in self.plans.iter().filter(|p| p.target > Phase::DependenciesReady) {
                phases.push(self.apply(plan)?);
                self.commit(state, plan.target, state_path, project_path)?;
            }
            return Ok(RunReport {
                starting_phase,
                final_phase: state.phase,
                outcome: RunOutcome::Reconfigured,
                phases,
            });
        }

        if starting_phase == Phase::Complete {
            info!("installation already complete");
            return Ok(RunReport {
                starting_phase,
                final_phase: starting_phase,
                outcome: RunOutcome::AlreadyComplete,
                phases,
            });
        }

        for plan in self.plans.iter().filter(|p| p.target > starting_phase) {
            phases.push(self.apply(plan)?);
            self.commit(state, plan.target, state_path, project_path)?;

            if plan.target.is_session_boundary() {
                warn!(
                    phase = %plan.target,
                    "dependencies installed; open a new shell session and run `ledeploy install` again"
                );
                return Ok(RunReport {
                    starting_phase,
                    final_phase: state.phase,
                    outcome: RunOutcome::SessionBoundary,
                    phases,
                });
            }
        }

        Ok(RunReport {
            starting_phase,
            final_phase: state.phase,
            outcome: RunOutcome::Completed,
            phases,
        })
    }
}
