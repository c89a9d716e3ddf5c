use leprovision::{ErrorKind, ProvisionError};
use std::path::PathBuf;
use thiserror::Error;

use crate::orchestrate::lock::{LockError, LockRecord};
use crate::orchestrate::state::StateError;
use crate::Phase;

/// A phase aborted before it could be committed.
#[derive(Debug, Error)]
#[error("phase {phase} failed in {resource}: {message}")]
pub struct PhaseError {
    /// Phase being applied
    pub phase: Phase,
    /// Resource the failure occurred in
    pub resource: String,
    /// Error class
    pub kind: ErrorKind,
    /// What went wrong
    pub message: String,
    /// Output of the originating tool
    pub output: Option<String>,
}

impl PhaseError {
    /// Attribute a provisioning failure to `phase`.
    pub fn from_provision(phase: Phase, err: ProvisionError) -> Self {
        Self {
            phase,
            resource: err.resource,
            kind: err.kind,
            message: err.message,
            output: err.output,
        }
    }

    /// A resource that was ensured but did not verify.
    pub fn unverified(phase: Phase, resource: String, problems: &[String]) -> Self {
        Self {
            phase,
            resource,
            kind: ErrorKind::Unclassified,
            message: format!("verification failed: {}", problems.join("; ")),
            output: None,
        }
    }
}

/// Failure of a coordinated run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Another run holds the installation
    #[error("another ledeploy run holds {}{}", .path.display(), holder_suffix(.holder))]
    Conflict {
        /// Lock file
        path: PathBuf,
        /// Recorded holder, if the lock file was readable
        holder: Option<LockRecord>,
    },

    /// A phase failed
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// The state file could not be read or written
    #[error(transparent)]
    State(#[from] StateError),

    /// The lock file could not be created or removed
    #[error(transparent)]
    Lock(LockError),

    /// The installation was committed for a different project path
    #[error(
        "installation state belongs to {}, not {}",
        .recorded.display(),
        .requested.display()
    )]
    ProjectPathChanged {
        /// Path recorded in the state file
        recorded: PathBuf,
        /// Path of this run
        requested: PathBuf,
    },

    /// Reconfigure was requested before the installation completed
    #[error("reconfigure requires a complete installation (current phase: {phase})")]
    ReconfigureRequiresComplete {
        /// Persisted phase
        phase: Phase,
    },
}

fn holder_suffix(holder: &Option<LockRecord>) -> String {
    holder
        .as_ref()
        .map(|record| format!(" (pid {} since {})", record.pid, record.acquired_at.to_rfc3339()))
        .unwrap_or_default()
}

impl RunError {
    /// Error class of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::ResourceConflict,
            Self::Phase(err) => err.kind,
            Self::ProjectPathChanged { .. } | Self::ReconfigureRequiresComplete { .. } => {
                ErrorKind::ConfigurationInvalid
            }
            Self::State(_) | Self::Lock(_) => ErrorKind::Unclassified,
        }
    }
}

impl From<LockError> for RunError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { path, holder } => Self::Conflict { path, holder },
            other => Self::Lock(other),
        }
    }
}
