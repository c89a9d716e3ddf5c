// Error Handling
//
// *La Gestion des Erreurs* (The Error Management) - CLI error types, operator
// suggestions and process exit codes

use lephase::RunError;
use leprovision::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for ledeploy operations
pub type Result<T> = std::result::Result<T, DeployError>;

/// Exit status for a successful command
pub const EXIT_OK: i32 = 0;

/// Exit status for a terminal failure
pub const EXIT_FAILURE: i32 = 1;

/// Exit status when another run holds the installation
pub const EXIT_CONFLICT: i32 = 2;

/// Exit status after an operator interrupt
pub const EXIT_INTERRUPTED: i32 = 130;

/// ledeploy error types
#[derive(Debug, Error)]
pub enum DeployError {
    /// The configuration file does not exist
    #[error("configuration file not found: {}", .path.display())]
    ConfigMissing {
        /// Expected location
        path: PathBuf,
    },

    /// The configuration file is not valid TOML for [`crate::DeployConfig`]
    #[error("failed to parse {}: {source}", .path.display())]
    ConfigParse {
        /// Configuration file
        path: PathBuf,
        /// Parser error
        #[source]
        source: toml::de::Error,
    },

    /// A configuration value is missing or malformed
    #[error("configuration error: {message}")]
    Config {
        /// What is wrong
        message: String,
        /// How to fix it
        suggestion: Option<String>,
    },

    /// I/O errors with context
    #[error("I/O error: {context} ({})", .path.display())]
    Io {
        /// Operation that failed
        context: String,
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// `init` would overwrite an existing configuration
    #[error("{} already exists", .path.display())]
    AlreadyInitialized {
        /// Existing configuration file
        path: PathBuf,
    },

    /// The operator declined a confirmation prompt
    #[error("aborted: {0}")]
    Aborted(String),

    /// A coordinated run failed
    #[error(transparent)]
    Run(#[from] RunError),

    /// A blocking task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(String),
}

impl DeployError {
    /// Create a config error
    pub fn config_error(message: impl Into<String>, suggestion: Option<String>) -> Self {
        DeployError::Config {
            message: message.into(),
            suggestion,
        }
    }

    /// Create an I/O error with context
    pub fn io_error(context: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeployError::Io {
            context: context.into(),
            path: path.into(),
            source,
        }
    }

    /// Error class, where one applies
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Run(err) => err.kind(),
            DeployError::ConfigMissing { .. }
            | DeployError::ConfigParse { .. }
            | DeployError::Config { .. }
            | DeployError::AlreadyInitialized { .. } => ErrorKind::ConfigurationInvalid,
            DeployError::Io { .. } | DeployError::Aborted(_) | DeployError::Task(_) => {
                ErrorKind::Unclassified
            }
        }
    }

    /// Process exit status for this failure
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::ResourceConflict => EXIT_CONFLICT,
            _ => EXIT_FAILURE,
        }
    }

    /// Output of the tool that failed, if any
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            DeployError::Run(RunError::Phase(err)) => err.output.as_deref(),
            _ => None,
        }
    }

    /// Get user-friendly suggestion for recovery
    pub fn suggestion(&self) -> Option<String> {
        match self {
            DeployError::ConfigMissing { path } => Some(format!(
                "Run `ledeploy init --config {}` to write a starting configuration.",
                path.display()
            )),
            DeployError::ConfigParse { .. } => {
                Some("Fix the TOML syntax; `ledeploy init` shows every supported key.".to_string())
            }
            DeployError::Config { suggestion, .. } => suggestion.clone(),
            DeployError::AlreadyInitialized { .. } => {
                Some("Pass --force to overwrite it.".to_string())
            }
            DeployError::Aborted(_) => Some("Pass --yes to skip the prompt.".to_string()),
            DeployError::Run(err) => run_suggestion(err),
            DeployError::Io { .. } | DeployError::Task(_) => None,
        }
    }
}

fn run_suggestion(err: &RunError) -> Option<String> {
    match err {
        RunError::Conflict { path, holder } => Some(match holder {
            Some(record) => format!(
                "Wait for the run with pid {} to finish. If that process is gone, delete {}; \
                 committed phases are kept.",
                record.pid,
                path.display()
            ),
            None => format!(
                "Wait for the other run to finish, or delete {} once no install is running.",
                path.display()
            ),
        }),
        RunError::ProjectPathChanged { .. } => Some(
            "Point app.project_path back at the installed project, or run `ledeploy reset` first."
                .to_string(),
        ),
        RunError::ReconfigureRequiresComplete { .. } => {
            Some("Run `ledeploy install` until the installation is complete.".to_string())
        }
        RunError::Phase(phase) => Some(match phase.kind {
            ErrorKind::TransientInfrastructure => {
                "The failure persisted through every retry. Check the package manager and \
                 database server, then run `ledeploy install` again."
                    .to_string()
            }
            ErrorKind::MissingDependency => {
                "Install the missing program, open a new shell and run `ledeploy install` again."
                    .to_string()
            }
            ErrorKind::ConfigurationInvalid => {
                "Correct the value in ledeploy.toml and run `ledeploy install` again.".to_string()
            }
            ErrorKind::ResourceConflict | ErrorKind::Unclassified => {
                "Inspect the tool output above; the installation stays at its last committed phase."
                    .to_string()
            }
        }),
        RunError::State(_) => Some(
            "The state file is unreadable. `ledeploy reset` clears it; resources are re-checked on the next install."
                .to_string(),
        ),
        RunError::Lock(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lephase::{LockRecord, Phase, PhaseError};

    #[test]
    fn test_conflict_exits_with_conflict_code() {
        let err = DeployError::from(RunError::Conflict {
            path: PathBuf::from("/srv/shop/.ledeploy/run.lock"),
            holder: Some(LockRecord::current()),
        });
        assert_eq!(err.kind(), ErrorKind::ResourceConflict);
        assert_eq!(err.exit_code(), EXIT_CONFLICT);
        let suggestion = err.suggestion().expect("suggestion");
        assert!(suggestion.contains("pid"));
        assert!(suggestion.contains("delete /srv/shop/.ledeploy/run.lock"));
        assert!(!suggestion.contains("reset"));
    }

    #[test]
    fn test_phase_failure_carries_tool_output() {
        let err = DeployError::from(RunError::Phase(PhaseError {
            phase: Phase::DependenciesReady,
            resource: "packages".to_string(),
            kind: ErrorKind::TransientInfrastructure,
            message: "lock held".to_string(),
            output: Some("E: Could not get lock".to_string()),
        }));
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert_eq!(err.tool_output(), Some("E: Could not get lock"));
        assert!(err.to_string().contains("dependencies_ready"));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_config_errors_are_configuration_invalid() {
        let err = DeployError::config_error("database.name is empty", None);
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert!(err.suggestion().is_none());

        let missing = DeployError::ConfigMissing {
            path: PathBuf::from("ledeploy.toml"),
        };
        assert!(missing.suggestion().expect("suggestion").contains("ledeploy init"));
    }
}
