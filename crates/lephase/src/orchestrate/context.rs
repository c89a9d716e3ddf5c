use std::path::{Path, PathBuf};

/// File name of the persisted installation state.
pub const STATE_FILE_NAME: &str = "state.json";

/// File name of the run lock.
pub const LOCK_FILE_NAME: &str = "run.lock";

/// Where an installation keeps its state and lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationContext {
    /// Absolute path of the managed installation.
    pub project_path: PathBuf,
    /// Directory holding the state and lock files.
    pub state_dir: PathBuf,
}

impl OrchestrationContext {
    /// Context keeping its files under `<project_path>/.ledeploy`.
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        let project_path = project_path.into();
        let state_dir = project_path.join(".ledeploy");
        Self {
            project_path,
            state_dir,
        }
    }

    /// Override the state directory.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    /// Path of the state file.
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    /// Path of the lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE_NAME)
    }

    /// Managed installation path.
    pub fn project_path(&self) -> &Path {
        &self.project_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_dir_lives_in_project() {
        let context = OrchestrationContext::new("/srv/shop");
        assert_eq!(context.state_path(), PathBuf::from("/srv/shop/.ledeploy/state.json"));
        assert_eq!(context.lock_path(), PathBuf::from("/srv/shop/.ledeploy/run.lock"));
    }

    #[test]
    fn state_dir_can_be_overridden() {
        let context = OrchestrationContext::new("/srv/shop").with_state_dir("/var/lib/ledeploy");
        assert_eq!(context.state_path(), PathBuf::from("/var/lib/ledeploy/state.json"));
    }
}
