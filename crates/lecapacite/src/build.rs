//! Build-runner capability

use std::path::PathBuf;
use tracing::info;

use crate::command::{CommandSpec, Result};

/// Installs application dependencies and builds the application.
pub trait BuildRunner: Send + Sync {
    /// Install the application's own dependencies.
    fn install_dependencies(&self) -> Result<()>;

    /// Build the application.
    fn build(&self) -> Result<()>;
}

/// Build runner that executes two configured commands in the project directory.
#[derive(Debug, Clone)]
pub struct CommandBuildRunner {
    /// Project directory the commands run in
    pub workdir: PathBuf,
    /// Dependency installation command, e.g. `npm ci`
    pub install: CommandSpec,
    /// Build command, e.g. `npm run build`
    pub build: CommandSpec,
    /// Explicit `PATH` handed to both commands
    pub search_path: Option<String>,
}

impl CommandBuildRunner {
    fn prepare(&self, spec: &CommandSpec) -> CommandSpec {
        let mut spec = spec.clone().current_dir(&self.workdir);
        if let Some(path) = &self.search_path {
            spec = spec.env("PATH", path.clone());
        }
        spec
    }
}

impl BuildRunner for CommandBuildRunner {
    fn install_dependencies(&self) -> Result<()> {
        info!(workdir = %self.workdir.display(), "installing application dependencies");
        self.prepare(&self.install).run()?;
        Ok(())
    }

    fn build(&self) -> Result<()> {
        info!(workdir = %self.workdir.display(), "building application");
        self.prepare(&self.build).run()?;
        Ok(())
    }
}
