use lecapacite::BuildRunner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::executor::RetryingExecutor;
use crate::failure::classify_build_failure;
use crate::provisioner::{ProvisionError, Provisioner, Verification};

/// Installs application dependencies and builds the application artifact.
pub struct ApplicationBuildProvisioner {
    runner: Arc<dyn BuildRunner>,
    executor: Arc<RetryingExecutor>,
    artifact: PathBuf,
}

impl ApplicationBuildProvisioner {
    /// Provisioner producing `artifact`.
    pub fn new(
        runner: Arc<dyn BuildRunner>,
        executor: Arc<RetryingExecutor>,
        artifact: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            executor,
            artifact: artifact.into(),
        }
    }
}

impl Provisioner for ApplicationBuildProvisioner {
    fn resource(&self) -> String {
        format!("build:{}", self.artifact.display())
    }

    fn check_existing(&self) -> Result<bool, ProvisionError> {
        Ok(self.artifact.exists())
    }

    fn create(&self) -> Result<(), ProvisionError> {
        self.executor
            .execute(
                "install dependencies",
                || self.runner.install_dependencies(),
                classify_build_failure,
            )
            .map_err(|err| ProvisionError::from_execution(self.resource(), err))?;
        self.executor
            .execute("build", || self.runner.build(), classify_build_failure)
            .map_err(|err| ProvisionError::from_execution(self.resource(), err))?;
        info!(artifact = %self.artifact.display(), "application built");
        Ok(())
    }

    fn verify(&self) -> Result<Verification, ProvisionError> {
        let mut verification = Verification::default();
        if !self.artifact.exists() {
            verification.problem(format!("build artifact {} is missing", self.artifact.display()));
        }
        Ok(verification)
    }

    fn remediation_hint(&self) -> String {
        "run the configured build command by hand to see the compiler output, then re-run `ledeploy install --reconfigure`".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::ErrorKind;
    use crate::remediation::RemediationRegistry;
    use lecapacite::memory::{MemoryBuild, MemoryPackages};
    use lecapacite::PackageInstaller;
    use std::time::Duration;
    use tempfile::tempdir;

    fn provisioner(
        build: Arc<MemoryBuild>,
        packages: Arc<MemoryPackages>,
        artifact: PathBuf,
    ) -> ApplicationBuildProvisioner {
        let registry = RemediationRegistry::standard(
            packages,
            Vec::new(),
            vec!["nodejs".to_string()],
            Duration::ZERO,
        );
        let executor = RetryingExecutor::new(Arc::new(registry)).with_retry_delay(Duration::ZERO);
        ApplicationBuildProvisioner::new(build, Arc::new(executor), artifact)
    }

    #[test]
    fn test_builds_once() {
        let dir = tempdir().expect("tempdir");
        let artifact = dir.path().join("dist");
        let build = Arc::new(MemoryBuild::new(&artifact));
        let provisioner = provisioner(build.clone(), Arc::new(MemoryPackages::new()), artifact);

        assert!(provisioner.ensure().expect("first").verified);
        assert!(provisioner.ensure().expect("second").already_present);
        assert_eq!(build.build_calls(), 1);
    }

    #[test]
    fn test_missing_runtime_is_reinstalled() {
        let dir = tempdir().expect("tempdir");
        let artifact = dir.path().join("dist");
        let build = Arc::new(MemoryBuild::new(&artifact));
        build.set_missing_runtime_for(1);
        let packages = Arc::new(MemoryPackages::new());
        let provisioner = provisioner(build.clone(), packages.clone(), artifact);

        assert!(provisioner.ensure().expect("recovers").verified);
        assert_eq!(build.install_calls(), 2);
        assert!(packages.is_installed("nodejs").expect("query"));
    }

    #[test]
    fn test_compiler_error_is_unclassified_and_not_retried() {
        let dir = tempdir().expect("tempdir");
        let artifact = dir.path().join("dist");
        let build = Arc::new(MemoryBuild::new(&artifact));
        build.set_build_broken(true);
        let provisioner = provisioner(build.clone(), Arc::new(MemoryPackages::new()), artifact);

        let err = provisioner.ensure().expect_err("broken");
        assert_eq!(err.kind, ErrorKind::Unclassified);
        assert_eq!(build.build_calls(), 1);
        assert!(err.output.expect("output").contains("Type error"));
    }
}
