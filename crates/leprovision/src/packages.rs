use lecapacite::PackageInstaller;
use std::sync::Arc;

use crate::executor::RetryingExecutor;
use crate::failure::classify_package_failure;
use crate::provisioner::{ProvisionError, Provisioner, Verification};

/// Ensures a set of system packages is installed.
pub struct PackageSetProvisioner {
    installer: Arc<dyn PackageInstaller>,
    executor: Arc<RetryingExecutor>,
    packages: Vec<String>,
}

impl PackageSetProvisioner {
    /// Provisioner for `packages`.
    pub fn new(
        installer: Arc<dyn PackageInstaller>,
        executor: Arc<RetryingExecutor>,
        packages: Vec<String>,
    ) -> Self {
        Self {
            installer,
            executor,
            packages,
        }
    }

    fn missing(&self) -> Result<Vec<String>, ProvisionError> {
        let mut missing = Vec::new();
        for package in &self.packages {
            let installed = self.installer.is_installed(package).map_err(|err| {
                ProvisionError::from_capability(self.resource(), "package query failed", err)
            })?;
            if !installed {
                missing.push(package.clone());
            }
        }
        Ok(missing)
    }
}

impl Provisioner for PackageSetProvisioner {
    fn resource(&self) -> String {
        "packages".to_string()
    }

    fn check_existing(&self) -> Result<bool, ProvisionError> {
        Ok(self.missing()?.is_empty())
    }

    fn create(&self) -> Result<(), ProvisionError> {
        let missing = self.missing()?;
        if missing.is_empty() {
            return Ok(());
        }
        self.executor
            .execute(
                "package install",
                || self.installer.install_or_upgrade(&missing),
                classify_package_failure,
            )
            .map_err(|err| ProvisionError::from_execution(self.resource(), err))
    }

    fn verify(&self) -> Result<Verification, ProvisionError> {
        let mut verification = Verification::default();
        for package in self.missing()? {
            verification.problem(format!("package {} is not installed", package));
        }
        Ok(verification)
    }

    fn remediation_hint(&self) -> String {
        format!(
            "install the missing packages with `apt-get install {}` or re-run `ledeploy install`",
            self.packages.join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::ErrorKind;
    use crate::remediation::RemediationRegistry;
    use lecapacite::memory::MemoryPackages;
    use std::time::Duration;

    fn provisioner(packages: Arc<MemoryPackages>, names: &[&str]) -> PackageSetProvisioner {
        let registry = RemediationRegistry::standard(
            packages.clone(),
            Vec::new(),
            Vec::new(),
            Duration::ZERO,
        );
        let executor = RetryingExecutor::new(Arc::new(registry)).with_retry_delay(Duration::ZERO);
        PackageSetProvisioner::new(
            packages,
            Arc::new(executor),
            names.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_installs_missing_packages_once() {
        let packages = Arc::new(MemoryPackages::new().with_installed(["curl"]));
        let provisioner = provisioner(packages.clone(), &["curl", "postgresql"]);

        let first = provisioner.ensure().expect("first ensure");
        assert!(!first.already_present);
        assert!(first.verified);

        let second = provisioner.ensure().expect("second ensure");
        assert!(second.already_present);
        assert_eq!(packages.install_calls(), 1);
    }

    #[test]
    fn test_permanent_lock_exhausts_attempts() {
        let packages = Arc::new(MemoryPackages::new());
        packages.set_locked(true);
        packages.set_lock_stuck(true);
        let provisioner = provisioner(packages.clone(), &["nginx"]);

        let err = provisioner.ensure().expect_err("lock never clears");
        assert_eq!(err.kind, ErrorKind::TransientInfrastructure);
        assert_eq!(err.resource, "packages");
        assert_eq!(packages.install_calls(), 3);
        assert!(err.output.expect("tool output").contains("Could not get lock"));
    }

    #[test]
    fn test_unknown_package_is_remediated_by_index_refresh() {
        let packages = Arc::new(MemoryPackages::new());
        packages.mark_unknown("nodejs");
        let provisioner = provisioner(packages.clone(), &["nodejs"]);

        let result = provisioner.ensure().expect("recovers");
        assert!(result.verified);
        assert_eq!(packages.refresh_calls(), 1);
    }

    #[test]
    fn test_verify_lists_each_missing_package() {
        let packages = Arc::new(MemoryPackages::new());
        let provisioner = provisioner(packages, &["git", "nginx"]);
        let verification = provisioner.verify().expect("verify");
        assert_eq!(verification.problems.len(), 2);
    }
}
