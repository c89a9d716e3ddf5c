//! Remediation registry
//!
//! Maps a [`FailureCategory`] to the corrective action applied before the next
//! attempt. Every action checks the condition before acting, so applying it when
//! the failure has already cleared is harmless.

use lecapacite::{PackageInstaller, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::failure::FailureCategory;

/// Named corrective actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationKind {
    /// Release the package-manager lock
    ClearLock,
    /// Refresh the index and install prerequisite packages
    InstallPackage,
    /// Reinstall the language runtime
    ReinstallRuntime,
    /// Give the resource time to come back
    WaitAndRetry,
}

impl fmt::Display for RemediationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClearLock => "clear-lock",
            Self::InstallPackage => "install-package",
            Self::ReinstallRuntime => "reinstall-runtime",
            Self::WaitAndRetry => "wait-and-retry",
        })
    }
}

/// A corrective action applied between attempts.
pub trait RemediationAction: Send + Sync {
    /// Which named action this is.
    fn kind(&self) -> RemediationKind;

    /// Apply the action. Must be safe when the condition has already cleared.
    fn apply(&self) -> Result<()>;
}

/// Releases a held package-manager lock.
pub struct ClearPackageLock {
    installer: Arc<dyn PackageInstaller>,
}

impl ClearPackageLock {
    /// Action over `installer`.
    pub fn new(installer: Arc<dyn PackageInstaller>) -> Self {
        Self { installer }
    }
}

impl RemediationAction for ClearPackageLock {
    fn kind(&self) -> RemediationKind {
        RemediationKind::ClearLock
    }

    fn apply(&self) -> Result<()> {
        if !self.installer.is_locked()? {
            debug!("package-manager lock already released");
            return Ok(());
        }
        info!("forcing release of package-manager lock");
        self.installer.force_release_lock()
    }
}

/// Refreshes the package index and installs any missing prerequisites.
pub struct InstallPackages {
    installer: Arc<dyn PackageInstaller>,
    packages: Vec<String>,
}

impl InstallPackages {
    /// Action installing `packages` through `installer`.
    pub fn new(installer: Arc<dyn PackageInstaller>, packages: Vec<String>) -> Self {
        Self {
            installer,
            packages,
        }
    }
}

impl RemediationAction for InstallPackages {
    fn kind(&self) -> RemediationKind {
        RemediationKind::InstallPackage
    }

    fn apply(&self) -> Result<()> {
        self.installer.refresh_index()?;
        let mut missing = Vec::new();
        for package in &self.packages {
            if !self.installer.is_installed(package)? {
                missing.push(package.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        info!(packages = ?missing, "installing prerequisite packages");
        self.installer.install_or_upgrade(&missing)
    }
}

/// Reinstalls the runtime packages that provide the application's toolchain.
pub struct ReinstallRuntime {
    installer: Arc<dyn PackageInstaller>,
    packages: Vec<String>,
}

impl ReinstallRuntime {
    /// Action reinstalling `packages` through `installer`.
    pub fn new(installer: Arc<dyn PackageInstaller>, packages: Vec<String>) -> Self {
        Self {
            installer,
            packages,
        }
    }
}

impl RemediationAction for ReinstallRuntime {
    fn kind(&self) -> RemediationKind {
        RemediationKind::ReinstallRuntime
    }

    fn apply(&self) -> Result<()> {
        if self.packages.is_empty() {
            debug!("no runtime packages configured");
            return Ok(());
        }
        info!(packages = ?self.packages, "reinstalling runtime");
        self.installer.install_or_upgrade(&self.packages)
    }
}

/// Waits before the next attempt.
pub struct WaitAndRetry {
    delay: Duration,
}

impl WaitAndRetry {
    /// Action sleeping for `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RemediationAction for WaitAndRetry {
    fn kind(&self) -> RemediationKind {
        RemediationKind::WaitAndRetry
    }

    fn apply(&self) -> Result<()> {
        if !self.delay.is_zero() {
            debug!(delay_ms = self.delay.as_millis() as u64, "waiting before retry");
            std::thread::sleep(self.delay);
        }
        Ok(())
    }
}

/// Read-only table from failure category to corrective action.
#[derive(Default)]
pub struct RemediationRegistry {
    actions: HashMap<FailureCategory, Box<dyn RemediationAction>>,
}

impl RemediationRegistry {
    /// Empty registry; every failure is terminal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the action for a category, replacing any previous one.
    pub fn register(
        mut self,
        category: FailureCategory,
        action: impl RemediationAction + 'static,
    ) -> Self {
        self.actions.insert(category, Box::new(action));
        self
    }

    /// The standard table: clear-lock, install-package, reinstall-runtime, wait-and-retry.
    pub fn standard(
        installer: Arc<dyn PackageInstaller>,
        prerequisites: Vec<String>,
        runtime: Vec<String>,
        database_wait: Duration,
    ) -> Self {
        Self::new()
            .register(
                FailureCategory::LockHeld,
                ClearPackageLock::new(Arc::clone(&installer)),
            )
            .register(
                FailureCategory::PackageMissing,
                InstallPackages::new(Arc::clone(&installer), prerequisites),
            )
            .register(
                FailureCategory::BinaryMissing,
                ReinstallRuntime::new(installer, runtime),
            )
            .register(
                FailureCategory::DatabaseUnreachable,
                WaitAndRetry::new(database_wait),
            )
    }

    /// The action registered for `category`.
    pub fn lookup(&self, category: FailureCategory) -> Option<&dyn RemediationAction> {
        self.actions.get(&category).map(|action| action.as_ref())
    }

    /// Whether any action is registered for `category`.
    pub fn handles(&self, category: FailureCategory) -> bool {
        self.actions.contains_key(&category)
    }
}

impl fmt::Debug for RemediationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self
            .actions
            .iter()
            .map(|(category, action)| (*category, action.kind()))
            .collect();
        entries.sort_by_key(|(category, _)| *category);
        f.debug_map().entries(entries).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lecapacite::memory::MemoryPackages;

    #[test]
    fn test_standard_registry_covers_every_category() {
        let installer: Arc<dyn PackageInstaller> = Arc::new(MemoryPackages::new());
        let registry =
            RemediationRegistry::standard(installer, Vec::new(), Vec::new(), Duration::ZERO);

        for category in FailureCategory::ALL {
            assert!(registry.handles(category), "missing action for {}", category);
        }
        assert_eq!(
            registry.lookup(FailureCategory::LockHeld).map(|a| a.kind()),
            Some(RemediationKind::ClearLock)
        );
        assert_eq!(
            registry.lookup(FailureCategory::DatabaseUnreachable).map(|a| a.kind()),
            Some(RemediationKind::WaitAndRetry)
        );
    }

    #[test]
    fn test_clear_lock_skips_when_not_locked() {
        let packages = Arc::new(MemoryPackages::new());
        let action = ClearPackageLock::new(packages.clone());

        action.apply().expect("apply");
        assert_eq!(packages.release_calls(), 0);

        packages.set_locked(true);
        action.apply().expect("apply");
        assert_eq!(packages.release_calls(), 1);
        assert!(!packages.is_locked().expect("lock"));
    }

    #[test]
    fn test_install_packages_only_installs_missing() {
        let packages = Arc::new(MemoryPackages::new().with_installed(["curl"]));
        let action = InstallPackages::new(
            packages.clone(),
            vec!["curl".to_string(), "ca-certificates".to_string()],
        );

        action.apply().expect("apply");
        assert_eq!(packages.refresh_calls(), 1);
        assert_eq!(packages.install_calls(), 1);

        action.apply().expect("apply again");
        assert_eq!(packages.install_calls(), 1);
    }

    #[test]
    fn test_empty_registry_has_no_actions() {
        let registry = RemediationRegistry::new();
        assert!(registry.lookup(FailureCategory::BinaryMissing).is_none());
    }
}
