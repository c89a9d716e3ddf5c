//! Service unit provisioner
//!
//! Services start with a minimal search path, not the operator's shell `PATH`.
//! The unit is first rendered with the base search path. If the started service
//! exits with status 127 the unit is re-rendered with the directories of every
//! required binary appended, and the start is retried exactly once.

use lecapacite::{PathResolver, ServiceManager, UnitDescriptor, EXIT_COMMAND_NOT_FOUND};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::failure::ErrorKind;
use crate::provisioner::{ProvisionError, Provisioner, TeardownOptions, Verification};

/// Desired service shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service name without the `.service` suffix
    pub name: String,
    /// Human description
    pub description: String,
    /// Command line; the program is resolved to an absolute path
    pub exec_start: String,
    /// Working directory of the service
    pub working_dir: PathBuf,
    /// User the service runs as
    pub user: Option<String>,
    /// Environment file loaded by the service
    pub env_file: Option<PathBuf>,
    /// Executables the service needs on its search path
    pub required_binaries: Vec<String>,
}

/// Installs, enables and starts the application's service.
pub struct ServiceUnitProvisioner {
    manager: Arc<dyn ServiceManager>,
    resolver: PathResolver,
    spec: ServiceSpec,
    settle: Duration,
}

impl ServiceUnitProvisioner {
    /// Provisioner for `spec`, resolving binaries through `resolver`.
    pub fn new(manager: Arc<dyn ServiceManager>, resolver: PathResolver, spec: ServiceSpec) -> Self {
        Self {
            manager,
            resolver,
            spec,
            settle: Duration::ZERO,
        }
    }

    /// Pause between starting the service and checking whether it stayed up.
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Required binaries the resolver cannot find.
    pub fn missing_binaries(&self) -> Vec<String> {
        self.spec
            .required_binaries
            .iter()
            .filter(|binary| self.resolver.resolve(binary).is_none())
            .cloned()
            .collect()
    }

    fn exec_start(&self) -> String {
        let mut parts = self.spec.exec_start.splitn(2, char::is_whitespace);
        let program = parts.next().unwrap_or_default();
        let rest = parts.next().map(str::trim).unwrap_or_default();
        let resolved = self
            .resolver
            .resolve(program)
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| program.to_string());
        if rest.is_empty() {
            resolved
        } else {
            format!("{} {}", resolved, rest)
        }
    }

    /// Render the unit with the given search path.
    pub fn render(&self, search_path: &str) -> UnitDescriptor {
        let mut contents = String::new();
        contents.push_str("[Unit]\n");
        contents.push_str(&format!("Description={}\n", self.spec.description));
        contents.push_str("After=network.target postgresql.service\n\n");
        contents.push_str("[Service]\n");
        contents.push_str("Type=simple\n");
        if let Some(user) = &self.spec.user {
            contents.push_str(&format!("User={}\n", user));
        }
        contents.push_str(&format!("WorkingDirectory={}\n", self.spec.working_dir.display()));
        contents.push_str(&format!("Environment=\"PATH={}\"\n", search_path));
        if let Some(env_file) = &self.spec.env_file {
            contents.push_str(&format!("EnvironmentFile={}\n", env_file.display()));
        }
        contents.push_str(&format!("ExecStart={}\n", self.exec_start()));
        contents.push_str("Restart=on-failure\nRestartSec=5\n\n");
        contents.push_str("[Install]\nWantedBy=multi-user.target\n");
        UnitDescriptor {
            name: self.spec.name.clone(),
            contents,
        }
    }

    fn base_descriptor(&self) -> UnitDescriptor {
        self.render(&PathResolver::base_search_path())
    }

    fn expanded_descriptor(&self) -> UnitDescriptor {
        self.render(&self.resolver.expanded_search_path(&self.spec.required_binaries))
    }

    fn capability_error(&self, context: &str, err: lecapacite::CapabilityError) -> ProvisionError {
        ProvisionError::from_capability(self.resource(), context, err)
    }

    fn install_and_enable(&self, descriptor: &UnitDescriptor) -> Result<(), ProvisionError> {
        self.manager
            .install_unit(descriptor)
            .map_err(|err| self.capability_error("failed to install unit", err))?;
        self.manager
            .enable(&self.spec.name)
            .map_err(|err| self.capability_error("failed to enable unit", err))
    }

    /// Start and report whether the service stayed up, with its exit status if not.
    fn start_and_observe(&self) -> Result<(bool, Option<i32>), ProvisionError> {
        self.manager
            .start(&self.spec.name)
            .map_err(|err| self.capability_error("failed to start service", err))?;
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        let active = self
            .manager
            .is_active(&self.spec.name)
            .map_err(|err| self.capability_error("failed to query service", err))?;
        if active {
            return Ok((true, None));
        }
        let status = self
            .manager
            .last_exit_status(&self.spec.name)
            .map_err(|err| self.capability_error("failed to query exit status", err))?;
        Ok((false, status))
    }

    /// Start the service, widening the search path once on exit status 127.
    fn start(&self) -> Result<(), ProvisionError> {
        let (active, status) = self.start_and_observe()?;
        if active {
            return Ok(());
        }

        if status != Some(EXIT_COMMAND_NOT_FOUND) {
            return Err(ProvisionError::new(
                self.resource(),
                ErrorKind::Unclassified,
                format!(
                    "service {} did not stay running (exit status {})",
                    self.spec.name,
                    status.map_or_else(|| "unknown".to_string(), |s| s.to_string())
                ),
            ));
        }

        warn!(
            service = %self.spec.name,
            "service exited with status 127; retrying with expanded search path"
        );
        self.install_and_enable(&self.expanded_descriptor())?;

        let (active, status) = self.start_and_observe()?;
        if active {
            info!(service = %self.spec.name, "service running with expanded search path");
            return Ok(());
        }

        let missing = self.missing_binaries();
        let detail = if missing.is_empty() {
            String::new()
        } else {
            format!("; not found: {}", missing.join(", "))
        };
        Err(ProvisionError::new(
            self.resource(),
            ErrorKind::MissingDependency,
            format!(
                "service {} still fails to start with expanded search path (exit status {}){}",
                self.spec.name,
                status.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
                detail
            ),
        ))
    }

    /// Whether `live` is one of the descriptors this provisioner renders.
    fn is_rendered(&self, live: &str) -> bool {
        let live_digest = blake3::hash(live.as_bytes());
        [self.base_descriptor(), self.expanded_descriptor()]
            .iter()
            .any(|descriptor| blake3::hash(descriptor.contents.as_bytes()) == live_digest)
    }

    fn query<T>(
        &self,
        context: &str,
        op: impl FnOnce() -> lecapacite::Result<T>,
    ) -> Result<T, ProvisionError> {
        op().map_err(|err| self.capability_error(context, err))
    }
}

impl Provisioner for ServiceUnitProvisioner {
    fn resource(&self) -> String {
        format!("service:{}", self.spec.name)
    }

    fn check_existing(&self) -> Result<bool, ProvisionError> {
        let exists = self.query("failed to query unit", || self.manager.unit_exists(&self.spec.name))?;
        if !exists {
            return Ok(false);
        }
        self.query("failed to query unit", || self.manager.is_enabled(&self.spec.name))
    }

    fn create(&self) -> Result<(), ProvisionError> {
        self.install_and_enable(&self.base_descriptor())?;
        self.start()
    }

    fn reconcile(&self) -> Result<(), ProvisionError> {
        let name = &self.spec.name;
        let live = self.query("failed to read unit", || self.manager.read_unit(name))?;
        if !live.as_deref().is_some_and(|contents| self.is_rendered(contents)) {
            info!(service = %name, "unit differs from the rendered descriptor; reinstalling");
            self.install_and_enable(&self.base_descriptor())?;
            self.query("failed to stop service", || self.manager.stop(name))?;
            return self.start();
        }

        let active = self.query("failed to query service", || self.manager.is_active(&self.spec.name))?;
        if active {
            debug!(service = %self.spec.name, "service already running");
            return Ok(());
        }
        info!(service = %self.spec.name, "service installed but not running; starting");
        self.start()
    }

    fn verify(&self) -> Result<Verification, ProvisionError> {
        let mut verification = Verification::default();
        let name = &self.spec.name;

        let Some(live) = self.query("failed to read unit", || self.manager.read_unit(name))? else {
            verification.problem(format!("unit {} is not installed", name));
            return Ok(verification);
        };
        if !self.query("failed to query unit", || self.manager.is_enabled(name))? {
            verification.problem(format!("unit {} is not enabled", name));
        }
        if !self.query("failed to query service", || self.manager.is_active(name))? {
            verification.problem(format!("service {} is not running", name));
        }

        if !self.is_rendered(&live) {
            verification.warning(format!(
                "unit {} differs from the rendered descriptor (digest {})",
                name,
                &blake3::hash(live.as_bytes()).to_hex()[..16]
            ));
        }
        Ok(verification)
    }

    fn remediation_hint(&self) -> String {
        format!(
            "inspect `journalctl -u {}` and re-run `ledeploy install --reconfigure` to reinstall the unit",
            self.spec.name
        )
    }

    fn teardown(&self, _options: &TeardownOptions) -> Result<(), ProvisionError> {
        let name = &self.spec.name;
        if !self.query("failed to query unit", || self.manager.unit_exists(name))? {
            return Ok(());
        }
        self.query("failed to stop service", || self.manager.stop(name))?;
        self.query("failed to disable unit", || self.manager.disable(name))?;
        self.query("failed to remove unit", || self.manager.remove_unit(name))?;
        info!(service = %name, "removed service unit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lecapacite::memory::MemoryServices;
    use tempfile::{tempdir, TempDir};

    fn spec(binaries: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: "shop".to_string(),
            description: "Shop web application".to_string(),
            exec_start: "node dist/server.js".to_string(),
            working_dir: PathBuf::from("/srv/shop"),
            user: Some("shop".to_string()),
            env_file: Some(PathBuf::from("/srv/shop/.env")),
            required_binaries: binaries.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[cfg(unix)]
    fn tool_dir(binaries: &[&str]) -> TempDir {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().expect("tempdir");
        for binary in binaries {
            let path = dir.path().join(binary);
            std::fs::write(&path, "#!/bin/sh\n").expect("write");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        }
        dir
    }

    #[test]
    fn test_render_uses_base_path_and_env_file() {
        let provisioner = ServiceUnitProvisioner::new(
            Arc::new(MemoryServices::new()),
            PathResolver::default(),
            spec(&[]),
        );
        let unit = provisioner.render(&PathResolver::base_search_path());
        assert!(unit
            .contents
            .contains("Environment=\"PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\""));
        assert!(unit.contents.contains("EnvironmentFile=/srv/shop/.env"));
        assert!(unit.contents.contains("User=shop"));
        assert!(unit.contents.contains("ExecStart=node dist/server.js"));
    }

    #[cfg(unix)]
    #[test]
    fn test_status_127_retries_once_with_expanded_path() {
        let tools = tool_dir(&["node"]);
        let services = Arc::new(MemoryServices::new());
        services.require_path_entry(&tools.path().display().to_string());
        let provisioner = ServiceUnitProvisioner::new(
            services.clone(),
            PathResolver::with_dirs([tools.path()]),
            spec(&["node"]),
        );

        let result = provisioner.ensure().expect("ensure");
        assert!(result.verified);
        assert_eq!(services.start_calls(), 2);
        assert_eq!(services.install_calls(), 2);

        let unit = services.unit("shop").expect("unit");
        assert!(unit.contents.contains(&tools.path().display().to_string()));
        assert!(unit
            .contents
            .contains(&format!("ExecStart={}/node dist/server.js", tools.path().display())));
    }

    #[test]
    fn test_second_127_is_terminal_missing_dependency() {
        let services = Arc::new(MemoryServices::new());
        services.require_path_entry("/opt/nowhere/bin");
        let provisioner =
            ServiceUnitProvisioner::new(services.clone(), PathResolver::default(), spec(&["node"]));

        let err = provisioner.ensure().expect_err("binary never found");
        assert_eq!(err.kind, ErrorKind::MissingDependency);
        assert!(err.message.contains("not found: node"));
        assert_eq!(services.start_calls(), 2);
    }

    #[test]
    fn test_running_service_is_left_alone() {
        let services = Arc::new(MemoryServices::new());
        let provisioner =
            ServiceUnitProvisioner::new(services.clone(), PathResolver::default(), spec(&[]));
        provisioner.ensure().expect("first");

        let second = provisioner.ensure().expect("second");
        assert!(second.already_present);
        assert!(second.verified);
        assert_eq!(services.install_calls(), 1);
        assert_eq!(services.start_calls(), 1);
    }

    #[test]
    fn test_stopped_service_is_restarted() {
        let services = Arc::new(MemoryServices::new());
        let provisioner =
            ServiceUnitProvisioner::new(services.clone(), PathResolver::default(), spec(&[]));
        provisioner.ensure().expect("first");
        services.kill("shop");

        let second = provisioner.ensure().expect("second");
        assert!(second.verified);
        assert_eq!(services.start_calls(), 2);
    }

    #[test]
    fn test_edited_unit_is_reported_as_drift() {
        let services = Arc::new(MemoryServices::new());
        let provisioner =
            ServiceUnitProvisioner::new(services.clone(), PathResolver::default(), spec(&[]));
        provisioner.ensure().expect("ensure");

        let mut unit = provisioner.render(&PathResolver::base_search_path());
        unit.contents.push_str("# local edit\n");
        services.install_unit(&unit).expect("edit");

        let verification = provisioner.verify().expect("verify");
        assert!(verification.is_verified());
        assert_eq!(verification.warnings.len(), 1);
        assert!(verification.warnings[0].contains("differs"));
    }

    #[test]
    fn test_changed_exec_start_reinstalls_and_restarts() {
        let services = Arc::new(MemoryServices::new());
        let mut old = spec(&[]);
        old.exec_start = "/usr/bin/node old.js".to_string();
        ServiceUnitProvisioner::new(services.clone(), PathResolver::default(), old)
            .ensure()
            .expect("old unit");

        let mut new = spec(&[]);
        new.exec_start = "/usr/bin/node new.js".to_string();
        let provisioner = ServiceUnitProvisioner::new(services.clone(), PathResolver::default(), new);
        let result = provisioner.ensure().expect("new unit");

        assert!(result.already_present);
        assert!(result.verified);
        assert!(result.verification.warnings.is_empty(), "{:?}", result.verification.warnings);
        let unit = services.unit("shop").expect("unit");
        assert!(unit.contents.contains("ExecStart=/usr/bin/node new.js"));
        assert_eq!(services.install_calls(), 2);
        assert_eq!(services.start_calls(), 2);
    }

    #[test]
    fn test_deleted_unit_fails_verification() {
        let services = Arc::new(MemoryServices::new());
        let provisioner =
            ServiceUnitProvisioner::new(services.clone(), PathResolver::default(), spec(&[]));
        provisioner.ensure().expect("ensure");
        services.delete_unit_externally("shop");

        let verification = provisioner.verify().expect("verify");
        assert_eq!(verification.problems.len(), 1);
    }

    #[test]
    fn test_teardown_removes_unit() {
        let services = Arc::new(MemoryServices::new());
        let provisioner =
            ServiceUnitProvisioner::new(services.clone(), PathResolver::default(), spec(&[]));
        provisioner.ensure().expect("ensure");

        provisioner.teardown(&TeardownOptions::default()).expect("teardown");
        assert!(services.unit("shop").is_none());
        provisioner.teardown(&TeardownOptions::default()).expect("idempotent");
    }
}
