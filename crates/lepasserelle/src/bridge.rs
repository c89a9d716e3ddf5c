// Configuration bridge
//
// *La Passerelle* (The Bridge) - Turns a `DeployConfig` into system capabilities,
// provisioners, phase plans, a run coordinator and a diagnostics reporter.

use lecapacite::{
    AptInstaller, BuildRunner, CommandBuildRunner, DatabaseAdmin, PackageInstaller, PathResolver,
    PsqlAdmin, ServiceManager, SystemdManager,
};
use lephase::{
    DiagnosticsReporter, OrchestrationContext, Phase, PhaseController, PhasePlan, PortCheck,
    ProcessProbe, RunCoordinator,
};
use leprovision::{
    ApplicationBuildProvisioner, DatabaseProvisioner, DatabaseSpec, EnvFileProvisioner,
    EnvFileSpec, PackageSetProvisioner, RemediationRegistry, RetryingExecutor, ServiceSpec,
    ServiceUnitProvisioner,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::DeployConfig;
use crate::errors::{DeployError, Result};
use crate::liveness::PsutilProbe;

/// The four external capabilities plus the binary resolver.
pub struct Capabilities {
    /// Package installer
    pub packages: Arc<dyn PackageInstaller>,
    /// Database administrator
    pub database: Arc<dyn DatabaseAdmin>,
    /// Build runner
    pub build: Arc<dyn BuildRunner>,
    /// Service manager
    pub services: Arc<dyn ServiceManager>,
    /// Executable resolver used for service descriptors and diagnostics
    pub resolver: PathResolver,
}

impl Capabilities {
    /// Process-backed capabilities: `apt-get`, `psql`, the configured build
    /// commands and `systemctl`.
    pub fn system(config: &DeployConfig) -> Result<Self> {
        let resolver = PathResolver::system();

        let install = config.build.install_command().ok_or_else(|| {
            DeployError::config_error("build.install does not name a command", None)
        })?;
        let build = config.build.build_command().ok_or_else(|| {
            DeployError::config_error("build.build does not name a command", None)
        })?;

        let database_prefix = if config.database.admin_user.is_empty() {
            Vec::new()
        } else {
            vec!["sudo".to_string(), "-u".to_string(), config.database.admin_user.clone()]
        };

        Ok(Self {
            packages: Arc::new(AptInstaller::with_prefix(sudo_prefix(config.packages.sudo))),
            database: Arc::new(PsqlAdmin {
                prefix: database_prefix,
                host: config.database.host.clone(),
                port: config.database.port,
            }),
            build: Arc::new(CommandBuildRunner {
                workdir: config.project_path().to_path_buf(),
                install,
                build,
                search_path: Some(resolver.expanded_search_path(&config.service.required_binaries)),
            }),
            services: Arc::new(SystemdManager {
                unit_dir: config.service.unit_dir.clone(),
                prefix: sudo_prefix(config.service.sudo),
            }),
            resolver,
        })
    }
}

fn sudo_prefix(enabled: bool) -> Vec<String> {
    if enabled {
        vec!["sudo".to_string()]
    } else {
        Vec::new()
    }
}

/// A configured deployment: everything `install`, `status` and `reset` need.
pub struct Deployment {
    config: DeployConfig,
    capabilities: Capabilities,
    probe: Arc<dyn ProcessProbe>,
}

impl Deployment {
    /// Deployment of `config` over `capabilities`.
    pub fn new(config: DeployConfig, capabilities: Capabilities) -> Self {
        Self {
            config,
            capabilities,
            probe: Arc::new(PsutilProbe),
        }
    }

    /// Replace the probe used to tell stale locks from live ones.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// State and lock locations.
    pub fn context(&self) -> OrchestrationContext {
        OrchestrationContext::new(self.config.project_path()).with_state_dir(self.config.state_dir())
    }

    /// Failure category to remediation table.
    pub fn registry(&self) -> RemediationRegistry {
        RemediationRegistry::standard(
            Arc::clone(&self.capabilities.packages),
            self.config.packages.prerequisites.clone(),
            self.config.packages.runtime.clone(),
            self.config.executor.database_wait(),
        )
    }

    /// Executor with the configured retry policy and the standard remediations.
    pub fn executor(&self) -> Arc<RetryingExecutor> {
        Arc::new(
            RetryingExecutor::new(Arc::new(self.registry()))
                .with_max_attempts(self.config.executor.max_attempts)
                .with_retry_delay(self.config.executor.retry_delay()),
        )
    }

    // Verification only: one attempt, no remediation actions.
    fn verify_executor(&self) -> Arc<RetryingExecutor> {
        Arc::new(
            RetryingExecutor::new(Arc::new(RemediationRegistry::new()))
                .with_max_attempts(1)
                .with_retry_delay(Duration::ZERO),
        )
    }

    /// Desired database shape.
    pub fn database_spec(&self) -> DatabaseSpec {
        DatabaseSpec {
            name: self.config.database.name.clone(),
            role: self.config.database.role.clone(),
            password: self.config.database.password.clone(),
        }
    }

    /// Desired environment file.
    pub fn env_file_spec(&self) -> EnvFileSpec {
        EnvFileSpec {
            path: self.config.env_file.output.clone(),
            template: self.config.env_file.template.clone(),
            values: self.config.env_values(),
            required: self.config.env_file.required.clone(),
        }
    }

    /// Desired service unit.
    pub fn service_spec(&self) -> ServiceSpec {
        let description = if self.config.service.description.is_empty() {
            format!("{} (managed by ledeploy)", self.config.app.name)
        } else {
            self.config.service.description.clone()
        };
        ServiceSpec {
            name: self.config.service_name().to_string(),
            description,
            exec_start: self.config.service.exec_start.clone(),
            working_dir: self.config.project_path().to_path_buf(),
            user: self.config.service.user.clone(),
            env_file: Some(self.config.env_file.output.clone()),
            required_binaries: self.config.service.required_binaries.clone(),
        }
    }

    /// Phase plans: packages; database, environment file and build; service.
    pub fn plans(&self, executor: Arc<RetryingExecutor>) -> Vec<PhasePlan> {
        let caps = &self.capabilities;

        let packages = PackageSetProvisioner::new(
            Arc::clone(&caps.packages),
            Arc::clone(&executor),
            self.config.packages.names.clone(),
        );
        let database = DatabaseProvisioner::new(
            Arc::clone(&caps.database),
            Arc::clone(&executor),
            self.database_spec(),
        );
        let env_file = EnvFileProvisioner::new(self.env_file_spec());
        let build = ApplicationBuildProvisioner::new(
            Arc::clone(&caps.build),
            executor,
            self.config.build.artifact.clone(),
        );
        let service = ServiceUnitProvisioner::new(
            Arc::clone(&caps.services),
            caps.resolver.clone(),
            self.service_spec(),
        )
        .with_settle_time(Duration::from_secs(self.config.service.settle_secs));

        let plans = vec![
            PhasePlan::new(Phase::DependenciesReady).with(Arc::new(packages)),
            PhasePlan::new(Phase::ResourcesProvisioned)
                .with(Arc::new(database))
                .with(Arc::new(env_file))
                .with(Arc::new(build)),
            PhasePlan::new(Phase::Complete).with(Arc::new(service)),
        ];
        for plan in &plans {
            debug!(phase = %plan.target, resources = ?plan.resources(), "phase plan");
        }
        plans
    }

    /// Coordinator for `install` and `reset`.
    pub fn coordinator(&self) -> RunCoordinator {
        RunCoordinator::new(self.context(), PhaseController::new(self.plans(self.executor())))
            .with_probe(Arc::clone(&self.probe))
    }

    /// Reporter for `status`; verification only, no remediation.
    pub fn reporter(&self) -> DiagnosticsReporter {
        let mut reporter = DiagnosticsReporter::new(self.context(), self.plans(self.verify_executor()))
            .with_required_binaries(
                self.capabilities.resolver.clone(),
                self.config.service.required_binaries.clone(),
            )
            .with_probe(Arc::clone(&self.probe));
        if let Some(port) = self.config.service.port {
            reporter = reporter.with_port_check(PortCheck::new(self.config.service.host.clone(), port));
        }
        reporter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_CONFIG_FILE, DEFAULT_TEMPLATE};
    use lecapacite::memory::{MemoryBuild, MemoryDatabase, MemoryPackages, MemoryServices};
    use tempfile::{tempdir, TempDir};

    fn deployment(dir: &TempDir) -> Deployment {
        let mut config =
            DeployConfig::parse(DEFAULT_TEMPLATE, &dir.path().join(DEFAULT_CONFIG_FILE), dir.path())
                .expect("parse");
        config.database.password = Some("pw".to_string());
        let capabilities = Capabilities {
            packages: Arc::new(MemoryPackages::new()),
            database: Arc::new(MemoryDatabase::new()),
            build: Arc::new(MemoryBuild::new(config.build.artifact.clone())),
            services: Arc::new(MemoryServices::new()),
            resolver: PathResolver::default(),
        };
        Deployment::new(config, capabilities)
    }

    #[test]
    fn test_plans_follow_phase_order() {
        let dir = tempdir().expect("tempdir");
        let deployment = deployment(&dir);
        let plans = deployment.plans(deployment.executor());

        let layout: Vec<(Phase, Vec<String>)> = plans
            .iter()
            .map(|plan| (plan.target, plan.resources()))
            .collect();
        let env_path = dir.path().join(".env");
        let artifact = dir.path().join("dist");
        assert_eq!(
            layout,
            vec![
                (Phase::DependenciesReady, vec!["packages".to_string()]),
                (
                    Phase::ResourcesProvisioned,
                    vec![
                        "database:shop".to_string(),
                        format!("env-file:{}", env_path.display()),
                        format!("build:{}", artifact.display()),
                    ]
                ),
                (Phase::Complete, vec!["service:shop".to_string()]),
            ]
        );
    }

    #[test]
    fn test_context_uses_configured_state_dir() {
        let dir = tempdir().expect("tempdir");
        let deployment = deployment(&dir);
        let context = deployment.context();
        assert_eq!(context.state_path(), dir.path().join(".ledeploy/state.json"));
        assert_eq!(context.lock_path(), dir.path().join(".ledeploy/run.lock"));
    }

    #[test]
    fn test_specs_carry_configuration() {
        let dir = tempdir().expect("tempdir");
        let deployment = deployment(&dir);

        let env = deployment.env_file_spec();
        assert!(env.values["DATABASE_URL"].starts_with("postgres://shop_app:pw@"));
        assert_eq!(env.required.len(), 2);

        let service = deployment.service_spec();
        assert_eq!(service.name, "shop");
        assert_eq!(service.working_dir, dir.path());
        assert_eq!(service.env_file, Some(dir.path().join(".env")));

        assert_eq!(deployment.database_spec().role, "shop_app");
        assert_eq!(deployment.executor().max_attempts(), 3);
    }

    #[test]
    fn test_registry_handles_every_category() {
        let dir = tempdir().expect("tempdir");
        let registry = deployment(&dir).registry();
        for category in leprovision::FailureCategory::ALL {
            assert!(registry.handles(category), "{:?} has no remediation", category);
        }
    }
}
