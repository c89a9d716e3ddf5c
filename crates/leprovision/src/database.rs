//! Database role and database provisioner

use lecapacite::{CapabilityError, DatabaseAdmin};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::executor::RetryingExecutor;
use crate::failure::{classify_database_failure, ErrorKind};
use crate::provisioner::{ProvisionError, Provisioner, TeardownOptions, Verification};

/// Desired database shape.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseSpec {
    /// Database name
    pub name: String,
    /// Login role owning the database
    pub role: String,
    /// Password for a newly created role; an existing role keeps its own
    pub password: Option<String>,
}

impl fmt::Debug for DatabaseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSpec")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Ensures a login role and a database it can use.
pub struct DatabaseProvisioner {
    admin: Arc<dyn DatabaseAdmin>,
    executor: Arc<RetryingExecutor>,
    spec: DatabaseSpec,
}

impl DatabaseProvisioner {
    /// Provisioner for `spec`.
    pub fn new(
        admin: Arc<dyn DatabaseAdmin>,
        executor: Arc<RetryingExecutor>,
        spec: DatabaseSpec,
    ) -> Self {
        Self {
            admin,
            executor,
            spec,
        }
    }

    fn run<T>(
        &self,
        operation: &str,
        op: impl FnMut() -> lecapacite::Result<T>,
    ) -> Result<T, ProvisionError> {
        self.executor
            .execute(operation, op, classify_database_failure)
            .map_err(|err| ProvisionError::from_execution(self.resource(), err))
    }

    fn role_exists(&self) -> Result<bool, ProvisionError> {
        self.run("role lookup", || self.admin.role_exists(&self.spec.role))
    }

    fn database_exists(&self) -> Result<bool, ProvisionError> {
        self.run("database lookup", || self.admin.database_exists(&self.spec.name))
    }

    fn has_privileges(&self) -> Result<bool, ProvisionError> {
        self.run("privilege lookup", || {
            self.admin.has_privileges(&self.spec.name, &self.spec.role)
        })
    }

    fn grant(&self) -> Result<(), ProvisionError> {
        self.run("grant privileges", || {
            self.admin.grant_privileges(&self.spec.name, &self.spec.role)
        })
    }

    fn create_role(&self) -> Result<(), ProvisionError> {
        let Some(password) = self.spec.password.as_deref() else {
            return Err(ProvisionError::new(
                self.resource(),
                ErrorKind::ConfigurationInvalid,
                format!(
                    "role {} does not exist and no password is configured for it",
                    self.spec.role
                ),
            ));
        };

        let created = self.run("create role", || {
            tolerate_existing(self.admin.create_role(&self.spec.role, password))
        })?;
        if created {
            info!(role = %self.spec.role, "created database role");
        } else {
            warn!(role = %self.spec.role, "role appeared concurrently; keeping its credential");
        }
        Ok(())
    }

    fn create_database(&self) -> Result<(), ProvisionError> {
        let created = self.run("create database", || {
            tolerate_existing(self.admin.create_database(&self.spec.name, &self.spec.role))
        })?;
        if created {
            info!(database = %self.spec.name, owner = %self.spec.role, "created database");
        }
        Ok(())
    }
}

/// `Ok(true)` when created, `Ok(false)` when the tool reported it already existed.
fn tolerate_existing(result: lecapacite::Result<()>) -> lecapacite::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(CapabilityError::Command(failure)) if failure.is_already_exists() => Ok(false),
        Err(err) => Err(err),
    }
}

impl Provisioner for DatabaseProvisioner {
    fn resource(&self) -> String {
        format!("database:{}", self.spec.name)
    }

    fn check_existing(&self) -> Result<bool, ProvisionError> {
        Ok(self.role_exists()? && self.database_exists()?)
    }

    fn create(&self) -> Result<(), ProvisionError> {
        if !self.role_exists()? {
            self.create_role()?;
        }
        if !self.database_exists()? {
            self.create_database()?;
        }
        self.grant()
    }

    fn reconcile(&self) -> Result<(), ProvisionError> {
        if !self.has_privileges()? {
            info!(database = %self.spec.name, role = %self.spec.role, "restoring privileges");
            self.grant()?;
        }
        Ok(())
    }

    fn verify(&self) -> Result<Verification, ProvisionError> {
        let mut verification = Verification::default();
        if !self.role_exists()? {
            verification.problem(format!("role {} does not exist", self.spec.role));
        }
        if !self.database_exists()? {
            verification.problem(format!("database {} does not exist", self.spec.name));
        } else if !self.has_privileges()? {
            verification.problem(format!(
                "role {} lacks privileges on database {}",
                self.spec.role, self.spec.name
            ));
        }
        Ok(verification)
    }

    fn remediation_hint(&self) -> String {
        format!(
            "check that PostgreSQL is running (`systemctl status postgresql`) and re-run `ledeploy install` to recreate role {} and database {}",
            self.spec.role, self.spec.name
        )
    }

    fn teardown(&self, options: &TeardownOptions) -> Result<(), ProvisionError> {
        if !options.drop_database {
            info!(database = %self.spec.name, "keeping database");
            return Ok(());
        }
        warn!(database = %self.spec.name, role = %self.spec.role, "dropping database and role");
        self.run("drop database", || self.admin.drop_database(&self.spec.name))?;
        self.run("drop role", || self.admin.drop_role(&self.spec.role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediation::RemediationRegistry;
    use lecapacite::memory::{MemoryDatabase, MemoryPackages};
    use std::time::Duration;

    fn spec(password: Option<&str>) -> DatabaseSpec {
        DatabaseSpec {
            name: "shop".to_string(),
            role: "shop_app".to_string(),
            password: password.map(str::to_string),
        }
    }

    fn provisioner(db: Arc<MemoryDatabase>, spec: DatabaseSpec) -> DatabaseProvisioner {
        let registry = RemediationRegistry::standard(
            Arc::new(MemoryPackages::new()),
            Vec::new(),
            Vec::new(),
            Duration::ZERO,
        );
        let executor = RetryingExecutor::new(Arc::new(registry)).with_retry_delay(Duration::ZERO);
        DatabaseProvisioner::new(db, Arc::new(executor), spec)
    }

    #[test]
    fn test_creates_role_and_database_once() {
        let db = Arc::new(MemoryDatabase::new());
        let provisioner = provisioner(db.clone(), spec(Some("s3cret")));

        let first = provisioner.ensure().expect("first");
        assert!(!first.already_present);
        assert!(first.verified);
        assert_eq!(db.owner_of("shop").as_deref(), Some("shop_app"));

        let second = provisioner.ensure().expect("second");
        assert!(second.already_present);
        assert_eq!(db.create_role_calls(), 1);
        assert_eq!(db.create_database_calls(), 1);
    }

    #[test]
    fn test_existing_role_keeps_its_password() {
        let db = Arc::new(MemoryDatabase::new().with_role("shop_app", "original"));
        let provisioner = provisioner(db.clone(), spec(Some("different")));

        provisioner.ensure().expect("ensure");
        assert_eq!(db.password_of("shop_app").as_deref(), Some("original"));
        assert_eq!(db.create_role_calls(), 0);
    }

    #[test]
    fn test_concurrent_role_creation_counts_as_success() {
        let db = Arc::new(MemoryDatabase::new());
        db.set_racing_role(true);
        let provisioner = provisioner(db.clone(), spec(Some("mine")));

        let result = provisioner.ensure().expect("ensure");
        assert!(result.verified);
        assert_eq!(db.password_of("shop_app").as_deref(), Some("set-by-operator"));
    }

    #[test]
    fn test_unreachable_server_is_retried() {
        let db = Arc::new(MemoryDatabase::new());
        db.set_unreachable_for(2);
        let provisioner = provisioner(db, spec(Some("pw")));

        assert!(provisioner.ensure().expect("recovers").verified);
    }

    #[test]
    fn test_persistently_unreachable_server_is_transient() {
        let db = Arc::new(MemoryDatabase::new());
        db.set_unreachable_for(usize::MAX);
        let provisioner = provisioner(db, spec(Some("pw")));

        let err = provisioner.ensure().expect_err("down");
        assert_eq!(err.kind, ErrorKind::TransientInfrastructure);
        assert!(err.output.expect("output").contains("Connection refused"));
    }

    #[test]
    fn test_missing_password_for_new_role_is_configuration_error() {
        let db = Arc::new(MemoryDatabase::new());
        let provisioner = provisioner(db, spec(None));

        let err = provisioner.ensure().expect_err("no password");
        assert_eq!(err.kind, ErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn test_reconcile_restores_privileges() {
        let db = Arc::new(
            MemoryDatabase::new()
                .with_role("shop_app", "pw")
                .with_role("postgres", "pw")
                .with_database("shop", "postgres"),
        );
        let provisioner = provisioner(db.clone(), spec(None));

        let result = provisioner.ensure().expect("ensure");
        assert!(result.already_present);
        assert!(result.verified);
        assert_eq!(db.owner_of("shop").as_deref(), Some("shop_app"));
    }

    #[test]
    fn test_teardown_only_drops_when_asked() {
        let db = Arc::new(MemoryDatabase::new());
        let provisioner = provisioner(db.clone(), spec(Some("pw")));
        provisioner.ensure().expect("ensure");

        provisioner.teardown(&TeardownOptions::default()).expect("keep");
        assert!(db.owner_of("shop").is_some());

        provisioner
            .teardown(&TeardownOptions { drop_database: true })
            .expect("drop");
        assert!(db.owner_of("shop").is_none());
        assert!(db.password_of("shop_app").is_none());
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", spec(Some("hunter2")));
        assert!(!rendered.contains("hunter2"));
    }
}
