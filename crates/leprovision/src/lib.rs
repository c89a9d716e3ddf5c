//! leprovision - Resource Provisioning
//!
//! *Le Provisionnement* (The Provisioning) - Idempotent provisioners over the
//! system capabilities, with classified retries and automatic remediation.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Application build provisioner.
pub mod build;
/// Database role and database provisioner.
pub mod database;
/// Environment file provisioner and value checks.
pub mod envfile;
/// Retrying executor.
pub mod executor;
/// Failure categories, error kinds and classifiers.
pub mod failure;
/// Package set provisioner.
pub mod packages;
/// Generic provisioner contract.
pub mod provisioner;
/// Remediation actions and registry.
pub mod remediation;
/// Service unit provisioner.
pub mod service;

pub use build::ApplicationBuildProvisioner;
pub use database::{DatabaseProvisioner, DatabaseSpec};
pub use envfile::{EnvFileProvisioner, EnvFileSpec, RequiredKey, ValueCheck};
pub use executor::{ExecutionError, RetryingExecutor, DEFAULT_MAX_ATTEMPTS};
pub use failure::{ErrorKind, FailureCategory};
pub use packages::PackageSetProvisioner;
pub use provisioner::{ProvisionError, ProvisionResult, Provisioner, TeardownOptions, Verification};
pub use remediation::{RemediationAction, RemediationKind, RemediationRegistry};
pub use service::{ServiceSpec, ServiceUnitProvisioner};
