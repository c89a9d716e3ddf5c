//! Generic provisioner contract
//!
//! A provisioner owns one external resource. It never trusts local bookkeeping:
//! every call to [`Provisioner::ensure`] re-queries the live resource, creates it
//! only when absent, and re-verifies its shape afterwards.

use lecapacite::CapabilityError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::ExecutionError;
use crate::failure::ErrorKind;

/// Outcome of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verification {
    /// Conditions that make the resource unusable
    pub problems: Vec<String>,
    /// Degraded but non-blocking conditions
    pub warnings: Vec<String>,
}

impl Verification {
    /// Whether the resource matches its required shape.
    pub fn is_verified(&self) -> bool {
        self.problems.is_empty()
    }

    /// Record a blocking problem.
    pub fn problem(&mut self, message: impl Into<String>) {
        self.problems.push(message.into());
    }

    /// Record a non-blocking warning.
    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Result of [`Provisioner::ensure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionResult {
    /// The resource existed before this call
    pub already_present: bool,
    /// The resource verified after this call
    pub verified: bool,
    /// Full verification detail
    pub verification: Verification,
}

/// Options for tearing resources down during a reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownOptions {
    /// Also drop the database and its role
    pub drop_database: bool,
}

/// A provisioning failure, attributed to one resource.
#[derive(Debug, Error)]
#[error("{resource}: {message}")]
pub struct ProvisionError {
    /// Resource the failure occurred in
    pub resource: String,
    /// Error class
    pub kind: ErrorKind,
    /// What went wrong
    pub message: String,
    /// Output of the originating tool
    pub output: Option<String>,
}

impl ProvisionError {
    /// Create an error with no attached tool output.
    pub fn new(resource: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            kind,
            message: message.into(),
            output: None,
        }
    }

    /// Wrap a terminal executor failure.
    pub fn from_execution(resource: impl Into<String>, err: ExecutionError) -> Self {
        Self {
            resource: resource.into(),
            kind: err.kind(),
            output: err.tool_output(),
            message: err.to_string(),
        }
    }

    /// Wrap a capability failure that was not routed through the executor.
    pub fn from_capability(
        resource: impl Into<String>,
        context: &str,
        err: CapabilityError,
    ) -> Self {
        let output = err
            .command_failure()
            .map(|failure| failure.output_text())
            .filter(|text| !text.is_empty());
        Self {
            resource: resource.into(),
            kind: ErrorKind::Unclassified,
            message: format!("{}: {}", context, err),
            output,
        }
    }
}

/// Ensures one external resource exists and matches its required shape.
pub trait Provisioner: Send + Sync {
    /// Stable resource name used in logs, errors and diagnostics.
    fn resource(&self) -> String;

    /// Query the live resource; never consult cached state.
    fn check_existing(&self) -> Result<bool, ProvisionError>;

    /// Create the resource. Only called when `check_existing` reported absence;
    /// "already exists" from the creating tool counts as success.
    fn create(&self) -> Result<(), ProvisionError>;

    /// Bring an existing resource back into shape without recreating it.
    fn reconcile(&self) -> Result<(), ProvisionError> {
        Ok(())
    }

    /// Read-only check of the live resource against its required shape.
    fn verify(&self) -> Result<Verification, ProvisionError>;

    /// Operator hint shown when verification fails.
    fn remediation_hint(&self) -> String;

    /// Remove the resource during a reset.
    fn teardown(&self, _options: &TeardownOptions) -> Result<(), ProvisionError> {
        Ok(())
    }

    /// Check, create if absent, then verify.
    fn ensure(&self) -> Result<ProvisionResult, ProvisionError> {
        let resource = self.resource();
        let already_present = self.check_existing()?;

        if already_present {
            debug!(resource = %resource, "resource already present");
            self.reconcile()?;
        } else {
            info!(resource = %resource, "creating resource");
            self.create()?;
        }

        let verification = self.verify()?;
        for warning in &verification.warnings {
            warn!(resource = %resource, "{}", warning);
        }
        for problem in &verification.problems {
            warn!(resource = %resource, "verification failed: {}", problem);
        }

        Ok(ProvisionResult {
            already_present,
            verified: verification.is_verified(),
            verification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlagProvisioner {
        exists: AtomicBool,
        creates: AtomicUsize,
        reconciles: AtomicUsize,
    }

    impl Provisioner for FlagProvisioner {
        fn resource(&self) -> String {
            "flag".to_string()
        }

        fn check_existing(&self) -> Result<bool, ProvisionError> {
            Ok(self.exists.load(Ordering::SeqCst))
        }

        fn create(&self) -> Result<(), ProvisionError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.exists.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn reconcile(&self) -> Result<(), ProvisionError> {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn verify(&self) -> Result<Verification, ProvisionError> {
            let mut verification = Verification::default();
            if !self.exists.load(Ordering::SeqCst) {
                verification.problem("flag missing");
            }
            Ok(verification)
        }

        fn remediation_hint(&self) -> String {
            "set the flag".to_string()
        }
    }

    #[test]
    fn test_ensure_creates_then_reports_present() {
        let provisioner = FlagProvisioner::default();

        let first = provisioner.ensure().expect("first");
        assert!(!first.already_present);
        assert!(first.verified);

        let second = provisioner.ensure().expect("second");
        assert!(second.already_present);
        assert!(second.verified);

        assert_eq!(provisioner.creates.load(Ordering::SeqCst), 1);
        assert_eq!(provisioner.reconciles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verification_tracks_problems_and_warnings() {
        let mut verification = Verification::default();
        verification.warning("odd value");
        assert!(verification.is_verified());
        verification.problem("missing");
        assert!(!verification.is_verified());
    }
}
