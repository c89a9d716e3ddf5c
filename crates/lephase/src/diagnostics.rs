//! Diagnostics reporter
//!
//! A read-only pass over the installation: persisted state, the run lock,
//! required binaries, every provisioner's verification and the service port.
//! Nothing is created, started or repaired here.

use lecapacite::PathResolver;
use serde::Serialize;
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::orchestrate::{
    AssumeAlive, InstallState, OrchestrationContext, PhasePlan, ProcessProbe, RunLock,
};
use crate::Phase;

/// Highest exit status `status` reports; larger error counts are clamped.
pub const MAX_EXIT_STATUS: i32 = 125;

/// How serious an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Degraded but the application can run
    Warning,
    /// Blocks the application from running
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    /// Severity
    pub severity: Severity,
    /// What the issue is about, e.g. `service:shop`
    pub subject: String,
    /// What is wrong
    pub message: String,
    /// What the operator can do about it
    pub remediation_hint: String,
}

impl Issue {
    fn error(subject: impl Into<String>, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            subject: subject.into(),
            message: message.into(),
            remediation_hint: hint.into(),
        }
    }

    fn warning(subject: impl Into<String>, message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            subject: subject.into(),
            message: message.into(),
            remediation_hint: hint.into(),
        }
    }
}

/// Result of a diagnostics pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsReport {
    /// Persisted phase, if the state file was readable
    pub phase: Option<Phase>,
    /// Every failed check
    pub issues: Vec<Issue>,
}

impl DiagnosticsReport {
    /// Number of `Error` issues.
    pub fn error_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity == Severity::Error).count()
    }

    /// Number of `Warning` issues.
    pub fn warning_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity == Severity::Warning).count()
    }

    /// Process exit status: the error count, clamped to [`MAX_EXIT_STATUS`].
    pub fn exit_code(&self) -> i32 {
        i32::try_from(self.error_count())
            .unwrap_or(i32::MAX)
            .min(MAX_EXIT_STATUS)
    }
}

/// TCP reachability check for the application's listening port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCheck {
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// Connect timeout
    pub timeout: Duration,
}

impl PortCheck {
    /// Check `host:port` with a two second timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(2),
        }
    }

    /// Whether a TCP connection succeeds.
    pub fn is_reachable(&self) -> bool {
        let Ok(addrs) = (self.host.as_str(), self.port).to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}

/// Re-checks every verification predicate without attempting remediation.
pub struct DiagnosticsReporter {
    context: OrchestrationContext,
    plans: Vec<PhasePlan>,
    resolver: PathResolver,
    required_binaries: Vec<String>,
    port: Option<PortCheck>,
    probe: Arc<dyn ProcessProbe>,
}

impl DiagnosticsReporter {
    /// Reporter over the provisioners of `plans`.
    pub fn new(context: OrchestrationContext, plans: Vec<PhasePlan>) -> Self {
        Self {
            context,
            plans,
            resolver: PathResolver::default(),
            required_binaries: Vec::new(),
            port: None,
            probe: Arc::new(AssumeAlive),
        }
    }

    /// Binaries that must be resolvable through `resolver`.
    pub fn with_required_binaries(mut self, resolver: PathResolver, binaries: Vec<String>) -> Self {
        self.resolver = resolver;
        self.required_binaries = binaries;
        self
    }

    /// Port checked once the service verifies.
    pub fn with_port_check(mut self, port: PortCheck) -> Self {
        self.port = Some(port);
        self
    }

    /// Probe used to tell a stale lock from a running install.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Run every check.
    pub fn diagnose(&self) -> DiagnosticsReport {
        let mut issues = Vec::new();
        let phase = self.check_state(&mut issues);
        self.check_lock(&mut issues);
        self.check_binaries(&mut issues);
        let service_verified = self.check_provisioners(&mut issues);
        if service_verified {
            self.check_port(&mut issues);
        }
        debug!(issues = issues.len(), "diagnostics finished");
        DiagnosticsReport { phase, issues }
    }

    fn check_state(&self, issues: &mut Vec<Issue>) -> Option<Phase> {
        let path = self.context.state_path();
        match InstallState::load_or_default(&path) {
            Ok(state) => {
                if state.phase < Phase::Complete {
                    issues.push(Issue::warning(
                        "install-state",
                        format!("installation is incomplete (phase {})", state.phase),
                        "run `ledeploy install`",
                    ));
                }
                Some(state.phase)
            }
            Err(err) => {
                issues.push(Issue::error(
                    "install-state",
                    err.to_string(),
                    format!("fix or delete {} and run `ledeploy install`", path.display()),
                ));
                None
            }
        }
    }

    fn check_lock(&self, issues: &mut Vec<Issue>) {
        let path = self.context.lock_path();
        match RunLock::read(&path) {
            Ok(None) => {}
            Ok(Some(record)) if self.probe.is_alive(record.pid) => {
                issues.push(Issue::warning(
                    "run-lock",
                    format!(
                        "an install is in progress (pid {} since {})",
                        record.pid,
                        record.acquired_at.to_rfc3339()
                    ),
                    "wait for the running install to finish",
                ));
            }
            Ok(Some(record)) => {
                issues.push(Issue::warning(
                    "run-lock",
                    format!(
                        "stale lock left by pid {} (since {}), which is no longer running",
                        record.pid,
                        record.acquired_at.to_rfc3339()
                    ),
                    format!(
                        "run `ledeploy reset --force` or delete {}",
                        path.display()
                    ),
                ));
            }
            Err(err) => {
                issues.push(Issue::warning(
                    "run-lock",
                    err.to_string(),
                    format!("delete {} once no install is running", path.display()),
                ));
            }
        }
    }

    fn check_binaries(&self, issues: &mut Vec<Issue>) {
        for binary in &self.required_binaries {
            if self.resolver.resolve(binary).is_none() {
                issues.push(Issue::error(
                    format!("binary:{}", binary),
                    format!("{} was not found on the service search path", binary),
                    format!(
                        "install {} or re-run `ledeploy install` so its runtime is reinstalled",
                        binary
                    ),
                ));
            }
        }
    }

    /// Returns whether every provisioner of the final phase verified.
    fn check_provisioners(&self, issues: &mut Vec<Issue>) -> bool {
        let mut service_verified = true;
        for plan in &self.plans {
            for provisioner in &plan.provisioners {
                let subject = provisioner.resource();
                let verified = match provisioner.verify() {
                    Ok(verification) => {
                        if !verification.problems.is_empty() {
                            issues.push(Issue::error(
                                subject.clone(),
                                verification.problems.join("; "),
                                provisioner.remediation_hint(),
                            ));
                        }
                        if !verification.warnings.is_empty() {
                            issues.push(Issue::warning(
                                subject.clone(),
                                verification.warnings.join("; "),
                                provisioner.remediation_hint(),
                            ));
                        }
                        verification.is_verified()
                    }
                    Err(err) => {
                        issues.push(Issue::error(
                            subject.clone(),
                            err.message,
                            provisioner.remediation_hint(),
                        ));
                        false
                    }
                };
                if plan.target == Phase::Complete && !verified {
                    service_verified = false;
                }
            }
        }
        service_verified
    }

    fn check_port(&self, issues: &mut Vec<Issue>) {
        let Some(port) = &self.port else {
            return;
        };
        if !port.is_reachable() {
            issues.push(Issue::warning(
                format!("port:{}", port.port),
                format!("nothing accepts connections on {}:{}", port.host, port.port),
                "check the application logs; it may still be starting",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::LockRecord;
    use chrono::Utc;
    use leprovision::{ProvisionError, Provisioner, Verification};
    use std::net::TcpListener;
    use tempfile::tempdir;

    struct Fixed {
        name: &'static str,
        problems: Vec<&'static str>,
        warnings: Vec<&'static str>,
    }

    impl Provisioner for Fixed {
        fn resource(&self) -> String {
            self.name.to_string()
        }

        fn check_existing(&self) -> Result<bool, ProvisionError> {
            Ok(true)
        }

        fn create(&self) -> Result<(), ProvisionError> {
            Ok(())
        }

        fn verify(&self) -> Result<Verification, ProvisionError> {
            let mut verification = Verification::default();
            for problem in &self.problems {
                verification.problem(*problem);
            }
            for warning in &self.warnings {
                verification.warning(*warning);
            }
            Ok(verification)
        }

        fn remediation_hint(&self) -> String {
            format!("fix {}", self.name)
        }
    }

    struct DeadProbe;

    impl ProcessProbe for DeadProbe {
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    fn complete_state(context: &OrchestrationContext) {
        let mut state = InstallState::default();
        state.commit(Phase::Complete);
        state.save_to_path(&context.state_path()).expect("save");
    }

    #[test]
    fn exit_code_counts_errors_and_clamps() {
        let issue = Issue::error("x", "broken", "fix");
        let report = DiagnosticsReport {
            phase: Some(Phase::Complete),
            issues: vec![issue.clone(); 300],
        };
        assert_eq!(report.exit_code(), MAX_EXIT_STATUS);

        let clean = DiagnosticsReport {
            phase: Some(Phase::Complete),
            issues: vec![Issue::warning("y", "odd", "look")],
        };
        assert_eq!(clean.exit_code(), 0);
    }

    #[test]
    fn problems_are_errors_and_warnings_are_warnings() {
        let dir = tempdir().expect("tempdir");
        let context = OrchestrationContext::new(dir.path());
        complete_state(&context);
        let plans = vec![PhasePlan::new(Phase::Complete).with(Arc::new(Fixed {
            name: "service:shop",
            problems: vec!["unit shop is not installed"],
            warnings: vec!["unit differs"],
        }))];

        let report = DiagnosticsReporter::new(context, plans).diagnose();
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.warning_count(), 1);
        assert_eq!(report.issues[0].subject, "service:shop");
        assert_eq!(report.issues[0].remediation_hint, "fix service:shop");
    }

    #[test]
    fn incomplete_installation_is_a_warning() {
        let dir = tempdir().expect("tempdir");
        let report = DiagnosticsReporter::new(OrchestrationContext::new(dir.path()), Vec::new()).diagnose();
        assert_eq!(report.phase, Some(Phase::NotStarted));
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.issues[0].subject, "install-state");
    }

    #[test]
    fn stale_lock_is_reported_with_override_hint() {
        let dir = tempdir().expect("tempdir");
        let context = OrchestrationContext::new(dir.path());
        complete_state(&context);
        let record = LockRecord {
            pid: 999_999,
            acquired_at: Utc::now(),
        };
        std::fs::write(context.lock_path(), serde_json::to_vec(&record).expect("json")).expect("lock");

        let report = DiagnosticsReporter::new(context, Vec::new())
            .with_probe(Arc::new(DeadProbe))
            .diagnose();
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.warning_count(), 1);
        assert!(report.issues[0].message.contains("stale lock"));
        assert!(report.issues[0].remediation_hint.contains("--force"));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let context = OrchestrationContext::new(dir.path());
        complete_state(&context);

        let report = DiagnosticsReporter::new(context, Vec::new())
            .with_required_binaries(PathResolver::with_dirs([dir.path()]), vec!["node".to_string()])
            .diagnose();
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.issues[0].subject, "binary:node");
    }

    #[test]
    fn port_is_only_checked_when_service_verifies() {
        let dir = tempdir().expect("tempdir");
        let context = OrchestrationContext::new(dir.path());
        complete_state(&context);
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let open = listener.local_addr().expect("addr").port();
        drop(listener);

        let broken = vec![PhasePlan::new(Phase::Complete).with(Arc::new(Fixed {
            name: "service:shop",
            problems: vec!["not running"],
            warnings: Vec::new(),
        }))];
        let report = DiagnosticsReporter::new(context.clone(), broken)
            .with_port_check(PortCheck::new("127.0.0.1", open))
            .diagnose();
        assert!(report.issues.iter().all(|i| !i.subject.starts_with("port:")));

        let healthy = vec![PhasePlan::new(Phase::Complete).with(Arc::new(Fixed {
            name: "service:shop",
            problems: Vec::new(),
            warnings: Vec::new(),
        }))];
        let report = DiagnosticsReporter::new(context, healthy)
            .with_port_check(PortCheck::new("127.0.0.1", open))
            .diagnose();
        assert_eq!(report.error_count(), 0);
        assert!(report.issues.iter().any(|i| i.subject.starts_with("port:")));
    }

    #[test]
    fn reachable_port_is_not_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(PortCheck::new("127.0.0.1", port).is_reachable());
    }
}
