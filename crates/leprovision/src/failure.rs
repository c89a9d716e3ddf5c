//! Failure taxonomy
//!
//! A [`FailureCategory`] is what a classifier recognises in a tool's output and
//! what the remediation registry is keyed by. An [`ErrorKind`] is the coarser,
//! user-facing class that decides retry/abort behaviour and exit codes.

use lecapacite::CommandFailure;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recognised failure causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    /// Another process holds the package-manager lock
    LockHeld,
    /// The package index does not know a requested package
    PackageMissing,
    /// A required executable is absent
    BinaryMissing,
    /// The database server refused or dropped the connection
    DatabaseUnreachable,
}

impl FailureCategory {
    /// All categories, in registry order.
    pub const ALL: [FailureCategory; 4] = [
        FailureCategory::LockHeld,
        FailureCategory::PackageMissing,
        FailureCategory::BinaryMissing,
        FailureCategory::DatabaseUnreachable,
    ];

    /// The error kind this category belongs to.
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::LockHeld | Self::DatabaseUnreachable => ErrorKind::TransientInfrastructure,
            Self::PackageMissing | Self::BinaryMissing => ErrorKind::MissingDependency,
        }
    }

    /// Stable kebab-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LockHeld => "lock-held",
            Self::PackageMissing => "package-missing",
            Self::BinaryMissing => "binary-missing",
            Self::DatabaseUnreachable => "database-unreachable",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Lock contention or a network blip; retried automatically
    TransientInfrastructure,
    /// A binary or package is absent; remediated once, then retried
    MissingDependency,
    /// A configured value is malformed; reported as a warning
    ConfigurationInvalid,
    /// Another run holds the installation; never retried
    ResourceConflict,
    /// Anything else; surfaced verbatim with the tool's output
    Unclassified,
}

impl ErrorKind {
    /// Whether the kind is eligible for automatic retry.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransientInfrastructure | Self::MissingDependency)
    }

    /// Stable kebab-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransientInfrastructure => "transient-infrastructure",
            Self::MissingDependency => "missing-dependency",
            Self::ConfigurationInvalid => "configuration-invalid",
            Self::ResourceConflict => "resource-conflict",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier for package-manager output.
pub fn classify_package_failure(failure: &CommandFailure) -> Option<FailureCategory> {
    if failure.is_command_not_found() {
        return Some(FailureCategory::BinaryMissing);
    }
    const LOCK_MARKERS: &[&str] = &[
        "could not get lock",
        "unable to acquire the dpkg frontend lock",
        "unable to lock the administration directory",
        "is another process using it",
    ];
    if LOCK_MARKERS.iter().any(|marker| failure.mentions(marker)) {
        return Some(FailureCategory::LockHeld);
    }
    const MISSING_MARKERS: &[&str] = &[
        "unable to locate package",
        "has no installation candidate",
        "failed to fetch",
    ];
    if MISSING_MARKERS.iter().any(|marker| failure.mentions(marker)) {
        return Some(FailureCategory::PackageMissing);
    }
    None
}

/// Classifier for database client output.
pub fn classify_database_failure(failure: &CommandFailure) -> Option<FailureCategory> {
    if failure.is_command_not_found() {
        return Some(FailureCategory::BinaryMissing);
    }
    const UNREACHABLE_MARKERS: &[&str] = &[
        "could not connect to server",
        "connection refused",
        "connection to server on socket",
        "the database system is starting up",
        "server closed the connection unexpectedly",
    ];
    if UNREACHABLE_MARKERS.iter().any(|marker| failure.mentions(marker)) {
        return Some(FailureCategory::DatabaseUnreachable);
    }
    None
}

/// Classifier for application build output.
///
/// Exit status 127 is taken as a missing runtime. Any command missing inside the
/// build script produces the same status, so this can misfire.
pub fn classify_build_failure(failure: &CommandFailure) -> Option<FailureCategory> {
    if failure.is_command_not_found() {
        return Some(FailureCategory::BinaryMissing);
    }
    None
}
