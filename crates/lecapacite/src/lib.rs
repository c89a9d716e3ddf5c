//! lecapacite - System Capabilities
//!
//! *La Capacité* (The Capability) - Opaque operations over the package manager,
//! database server, build tool and service manager.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Build-runner capability.
pub mod build;
/// Process execution and command failure reporting.
pub mod command;
/// Database-admin capability.
pub mod database;
/// Package-installer capability.
pub mod packages;
/// Executable search path resolution.
pub mod path;
/// Service-manager capability.
pub mod service;

/// In-memory capability backend.
#[cfg(feature = "memory")]
pub mod memory;

pub use build::{BuildRunner, CommandBuildRunner};
pub use command::{CapabilityError, CommandFailure, CommandOutput, CommandSpec, Result};
pub use database::{DatabaseAdmin, PsqlAdmin};
pub use packages::{AptInstaller, PackageInstaller};
pub use path::PathResolver;
pub use service::{ServiceManager, SystemdManager, UnitDescriptor};

/// Exit status conventionally reported by a shell when a command cannot be found.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;
