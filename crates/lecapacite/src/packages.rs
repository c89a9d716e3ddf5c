//! Package-installer capability
//!
//! The default implementation drives `apt-get`/`dpkg` the way the provisioning
//! scripts do: non-interactive installs, `dpkg-query` for presence checks and
//! `fuser` on the dpkg lock files to detect a concurrent package manager.

use std::path::PathBuf;
use tracing::{info, warn};

use crate::command::{with_prefix, CapabilityError, CommandSpec, Result};

/// Lock files held by apt/dpkg while they run
pub const DEFAULT_LOCK_FILES: &[&str] = &[
    "/var/lib/dpkg/lock-frontend",
    "/var/lib/dpkg/lock",
    "/var/lib/apt/lists/lock",
    "/var/cache/apt/archives/lock",
];

/// Installs and queries system packages.
pub trait PackageInstaller: Send + Sync {
    /// Install the named packages, upgrading any that are already present.
    fn install_or_upgrade(&self, names: &[String]) -> Result<()>;

    /// Whether a single package is currently installed.
    fn is_installed(&self, name: &str) -> Result<bool>;

    /// Whether another process holds the package-manager lock.
    fn is_locked(&self) -> Result<bool>;

    /// Forcefully release the package-manager lock and repair interrupted state.
    fn force_release_lock(&self) -> Result<()>;

    /// Refresh the package index.
    fn refresh_index(&self) -> Result<()>;
}

/// `apt-get` backed package installer.
#[derive(Debug, Clone)]
pub struct AptInstaller {
    /// Wrapper such as `["sudo"]` prepended to every command
    pub prefix: Vec<String>,
    /// Lock files checked by `is_locked`
    pub lock_files: Vec<PathBuf>,
}

impl Default for AptInstaller {
    fn default() -> Self {
        Self {
            prefix: Vec::new(),
            lock_files: DEFAULT_LOCK_FILES.iter().map(PathBuf::from).collect(),
        }
    }
}

impl AptInstaller {
    /// Create an installer that prefixes commands with `prefix`.
    pub fn with_prefix(prefix: Vec<String>) -> Self {
        Self {
            prefix,
            ..Self::default()
        }
    }

    fn command(&self, spec: CommandSpec) -> CommandSpec {
        with_prefix(&self.prefix, spec.env("DEBIAN_FRONTEND", "noninteractive"))
    }

    fn existing_lock_files(&self) -> Vec<String> {
        self.lock_files
            .iter()
            .filter(|path| path.exists())
            .map(|path| path.display().to_string())
            .collect()
    }
}

impl PackageInstaller for AptInstaller {
    fn install_or_upgrade(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        info!(packages = ?names, "installing packages");
        self.command(
            CommandSpec::new("apt-get")
                .args(["install", "-y", "--no-install-recommends"])
                .args(names.iter().cloned()),
        )
        .run()?;
        Ok(())
    }

    fn is_installed(&self, name: &str) -> Result<bool> {
        match CommandSpec::new("dpkg-query")
            .args(["-W", "-f=${Status}", name])
            .run()
        {
            Ok(output) => Ok(output.stdout.contains("install ok installed")),
            // dpkg-query exits 1 for packages it has never heard of
            Err(CapabilityError::Command(failure)) if failure.status == Some(1) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_locked(&self) -> Result<bool> {
        let locks = self.existing_lock_files();
        if locks.is_empty() {
            return Ok(false);
        }
        // fuser exits 0 only when some process has one of the files open
        match self.command(CommandSpec::new("fuser").args(locks)).run() {
            Ok(_) => Ok(true),
            Err(CapabilityError::Command(failure)) if failure.is_command_not_found() => {
                warn!("fuser not available; assuming package manager is not locked");
                Ok(false)
            }
            Err(CapabilityError::Command(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn force_release_lock(&self) -> Result<()> {
        let locks = self.existing_lock_files();
        if !locks.is_empty() {
            warn!(locks = ?locks, "terminating package-manager lock holders");
            // No holder left to kill is fine
            let _ = self
                .command(CommandSpec::new("fuser").arg("-k").args(locks.iter().cloned()))
                .run();
            self.command(CommandSpec::new("rm").arg("-f").args(locks)).run()?;
        }
        self.command(CommandSpec::new("dpkg").args(["--configure", "-a"]))
            .run()?;
        Ok(())
    }

    fn refresh_index(&self) -> Result<()> {
        info!("refreshing package index");
        self.command(CommandSpec::new("apt-get").arg("update")).run()?;
        Ok(())
    }
}
