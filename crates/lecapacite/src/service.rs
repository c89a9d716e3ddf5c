//! Service-manager capability
//!
//! `SystemdManager` writes unit files into a unit directory and drives them with
//! `systemctl`.

use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::command::{with_prefix, CapabilityError, CommandSpec, Result};

/// Default directory for administrator-installed units
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// A rendered service descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDescriptor {
    /// Service name without the `.service` suffix
    pub name: String,
    /// Full unit file contents
    pub contents: String,
}

/// Installs and controls OS services.
pub trait ServiceManager: Send + Sync {
    /// Write (or overwrite) the unit and make the manager aware of it.
    fn install_unit(&self, descriptor: &UnitDescriptor) -> Result<()>;

    /// Whether a unit file for `name` is installed.
    fn unit_exists(&self, name: &str) -> Result<bool>;

    /// Current unit file contents, if installed.
    fn read_unit(&self, name: &str) -> Result<Option<String>>;

    /// Enable the service at boot.
    fn enable(&self, name: &str) -> Result<()>;

    /// Whether the service is enabled at boot.
    fn is_enabled(&self, name: &str) -> Result<bool>;

    /// Start the service.
    fn start(&self, name: &str) -> Result<()>;

    /// Whether the service is currently running.
    fn is_active(&self, name: &str) -> Result<bool>;

    /// Exit status of the service's main process, if it has exited.
    fn last_exit_status(&self, name: &str) -> Result<Option<i32>>;

    /// Stop the service.
    fn stop(&self, name: &str) -> Result<()>;

    /// Disable the service at boot.
    fn disable(&self, name: &str) -> Result<()>;

    /// Remove the unit file.
    fn remove_unit(&self, name: &str) -> Result<()>;
}

/// `systemctl` backed service manager.
#[derive(Debug, Clone)]
pub struct SystemdManager {
    /// Directory unit files are written to
    pub unit_dir: PathBuf,
    /// Wrapper such as `["sudo"]` prepended to `systemctl`
    pub prefix: Vec<String>,
}

impl Default for SystemdManager {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            prefix: Vec::new(),
        }
    }
}

impl SystemdManager {
    /// Path of the unit file for `name`.
    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(unit_file_name(name))
    }

    fn systemctl<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        with_prefix(&self.prefix, CommandSpec::new("systemctl").args(args))
    }
}

/// `name.service`, unless `name` already carries a unit suffix.
pub fn unit_file_name(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{}.service", name)
    }
}

impl ServiceManager for SystemdManager {
    fn install_unit(&self, descriptor: &UnitDescriptor) -> Result<()> {
        let path = self.unit_path(&descriptor.name);
        info!(unit = %path.display(), "writing service unit");
        fs::create_dir_all(&self.unit_dir).map_err(|err| {
            CapabilityError::io(format!("failed to create {}", self.unit_dir.display()), err)
        })?;
        fs::write(&path, &descriptor.contents).map_err(|err| {
            CapabilityError::io(format!("failed to write {}", path.display()), err)
        })?;
        self.systemctl(["daemon-reload"]).run()?;
        Ok(())
    }

    fn unit_exists(&self, name: &str) -> Result<bool> {
        Ok(self.unit_path(name).is_file())
    }

    fn read_unit(&self, name: &str) -> Result<Option<String>> {
        let path = self.unit_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|err| CapabilityError::io(format!("failed to read {}", path.display()), err))
    }

    fn enable(&self, name: &str) -> Result<()> {
        self.systemctl(["enable".to_string(), unit_file_name(name)]).run()?;
        Ok(())
    }

    fn is_enabled(&self, name: &str) -> Result<bool> {
        self.systemctl(["is-enabled".to_string(), "--quiet".to_string(), unit_file_name(name)])
            .probe()
    }

    fn start(&self, name: &str) -> Result<()> {
        info!(service = name, "starting service");
        self.systemctl(["start".to_string(), unit_file_name(name)]).run()?;
        Ok(())
    }

    fn is_active(&self, name: &str) -> Result<bool> {
        self.systemctl(["is-active".to_string(), "--quiet".to_string(), unit_file_name(name)])
            .probe()
    }

    fn last_exit_status(&self, name: &str) -> Result<Option<i32>> {
        let output = self
            .systemctl([
                "show".to_string(),
                "--property=ExecMainStatus".to_string(),
                "--value".to_string(),
                unit_file_name(name),
            ])
            .run()?;
        Ok(output.stdout.trim().parse::<i32>().ok())
    }

    fn stop(&self, name: &str) -> Result<()> {
        info!(service = name, "stopping service");
        self.systemctl(["stop".to_string(), unit_file_name(name)]).run()?;
        Ok(())
    }

    fn disable(&self, name: &str) -> Result<()> {
        self.systemctl(["disable".to_string(), unit_file_name(name)]).run()?;
        Ok(())
    }

    fn remove_unit(&self, name: &str) -> Result<()> {
        let path = self.unit_path(name);
        if path.exists() {
            info!(unit = %path.display(), "removing service unit");
            fs::remove_file(&path).map_err(|err| {
                CapabilityError::io(format!("failed to remove {}", path.display()), err)
            })?;
        }
        self.systemctl(["daemon-reload"]).run()?;
        Ok(())
    }
}
