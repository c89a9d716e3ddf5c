//! In-memory capability backend
//!
//! Each type keeps the live "system" state in memory and exposes knobs to inject
//! the failures the real tools produce (held dpkg lock, unreachable server,
//! missing runtime, `command not found` at service start). Call counters let
//! tests assert that idempotent paths perform no side effects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::build::BuildRunner;
use crate::command::{CapabilityError, CommandFailure, Result};
use crate::database::DatabaseAdmin;
use crate::packages::PackageInstaller;
use crate::service::{ServiceManager, UnitDescriptor};
use crate::EXIT_COMMAND_NOT_FOUND;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory package manager.
#[derive(Debug, Default)]
pub struct MemoryPackages {
    installed: Mutex<BTreeSet<String>>,
    unknown: Mutex<BTreeSet<String>>,
    locked: AtomicBool,
    lock_stuck: AtomicBool,
    install_calls: AtomicUsize,
    release_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MemoryPackages {
    /// Empty package manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark packages as already installed.
    pub fn with_installed<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        guard(&self.installed).extend(names.into_iter().map(Into::into));
        self
    }

    /// Simulate another process holding the dpkg lock.
    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    /// When set, `force_release_lock` has no effect.
    pub fn set_lock_stuck(&self, stuck: bool) {
        self.lock_stuck.store(stuck, Ordering::SeqCst);
    }

    /// Make `name` unknown until the index is refreshed.
    pub fn mark_unknown(&self, name: &str) {
        guard(&self.unknown).insert(name.to_string());
    }

    /// Uninstall a package behind the orchestrator's back.
    pub fn remove(&self, name: &str) {
        guard(&self.installed).remove(name);
    }

    /// Number of `install_or_upgrade` calls.
    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    /// Number of `force_release_lock` calls.
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Number of `refresh_index` calls.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn failure(stderr: String) -> CapabilityError {
        CommandFailure::new("apt-get", vec!["install".to_string()], Some(100))
            .with_stderr(stderr)
            .into()
    }
}

impl PackageInstaller for MemoryPackages {
    fn install_or_upgrade(&self, names: &[String]) -> Result<()> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        if self.locked.load(Ordering::SeqCst) {
            return Err(Self::failure(
                "E: Could not get lock /var/lib/dpkg/lock-frontend. It is held by process 4242 (apt-get)"
                    .to_string(),
            ));
        }
        let unknown = guard(&self.unknown);
        if let Some(name) = names.iter().find(|name| unknown.contains(*name)) {
            return Err(Self::failure(format!("E: Unable to locate package {}", name)));
        }
        guard(&self.installed).extend(names.iter().cloned());
        Ok(())
    }

    fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(guard(&self.installed).contains(name))
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.locked.load(Ordering::SeqCst))
    }

    fn force_release_lock(&self) -> Result<()> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if !self.lock_stuck.load(Ordering::SeqCst) {
            self.locked.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn refresh_index(&self) -> Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        guard(&self.unknown).clear();
        Ok(())
    }
}

/// In-memory database server.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    roles: Mutex<BTreeMap<String, String>>,
    databases: Mutex<BTreeMap<String, String>>,
    grants: Mutex<BTreeSet<(String, String)>>,
    unreachable: AtomicUsize,
    racing_role: AtomicBool,
    create_role_calls: AtomicUsize,
    create_database_calls: AtomicUsize,
}

impl MemoryDatabase {
    /// Empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-existing role.
    pub fn with_role(self, name: &str, password: &str) -> Self {
        guard(&self.roles).insert(name.to_string(), password.to_string());
        self
    }

    /// Pre-existing database owned by `owner`.
    pub fn with_database(self, name: &str, owner: &str) -> Self {
        guard(&self.databases).insert(name.to_string(), owner.to_string());
        self
    }

    /// Fail the next `calls` operations with a connection error.
    pub fn set_unreachable_for(&self, calls: usize) {
        self.unreachable.store(calls, Ordering::SeqCst);
    }

    /// Simulate an operator creating the role between check and create.
    pub fn set_racing_role(&self, racing: bool) {
        self.racing_role.store(racing, Ordering::SeqCst);
    }

    /// Stored password of a role.
    pub fn password_of(&self, role: &str) -> Option<String> {
        guard(&self.roles).get(role).cloned()
    }

    /// Owner of a database.
    pub fn owner_of(&self, database: &str) -> Option<String> {
        guard(&self.databases).get(database).cloned()
    }

    /// Number of `create_role` calls.
    pub fn create_role_calls(&self) -> usize {
        self.create_role_calls.load(Ordering::SeqCst)
    }

    /// Number of `create_database` calls.
    pub fn create_database_calls(&self) -> usize {
        self.create_database_calls.load(Ordering::SeqCst)
    }

    fn reachable(&self) -> Result<()> {
        if take_one(&self.unreachable) {
            return Err(CommandFailure::new("psql", Vec::new(), Some(2))
                .with_stderr(
                    "psql: error: could not connect to server: Connection refused\n\tIs the server running locally?",
                )
                .into());
        }
        Ok(())
    }

    fn sql_error(message: String) -> CapabilityError {
        CommandFailure::new("psql", Vec::new(), Some(1))
            .with_stderr(format!("ERROR:  {}", message))
            .into()
    }
}

impl DatabaseAdmin for MemoryDatabase {
    fn role_exists(&self, name: &str) -> Result<bool> {
        self.reachable()?;
        Ok(guard(&self.roles).contains_key(name))
    }

    fn create_role(&self, name: &str, password: &str) -> Result<()> {
        self.reachable()?;
        self.create_role_calls.fetch_add(1, Ordering::SeqCst);
        let mut roles = guard(&self.roles);
        if self.racing_role.swap(false, Ordering::SeqCst) {
            roles.insert(name.to_string(), "set-by-operator".to_string());
        }
        if roles.contains_key(name) {
            return Err(Self::sql_error(format!("role \"{}\" already exists", name)));
        }
        roles.insert(name.to_string(), password.to_string());
        Ok(())
    }

    fn database_exists(&self, name: &str) -> Result<bool> {
        self.reachable()?;
        Ok(guard(&self.databases).contains_key(name))
    }

    fn create_database(&self, name: &str, owner: &str) -> Result<()> {
        self.reachable()?;
        self.create_database_calls.fetch_add(1, Ordering::SeqCst);
        if !guard(&self.roles).contains_key(owner) {
            return Err(Self::sql_error(format!("role \"{}\" does not exist", owner)));
        }
        let mut databases = guard(&self.databases);
        if databases.contains_key(name) {
            return Err(Self::sql_error(format!("database \"{}\" already exists", name)));
        }
        databases.insert(name.to_string(), owner.to_string());
        Ok(())
    }

    fn has_privileges(&self, database: &str, role: &str) -> Result<bool> {
        self.reachable()?;
        let owned = guard(&self.databases).get(database).map(String::as_str) == Some(role);
        Ok(owned || guard(&self.grants).contains(&(database.to_string(), role.to_string())))
    }

    fn grant_privileges(&self, database: &str, role: &str) -> Result<()> {
        self.reachable()?;
        let mut databases = guard(&self.databases);
        let Some(owner) = databases.get_mut(database) else {
            return Err(Self::sql_error(format!("database \"{}\" does not exist", database)));
        };
        *owner = role.to_string();
        guard(&self.grants).insert((database.to_string(), role.to_string()));
        Ok(())
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        self.reachable()?;
        guard(&self.databases).remove(name);
        guard(&self.grants).retain(|(db, _)| db != name);
        Ok(())
    }

    fn drop_role(&self, name: &str) -> Result<()> {
        self.reachable()?;
        guard(&self.roles).remove(name);
        Ok(())
    }
}

/// In-memory build tool that materialises an artifact directory on build.
#[derive(Debug, Default)]
pub struct MemoryBuild {
    artifact: Option<PathBuf>,
    missing_runtime: AtomicUsize,
    fail_build: AtomicBool,
    install_calls: AtomicUsize,
    build_calls: AtomicUsize,
}

impl MemoryBuild {
    /// Build runner that creates `artifact` when `build` succeeds.
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self {
            artifact: Some(artifact.into()),
            ..Self::default()
        }
    }

    /// Fail the next `calls` dependency installs with `command not found`.
    pub fn set_missing_runtime_for(&self, calls: usize) {
        self.missing_runtime.store(calls, Ordering::SeqCst);
    }

    /// Make every build fail with an unclassified compiler error.
    pub fn set_build_broken(&self, broken: bool) {
        self.fail_build.store(broken, Ordering::SeqCst);
    }

    /// Number of `install_dependencies` calls.
    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    /// Number of `build` calls.
    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }
}

impl BuildRunner for MemoryBuild {
    fn install_dependencies(&self) -> Result<()> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.missing_runtime) {
            return Err(CommandFailure::not_found("npm", vec!["ci".to_string()]).into());
        }
        Ok(())
    }

    fn build(&self) -> Result<()> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(CommandFailure::new(
                "npm",
                vec!["run".to_string(), "build".to_string()],
                Some(1),
            )
            .with_stderr("Type error: Property 'x' does not exist")
            .into());
        }
        if let Some(artifact) = &self.artifact {
            std::fs::create_dir_all(artifact).map_err(|err| {
                CapabilityError::io(format!("failed to create {}", artifact.display()), err)
            })?;
        }
        Ok(())
    }
}

/// One unit known to [`MemoryServices`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryUnit {
    /// Unit file contents
    pub contents: String,
    /// Enabled at boot
    pub enabled: bool,
    /// Currently running
    pub active: bool,
    /// Main process exit status
    pub exit_status: Option<i32>,
}

/// In-memory service manager.
///
/// A started unit only stays active if its `Environment=PATH=` line contains
/// every entry registered with [`MemoryServices::require_path_entry`]; otherwise
/// the main process "exits" with status 127.
#[derive(Debug, Default)]
pub struct MemoryServices {
    units: Mutex<BTreeMap<String, MemoryUnit>>,
    required_path_entries: Mutex<Vec<String>>,
    install_calls: AtomicUsize,
    start_calls: AtomicUsize,
}

impl MemoryServices {
    /// Empty service manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `entry` in the unit's search path for the service to run.
    pub fn require_path_entry(&self, entry: &str) {
        guard(&self.required_path_entries).push(entry.to_string());
    }

    /// Snapshot of a unit.
    pub fn unit(&self, name: &str) -> Option<MemoryUnit> {
        guard(&self.units).get(name).cloned()
    }

    /// Delete a unit behind the orchestrator's back.
    pub fn delete_unit_externally(&self, name: &str) {
        guard(&self.units).remove(name);
    }

    /// Stop a unit behind the orchestrator's back.
    pub fn kill(&self, name: &str) {
        if let Some(unit) = guard(&self.units).get_mut(name) {
            unit.active = false;
        }
    }

    /// Number of `install_unit` calls.
    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    /// Number of `start` calls.
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    fn not_found(name: &str) -> CapabilityError {
        CommandFailure::new("systemctl", vec!["start".to_string(), name.to_string()], Some(5))
            .with_stderr(format!("Failed to start {}.service: Unit {}.service not found.", name, name))
            .into()
    }

    fn search_path(contents: &str) -> Option<&str> {
        contents.lines().find_map(|line| {
            line.trim()
                .strip_prefix("Environment=")
                .map(|rest| rest.trim_matches('"'))
                .and_then(|rest| rest.strip_prefix("PATH="))
        })
    }
}

impl ServiceManager for MemoryServices {
    fn install_unit(&self, descriptor: &UnitDescriptor) -> Result<()> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        let mut units = guard(&self.units);
        let unit = units.entry(descriptor.name.clone()).or_default();
        unit.contents = descriptor.contents.clone();
        Ok(())
    }

    fn unit_exists(&self, name: &str) -> Result<bool> {
        Ok(guard(&self.units).contains_key(name))
    }

    fn read_unit(&self, name: &str) -> Result<Option<String>> {
        Ok(guard(&self.units).get(name).map(|unit| unit.contents.clone()))
    }

    fn enable(&self, name: &str) -> Result<()> {
        let mut units = guard(&self.units);
        let unit = units.get_mut(name).ok_or_else(|| Self::not_found(name))?;
        unit.enabled = true;
        Ok(())
    }

    fn is_enabled(&self, name: &str) -> Result<bool> {
        Ok(guard(&self.units).get(name).map(|unit| unit.enabled).unwrap_or(false))
    }

    fn start(&self, name: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let required = guard(&self.required_path_entries).clone();
        let mut units = guard(&self.units);
        let unit = units.get_mut(name).ok_or_else(|| Self::not_found(name))?;

        let path_entries: Vec<&str> = Self::search_path(&unit.contents)
            .map(|path| path.split(':').collect())
            .unwrap_or_default();
        let runnable = required
            .iter()
            .all(|entry| path_entries.contains(&entry.as_str()));

        if runnable {
            unit.active = true;
            unit.exit_status = Some(0);
        } else {
            unit.active = false;
            unit.exit_status = Some(EXIT_COMMAND_NOT_FOUND);
        }
        Ok(())
    }

    fn is_active(&self, name: &str) -> Result<bool> {
        Ok(guard(&self.units).get(name).map(|unit| unit.active).unwrap_or(false))
    }

    fn last_exit_status(&self, name: &str) -> Result<Option<i32>> {
        Ok(guard(&self.units).get(name).and_then(|unit| unit.exit_status))
    }

    fn stop(&self, name: &str) -> Result<()> {
        if let Some(unit) = guard(&self.units).get_mut(name) {
            unit.active = false;
        }
        Ok(())
    }

    fn disable(&self, name: &str) -> Result<()> {
        if let Some(unit) = guard(&self.units).get_mut(name) {
            unit.enabled = false;
        }
        Ok(())
    }

    fn remove_unit(&self, name: &str) -> Result<()> {
        guard(&self.units).remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_packages_fail_until_released() {
        let packages = MemoryPackages::new();
        packages.set_locked(true);

        let err = packages
            .install_or_upgrade(&["nginx".to_string()])
            .expect_err("locked");
        assert!(err.command_failure().expect("failure").mentions("could not get lock"));

        packages.force_release_lock().expect("release");
        packages.install_or_upgrade(&["nginx".to_string()]).expect("install");
        assert!(packages.is_installed("nginx").expect("query"));
    }

    #[test]
    fn test_racing_role_reports_already_exists() {
        let db = MemoryDatabase::new();
        db.set_racing_role(true);
        let err = db.create_role("app", "secret").expect_err("race");
        assert!(err.command_failure().expect("failure").is_already_exists());
        assert_eq!(db.password_of("app").as_deref(), Some("set-by-operator"));
    }

    #[test]
    fn test_service_requires_path_entries() {
        let services = MemoryServices::new();
        services.require_path_entry("/opt/node/bin");
        services
            .install_unit(&UnitDescriptor {
                name: "app".to_string(),
                contents: "Environment=PATH=/usr/bin\n".to_string(),
            })
            .expect("install");

        services.start("app").expect("start");
        assert!(!services.is_active("app").expect("active"));
        assert_eq!(services.last_exit_status("app").expect("status"), Some(127));

        services
            .install_unit(&UnitDescriptor {
                name: "app".to_string(),
                contents: "Environment=\"PATH=/usr/bin:/opt/node/bin\"\n".to_string(),
            })
            .expect("reinstall");
        services.start("app").expect("start");
        assert!(services.is_active("app").expect("active"));
    }
}
