// Deployment Configuration
//
// *La Configuration* (The Configuration) - ledeploy.toml and environment overrides

use lecapacite::CommandSpec;
use leprovision::RequiredKey;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::errors::{DeployError, Result};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "ledeploy.toml";

/// State directory, relative to the project, when none is configured
pub const DEFAULT_STATE_DIR: &str = ".ledeploy";

/// Environment key the database connection URL is written under
pub const DATABASE_URL_KEY: &str = "DATABASE_URL";

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex"));
static UNIT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.@-]*$").expect("valid regex"));

/// Commented configuration written by `ledeploy init`
pub const DEFAULT_TEMPLATE: &str = r#"# ledeploy configuration
#
# Relative paths are resolved against app.project_path, which defaults to the
# directory holding this file.

# Log filter, e.g. "info" or "info,leprovision=debug" (LEDEPLOY_LOG overrides)
log_level = "info"

[app]
name = "shop"
# project_path = "/srv/shop"

[state]
# Holds state.json and run.lock (LEDEPLOY_STATE_DIR overrides)
# dir = ".ledeploy"

[packages]
# Installed in the dependencies phase
names = ["nodejs", "npm", "postgresql"]
# Reinstalled when a runtime binary goes missing
runtime = ["nodejs", "npm"]
# Installed when the package manager reports an unknown package
prerequisites = ["ca-certificates", "curl", "gnupg"]
sudo = true

[database]
name = "shop"
role = "shop_app"
# Prefer LEDEPLOY_DB_PASSWORD over storing the password here
# password = "change-me"
# host = "127.0.0.1"
# port = 5432
# Local account psql runs as; "" runs psql directly
admin_user = "postgres"

[env_file]
output = ".env"
# template = ".env.example"

[env_file.values]
NODE_ENV = "production"
PORT = "3000"

[[env_file.required]]
key = "DATABASE_URL"
validator = "postgres-url"

[[env_file.required]]
key = "SESSION_SECRET"
validator = { min-length = 32 }

[build]
install = "npm ci"
build = "npm run build"
artifact = "dist"

[service]
# name = "shop"
description = "shop web application"
exec_start = "node dist/server.js"
# user = "www-data"
required_binaries = ["node"]
host = "127.0.0.1"
port = 3000
sudo = true

[executor]
max_attempts = 3
retry_delay_secs = 2
database_wait_secs = 5
"#;

/// Deployment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// `tracing` filter directive
    pub log_level: String,

    /// Application identity and location
    pub app: AppConfig,

    /// Where state and lock files live
    pub state: StateConfig,

    /// System packages
    pub packages: PackagesConfig,

    /// Database role and database
    pub database: DatabaseConfig,

    /// Environment file
    pub env_file: EnvFileConfig,

    /// Application build
    pub build: BuildConfig,

    /// Service unit
    pub service: ServiceConfig,

    /// Retry policy
    pub executor: ExecutorConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app: AppConfig::default(),
            state: StateConfig::default(),
            packages: PackagesConfig::default(),
            database: DatabaseConfig::default(),
            env_file: EnvFileConfig::default(),
            build: BuildConfig::default(),
            service: ServiceConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Application identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application name; also the default service name
    pub name: String,

    /// Project checkout; defaults to the configuration file's directory
    pub project_path: PathBuf,
}

/// State location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory for `state.json` and `run.lock`
    pub dir: Option<PathBuf>,
}

/// System packages configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Packages the dependencies phase installs
    pub names: Vec<String>,

    /// Packages providing the application runtime
    pub runtime: Vec<String>,

    /// Packages installed when a package is unknown to the index
    pub prerequisites: Vec<String>,

    /// Run the package manager through `sudo`
    pub sudo: bool,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            names: vec!["nodejs".to_string(), "npm".to_string(), "postgresql".to_string()],
            runtime: vec!["nodejs".to_string(), "npm".to_string()],
            prerequisites: vec![
                "ca-certificates".to_string(),
                "curl".to_string(),
                "gnupg".to_string(),
            ],
            sudo: false,
        }
    }
}

/// Database configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name
    pub name: String,

    /// Login role owning the database
    pub role: String,

    /// Password for a newly created role
    pub password: Option<String>,

    /// Server host; unset uses the local socket
    pub host: Option<String>,

    /// Server port
    pub port: Option<u16>,

    /// Local account `psql` runs as; empty runs it directly
    pub admin_user: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            role: String::new(),
            password: None,
            host: None,
            port: None,
            admin_user: "postgres".to_string(),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_user", &self.admin_user)
            .finish()
    }
}

/// Environment file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvFileConfig {
    /// `KEY=VALUE` template the file is seeded from
    pub template: Option<PathBuf>,

    /// File the service loads
    pub output: PathBuf,

    /// Configured values
    pub values: BTreeMap<String, String>,

    /// Keys that must carry a real value
    pub required: Vec<RequiredKey>,
}

impl Default for EnvFileConfig {
    fn default() -> Self {
        Self {
            template: None,
            output: PathBuf::from(".env"),
            values: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Dependency installation command
    pub install: String,

    /// Build command
    pub build: String,

    /// File or directory the build produces
    pub artifact: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            install: "npm ci".to_string(),
            build: "npm run build".to_string(),
            artifact: PathBuf::from("dist"),
        }
    }
}

impl BuildConfig {
    /// Parsed dependency installation command
    pub fn install_command(&self) -> Option<CommandSpec> {
        CommandSpec::parse(&self.install)
    }

    /// Parsed build command
    pub fn build_command(&self) -> Option<CommandSpec> {
        CommandSpec::parse(&self.build)
    }
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Unit name; defaults to the application name
    pub name: String,

    /// Unit description
    pub description: String,

    /// Directory unit files are written to
    pub unit_dir: PathBuf,

    /// Command line the service runs
    pub exec_start: String,

    /// Account the service runs as
    pub user: Option<String>,

    /// Executables that must resolve on the service's search path
    pub required_binaries: Vec<String>,

    /// Host the application listens on
    pub host: String,

    /// Port the application listens on; unset skips the reachability check
    pub port: Option<u16>,

    /// Run `systemctl` through `sudo`
    pub sudo: bool,

    /// Seconds to wait after start before checking the service stayed up
    pub settle_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            unit_dir: PathBuf::from(lecapacite::service::DEFAULT_UNIT_DIR),
            exec_start: String::new(),
            user: None,
            required_binaries: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: None,
            sudo: false,
            settle_secs: 2,
        }
    }
}

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempts per external operation, including the first
    pub max_attempts: usize,

    /// Fixed delay between attempts
    pub retry_delay_secs: u64,

    /// Wait before retrying an unreachable database
    pub database_wait_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: leprovision::DEFAULT_MAX_ATTEMPTS,
            retry_delay_secs: 2,
            database_wait_secs: 5,
        }
    }
}

impl ExecutorConfig {
    /// Delay between attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Wait applied before retrying an unreachable database
    pub fn database_wait(&self) -> Duration {
        Duration::from_secs(self.database_wait_secs)
    }
}

impl DeployConfig {
    /// Load configuration from a file
    ///
    /// Relative paths inside the file are resolved against `app.project_path`,
    /// which itself defaults to the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DeployError::ConfigMissing {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path)
            .map_err(|e| DeployError::io_error("failed to read configuration", path, e))?;

        let base = match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        let base = absolute(&base)?;

        Self::parse(&content, path, &base)
    }

    /// Parse configuration text and resolve its paths against `base`
    pub fn parse(content: &str, source: &Path, base: &Path) -> Result<Self> {
        let mut config: DeployConfig =
            toml::from_str(content).map_err(|e| DeployError::ConfigParse {
                path: source.to_path_buf(),
                source: e,
            })?;
        config.resolve_paths(base);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let project = if self.app.project_path.as_os_str().is_empty() {
            base.to_path_buf()
        } else {
            base.join(&self.app.project_path)
        };
        // `..` and symlinks collapse so one checkout always records the same path.
        self.app.project_path = fs::canonicalize(&project).unwrap_or(project);
        let project = self.app.project_path.clone();

        if let Some(dir) = self.state.dir.take() {
            self.state.dir = Some(project.join(dir));
        }
        if let Some(template) = self.env_file.template.take() {
            self.env_file.template = Some(project.join(template));
        }
        self.env_file.output = project.join(&self.env_file.output);
        self.build.artifact = project.join(&self.build.artifact);
    }

    /// Apply `LEDEPLOY_*` environment overrides
    ///
    /// Environment variables:
    /// - `LEDEPLOY_STATE_DIR` - State directory
    /// - `LEDEPLOY_DB_PASSWORD` - Database role password
    /// - `LEDEPLOY_LOG` - Log filter directive
    /// - `LEDEPLOY_MAX_ATTEMPTS` - Attempts per external operation
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides read through `lookup`
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("LEDEPLOY_STATE_DIR").filter(|dir| !dir.is_empty()) {
            self.state.dir = Some(self.app.project_path.join(dir));
        }

        if let Some(password) = lookup("LEDEPLOY_DB_PASSWORD").filter(|p| !p.is_empty()) {
            self.database.password = Some(password);
        }

        if let Some(level) = lookup("LEDEPLOY_LOG").filter(|level| !level.is_empty()) {
            self.log_level = level;
        }

        if let Some(attempts) = lookup("LEDEPLOY_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<usize>() {
                self.executor.max_attempts = attempts;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.app.name.is_empty() {
            return Err(DeployError::config_error(
                "app.name is empty",
                Some("Set app.name to the application's name.".to_string()),
            ));
        }

        if !UNIT_NAME_RE.is_match(self.service_name()) {
            return Err(DeployError::config_error(
                format!("{:?} is not a valid service name", self.service_name()),
                Some("Use letters, digits, '-', '_', '.' or '@'.".to_string()),
            ));
        }

        if !self.app.project_path.is_dir() {
            return Err(DeployError::config_error(
                format!(
                    "project path {} is not a directory",
                    self.app.project_path.display()
                ),
                Some("Set app.project_path to the application checkout.".to_string()),
            ));
        }

        if self.packages.names.is_empty() {
            return Err(DeployError::config_error("packages.names is empty", None));
        }

        for (field, value) in [("database.name", &self.database.name), ("database.role", &self.database.role)] {
            if !IDENT_RE.is_match(value) {
                return Err(DeployError::config_error(
                    format!("{} {:?} is not a valid identifier", field, value),
                    Some("Use letters, digits and '_', starting with a letter.".to_string()),
                ));
            }
        }

        if self.executor.max_attempts == 0 {
            return Err(DeployError::config_error(
                "executor.max_attempts must be at least 1",
                None,
            ));
        }

        if self.build.install_command().is_none() || self.build.build_command().is_none() {
            return Err(DeployError::config_error(
                "build.install and build.build must both name a command",
                None,
            ));
        }

        if self.service.exec_start.trim().is_empty() {
            return Err(DeployError::config_error(
                "service.exec_start is empty",
                Some("Set the command line that starts the application.".to_string()),
            ));
        }

        if self.service.port == Some(0) {
            return Err(DeployError::config_error("service.port cannot be zero", None));
        }

        if let Err(e) = EnvFilter::try_new(&self.log_level) {
            return Err(DeployError::config_error(
                format!("invalid log_level {:?}: {}", self.log_level, e),
                Some("Use a level such as \"info\" or a directive such as \"info,lephase=debug\".".to_string()),
            ));
        }

        Ok(())
    }

    /// Project checkout
    pub fn project_path(&self) -> &Path {
        &self.app.project_path
    }

    /// Directory holding state and lock files
    pub fn state_dir(&self) -> PathBuf {
        self.state
            .dir
            .clone()
            .unwrap_or_else(|| self.app.project_path.join(DEFAULT_STATE_DIR))
    }

    /// Service unit name
    pub fn service_name(&self) -> &str {
        if self.service.name.is_empty() {
            &self.app.name
        } else {
            &self.service.name
        }
    }

    /// `postgres://` URL for the application role, when the password is known
    pub fn database_url(&self) -> Option<String> {
        let password = self.database.password.as_ref()?;
        let host = self.database.host.as_deref().unwrap_or("localhost");
        let port = self.database.port.unwrap_or(5432);
        Some(format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.role,
            encode_userinfo(password),
            host,
            port,
            self.database.name
        ))
    }

    /// Values written to the environment file
    ///
    /// The database URL is added when it is not configured explicitly.
    pub fn env_values(&self) -> BTreeMap<String, String> {
        let mut values = self.env_file.values.clone();
        if !values.contains_key(DATABASE_URL_KEY) {
            if let Some(url) = self.database_url() {
                values.insert(DATABASE_URL_KEY.to_string(), url);
            }
        }
        values
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| DeployError::io_error("failed to read the working directory", path, e))?;
    Ok(cwd.join(path))
}

// Percent-encodes the characters that would end the userinfo part of a URL.
fn encode_userinfo(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
