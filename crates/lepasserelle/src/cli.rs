// CLI Interface
//
// This module provides the command-line interface for LeDeploy.

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use lephase::{
    DiagnosticsReport, ResetOptions, ResetReport, RunLock, RunOutcome, RunReport, RunRequest,
    Severity,
};
use leprovision::TeardownOptions;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bridge::{Capabilities, Deployment};
use crate::config::{DeployConfig, DEFAULT_CONFIG_FILE, DEFAULT_TEMPLATE};
use crate::errors::{DeployError, EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_OK};

/// LeDeploy - resumable, idempotent application deployment
#[derive(Parser, Debug)]
#[command(name = "ledeploy")]
#[command(author = "LeDeploy Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy a web application onto a single host in resumable phases", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(global = true, long = "config", short = 'c', default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Directory holding the state and lock files
    #[arg(global = true, long = "state-dir")]
    pub state_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(global = true, long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the next incomplete phases
    Install {
        /// Re-apply resources and service on a complete installation
        #[arg(long = "reconfigure")]
        reconfigure: bool,
    },

    /// Verify every resource without changing anything
    Status {
        /// Print the report as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// Clear installation state and the run lock
    Reset {
        /// Do not ask for confirmation
        #[arg(long = "yes", short = 'y')]
        yes: bool,

        /// Stop and remove the service and back up the environment file first
        #[arg(long = "teardown")]
        teardown: bool,

        /// With --teardown, also drop the database and its role
        #[arg(long = "drop-database", requires = "teardown")]
        drop_database: bool,

        /// Remove the lock even when its holder is still running
        #[arg(long = "force")]
        force: bool,
    },

    /// Write a starting configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long = "force")]
        force: bool,
    },
}

impl Cli {
    /// Run the CLI and return the process exit status
    pub async fn run(self) -> i32 {
        match self.execute().await {
            Ok(code) => code,
            Err(err) => {
                report_error(&err);
                err.downcast_ref::<DeployError>()
                    .map(DeployError::exit_code)
                    .unwrap_or(EXIT_FAILURE)
            }
        }
    }

    async fn execute(self) -> AnyhowResult<i32> {
        if let Commands::Init { force } = self.command {
            let directive = std::env::var("LEDEPLOY_LOG").unwrap_or_else(|_| "info".to_string());
            init_logging_impl(self.verbose, &directive);
            return cmd_init_impl(&self.config, force);
        }

        let config = self.load_config()?;
        init_logging_impl(self.verbose, &config.log_level);
        debug!(config = ?config, "configuration loaded");

        let capabilities = Capabilities::system(&config)?;
        let deployment = Deployment::new(config, capabilities);

        match self.command {
            Commands::Install { reconfigure } => cmd_install_impl(deployment, reconfigure).await,
            Commands::Status { json } => cmd_status_impl(deployment, json).await,
            Commands::Reset {
                yes,
                teardown,
                drop_database,
                force,
            } => {
                let options = ResetOptions {
                    teardown: teardown.then_some(TeardownOptions { drop_database }),
                    force,
                };
                cmd_reset_impl(deployment, options, yes).await
            }
            Commands::Init { .. } => Ok(EXIT_OK),
        }
    }

    /// Load the configuration file, apply environment and flag overrides, validate
    pub fn load_config(&self) -> Result<DeployConfig, DeployError> {
        let mut config = DeployConfig::load(&self.config)?;
        config.apply_env();
        if let Some(dir) = &self.state_dir {
            let cwd = std::env::current_dir()
                .map_err(|e| DeployError::io_error("failed to read the working directory", dir, e))?;
            config.state.dir = Some(cwd.join(dir));
        }
        config.validate()?;
        Ok(config)
    }
}

/// Initialize logging implementation
fn init_logging_impl(verbose: bool, directive: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Install command implementation
async fn cmd_install_impl(deployment: Deployment, reconfigure: bool) -> AnyhowResult<i32> {
    let coordinator = deployment.coordinator();
    let lock_path = coordinator.context().lock_path();
    let request = if reconfigure {
        RunRequest::reconfigure()
    } else {
        RunRequest::install()
    };

    let report = match interruptible(&lock_path, move || coordinator.run(request)).await? {
        Some(result) => result.map_err(DeployError::from)?,
        None => return Ok(EXIT_INTERRUPTED),
    };

    print_run_report(&report);
    Ok(EXIT_OK)
}

/// Status command implementation
async fn cmd_status_impl(deployment: Deployment, json: bool) -> AnyhowResult<i32> {
    let reporter = deployment.reporter();
    let report = tokio::task::spawn_blocking(move || reporter.diagnose())
        .await
        .map_err(|e| DeployError::Task(e.to_string()))?;

    if json {
        let rendered =
            serde_json::to_string_pretty(&report).context("Failed to serialize diagnostics")?;
        println!("{}", rendered);
    } else {
        print_status(&report);
    }

    Ok(report.exit_code())
}

/// Reset command implementation
async fn cmd_reset_impl(deployment: Deployment, options: ResetOptions, yes: bool) -> AnyhowResult<i32> {
    let context = deployment.context();

    if !yes {
        let mut prompt = format!("Reset the installation recorded in {}?", context.state_path().display());
        if let Some(teardown) = options.teardown {
            prompt.push_str(" The service will be removed and the environment file backed up.");
            if teardown.drop_database {
                prompt.push_str(" The database and its role will be DROPPED.");
            }
        }
        if !confirm(&prompt)? {
            return Err(DeployError::Aborted("reset was not confirmed".to_string()).into());
        }
    }

    let coordinator = deployment.coordinator();
    let lock_path = context.lock_path();
    let report = match interruptible(&lock_path, move || coordinator.reset(options)).await? {
        Some(result) => result.map_err(DeployError::from)?,
        None => return Ok(EXIT_INTERRUPTED),
    };

    print_reset_report(&report);
    Ok(EXIT_OK)
}

/// Init command implementation
fn cmd_init_impl(path: &Path, force: bool) -> AnyhowResult<i32> {
    if path.exists() && !force {
        return Err(DeployError::AlreadyInitialized {
            path: path.to_path_buf(),
        }
        .into());
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| DeployError::io_error("failed to create directory", parent, e))?;
    }
    fs::write(path, DEFAULT_TEMPLATE)
        .map_err(|e| DeployError::io_error("failed to write configuration", path, e))?;

    info!(path = %path.display(), "configuration written");
    println!("Wrote {}", path.display());
    println!("Edit it, then run `ledeploy install`.");
    Ok(EXIT_OK)
}

/// Run blocking work on a worker thread until it finishes or the operator interrupts.
///
/// On interrupt the run lock is released if this process holds it and `None`
/// is returned; the caller exits without waiting for the worker.
async fn interruptible<T, F>(lock_path: &Path, work: F) -> Result<Option<T>, DeployError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);

    tokio::select! {
        joined = task => joined.map(Some).map_err(|e| DeployError::Task(e.to_string())),
        _ = shutdown_signal() => {
            release_after_interrupt(lock_path);
            Ok(None)
        }
    }
}

fn release_after_interrupt(lock_path: &Path) {
    match RunLock::release_if_held_by(lock_path, std::process::id()) {
        Ok(true) => warn!(lock = %lock_path.display(), "interrupted; run lock released"),
        Ok(false) => warn!("interrupted before the run lock was taken"),
        Err(e) => error!(error = %e, "interrupted; failed to release run lock"),
    }
    eprintln!("Interrupted. The installation stays at its last committed phase.");
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received interrupt signal");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix;
        match unix::signal(unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received TERM signal");
            }
            Err(e) => {
                warn!(error = %e, "failed to install TERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn confirm(prompt: &str) -> Result<bool, DeployError> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(false);
    }

    eprint!("{} [y/N] ", prompt);
    let _ = io::stderr().flush();

    let mut answer = String::new();
    stdin
        .read_line(&mut answer)
        .map_err(|e| DeployError::io_error("failed to read confirmation", "<stdin>", e))?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_run_report(report: &RunReport) {
    for phase in &report.phases {
        println!("✓ {}", phase.phase);
        for resource in &phase.resources {
            let state = if resource.already_present {
                "already present"
            } else {
                "created"
            };
            println!("  {} ({})", resource.resource, state);
            for warning in &resource.warnings {
                println!("    warning: {}", warning);
            }
        }
    }

    println!();
    match report.outcome {
        RunOutcome::SessionBoundary => {
            println!("Dependencies installed.");
            println!("Open a new shell session so newly installed programs are on PATH,");
            println!("then run `ledeploy install` again to provision resources.");
        }
        RunOutcome::Completed => println!("Installation complete."),
        RunOutcome::AlreadyComplete => {
            println!("Installation already complete; nothing to do.");
            println!("Run `ledeploy install --reconfigure` to re-apply resources and service.");
        }
        RunOutcome::Reconfigured => println!("Resources and service re-applied."),
    }
    println!("Phase: {}", report.final_phase);
}

fn print_status(report: &DiagnosticsReport) {
    match report.phase {
        Some(phase) => println!("Phase: {}", phase),
        None => println!("Phase: unknown"),
    }
    println!();

    if report.issues.is_empty() {
        println!("No issues found.");
        return;
    }

    for issue in &report.issues {
        let label = match issue.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN ",
        };
        println!("{}  {}: {}", label, issue.subject, issue.message);
        if !issue.remediation_hint.is_empty() {
            println!("       hint: {}", issue.remediation_hint);
        }
    }
    println!();
    println!(
        "{} error(s), {} warning(s)",
        report.error_count(),
        report.warning_count()
    );
}

fn print_reset_report(report: &ResetReport) {
    if report.lock_overridden {
        println!("Removed a run lock left by another process.");
    }
    for resource in &report.torn_down {
        println!("  torn down {}", resource);
    }
    if report.state_removed {
        println!("Reset from phase {}.", report.previous_phase);
    } else {
        println!("No installation state to reset.");
    }
}

fn report_error(err: &anyhow::Error) {
    debug!(error = ?err, "command failed");
    eprintln!("error: {:#}", err);

    if let Some(deploy) = err.downcast_ref::<DeployError>() {
        if let Some(output) = deploy.tool_output() {
            eprintln!("\ntool output:\n{}", output.trim_end());
        }
        if let Some(hint) = deploy.suggestion() {
            eprintln!("\nhint: {}", hint);
        }
    }
}

/// Main entry point for the CLI
pub async fn main() -> i32 {
    Cli::parse().run().await
}
