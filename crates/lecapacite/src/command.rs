//! Process execution for capability adapters.
//!
//! Every external tool is invoked through [`CommandSpec::run`], which captures
//! stdout/stderr and turns a non-zero exit into a [`CommandFailure`]. A program
//! that cannot be spawned because it does not exist is reported the same way a
//! shell would report it: exit status 127.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

use crate::EXIT_COMMAND_NOT_FOUND;

/// Result type for capability operations
pub type Result<T> = std::result::Result<T, CapabilityError>;

/// Errors raised by capability adapters
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// An external command ran and failed
    #[error(transparent)]
    Command(#[from] CommandFailure),

    /// Local filesystem access failed
    #[error("I/O error: {context}")]
    Io {
        /// What was being attempted
        context: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl CapabilityError {
    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        CapabilityError::Io {
            context: context.into(),
            source,
        }
    }

    /// The command failure behind this error, if any
    pub fn command_failure(&self) -> Option<&CommandFailure> {
        match self {
            CapabilityError::Command(failure) => Some(failure),
            CapabilityError::Io { .. } => None,
        }
    }
}

/// A command that exited unsuccessfully, with everything it printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Program that was invoked
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Exit status, `None` when terminated by a signal
    pub status: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandFailure {
    /// Build a failure for a program and its exit status.
    pub fn new(program: impl Into<String>, args: Vec<String>, status: Option<i32>) -> Self {
        Self {
            program: program.into(),
            args,
            status,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Attach captured stderr.
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Failure reported when the program itself does not exist.
    pub fn not_found(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let stderr = format!("{}: command not found", program);
        Self::new(program, args, Some(EXIT_COMMAND_NOT_FOUND)).with_stderr(stderr)
    }

    /// Full command line as typed by an operator.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True when the exit status or output indicates a missing command.
    pub fn is_command_not_found(&self) -> bool {
        self.status == Some(EXIT_COMMAND_NOT_FOUND) || self.mentions("command not found")
    }

    /// True when the tool refused because the object already exists.
    pub fn is_already_exists(&self) -> bool {
        self.mentions("already exists")
    }

    /// Case-insensitive search over stdout and stderr.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.stderr.to_ascii_lowercase().contains(&needle)
            || self.stdout.to_ascii_lowercase().contains(&needle)
    }

    /// Combined tool output, stderr first, for operator diagnosis.
    pub fn output_text(&self) -> String {
        match (self.stderr.trim(), self.stdout.trim()) {
            ("", "") => String::new(),
            (err, "") => err.to_string(),
            ("", out) => out.to_string(),
            (err, out) => format!("{}\n{}", err, out),
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            Some(code) => format!("exit status {}", code),
            None => "termination by signal".to_string(),
        };
        let detail = self.stderr.lines().rev().find(|line| !line.trim().is_empty());
        match detail {
            Some(line) => write!(f, "`{}` failed with {}: {}", self.command_line(), status, line.trim()),
            None => write!(f, "`{}` failed with {}", self.command_line(), status),
        }
    }
}

impl std::error::Error for CommandFailure {}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Description of one external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Create a spec for a program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// Build a spec from an argv-style list; `None` when the list is empty.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = argv.into_iter().map(Into::into);
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }

    /// Split a whitespace-separated command line into a spec.
    pub fn parse(line: &str) -> Option<Self> {
        Self::from_argv(line.split_whitespace())
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the child's working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Run the command to completion and capture its output.
    pub fn run(&self) -> Result<CommandOutput> {
        debug!(command = %self.display_line(), "running external command");

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let output = match command.output() {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CommandFailure::not_found(&self.program, self.args.clone()).into());
            }
            Err(err) => {
                return Err(CapabilityError::io(
                    format!("failed to spawn `{}`", self.display_line()),
                    err,
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            Err(CommandFailure {
                program: self.program.clone(),
                args: self.args.clone(),
                status: output.status.code(),
                stdout,
                stderr,
            }
            .into())
        }
    }

    /// Run the command and report only whether it exited successfully.
    ///
    /// A missing program counts as "no". Spawn errors still propagate.
    pub fn probe(&self) -> Result<bool> {
        match self.run() {
            Ok(_) => Ok(true),
            Err(CapabilityError::Command(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Prefix a command with an elevation/impersonation wrapper such as `sudo -u postgres`.
pub fn with_prefix(prefix: &[String], spec: CommandSpec) -> CommandSpec {
    match prefix.split_first() {
        None => spec,
        Some((program, rest)) => {
            let mut wrapped = CommandSpec::new(program.clone())
                .args(rest.iter().cloned())
                .arg(spec.program)
                .args(spec.args);
            wrapped.env = spec.env;
            wrapped.current_dir = spec.current_dir;
            wrapped
        }
    }
}
