use lecapacite::{CapabilityError, CommandFailure};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::failure::{ErrorKind, FailureCategory};
use crate::remediation::RemediationRegistry;

/// Default attempt budget for one operation.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Terminal failure of an executed operation.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct ExecutionError {
    /// Operation label
    pub operation: String,
    /// Recognised category, `None` when unclassifiable
    pub category: Option<FailureCategory>,
    /// Attempts made
    pub attempts: usize,
    /// Last failure observed
    #[source]
    pub source: CapabilityError,
}

impl ExecutionError {
    /// Error kind derived from the category.
    pub fn kind(&self) -> ErrorKind {
        self.category
            .map(FailureCategory::kind)
            .unwrap_or(ErrorKind::Unclassified)
    }

    /// The originating tool's output, if the failure came from a command.
    pub fn tool_output(&self) -> Option<String> {
        self.source
            .command_failure()
            .map(CommandFailure::output_text)
            .filter(|text| !text.is_empty())
    }
}

/// Runs flaky operations with classification, remediation and bounded retries.
#[derive(Debug, Clone)]
pub struct RetryingExecutor {
    registry: Arc<RemediationRegistry>,
    max_attempts: usize,
    retry_delay: Duration,
}

impl RetryingExecutor {
    /// Executor with the default attempt budget and delay.
    pub fn new(registry: Arc<RemediationRegistry>) -> Self {
        Self {
            registry,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the attempt budget (at least one attempt is always made).
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Override the fixed pause between attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Attempt budget.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, a failure is unclassifiable or has no
    /// remediation, or the attempt budget is spent.
    pub fn execute<T, F, C>(
        &self,
        operation: &str,
        mut run: F,
        classify: C,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut() -> lecapacite::Result<T>,
        C: Fn(&CommandFailure) -> Option<FailureCategory>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(operation, attempt, "executing");

            let err = match run() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let terminal = |category: Option<FailureCategory>, source: CapabilityError| {
                ExecutionError {
                    operation: operation.to_string(),
                    category,
                    attempts: attempt,
                    source,
                }
            };

            let Some(category) = err.command_failure().and_then(&classify) else {
                warn!(operation, attempt, error = %err, "unclassified failure");
                return Err(terminal(None, err));
            };

            if attempt >= self.max_attempts {
                warn!(operation, attempt, %category, "attempt budget exhausted");
                return Err(terminal(Some(category), err));
            }

            let Some(action) = self.registry.lookup(category) else {
                warn!(operation, attempt, %category, "no remediation registered");
                return Err(terminal(Some(category), err));
            };

            warn!(
                operation,
                attempt,
                %category,
                remediation = %action.kind(),
                error = %err,
                "remediating before retry"
            );
            if let Err(remedy_err) = action.apply() {
                warn!(operation, remediation = %action.kind(), error = %remedy_err, "remediation failed");
            }

            if !self.retry_delay.is_zero() {
                thread::sleep(self.retry_delay);
            }
        }
    }
}
