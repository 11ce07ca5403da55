//! Per-target execution with timeout enforcement and outcome classification.
//!
//! [`Executor::execute`] runs exactly one operation against exactly one
//! target and always returns exactly one [`ExecutionResult`]; per-target
//! conditions are values, never errors crossing the worker boundary.
//!
//! A timed-out operation is abandoned locally: the client process is killed
//! when its future is dropped, closing the session. The remote process is not
//! explicitly signalled.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::connection::{ConnectionDescriptor, ConnectionResolver};
use crate::operation::{Operation, TransferSpec};
use crate::path_filter::PathFilter;
use crate::target::Target;
use crate::transport::{
    CommandOutput, CommandRunner, SSH_CONNECTION_FAILURE_CODE, SshTransport, TransportError,
};

/// Classification of an unsuccessful work item.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailureKind {
    /// The target could not be resolved, reached, or authenticated.
    Connection,
    /// The remote command or copy finished with a non-zero status.
    RemoteCommand,
    /// A transfer path was rejected by the security filter.
    SecurityFiltered,
    /// The local client could not be started or the local path prepared.
    Local,
    /// The operation exceeded its timeout.
    Timeout,
    /// The item was never started because the batch was cancelled.
    Cancelled,
}

impl FailureKind {
    /// Returns the stable snake-case label used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::RemoteCommand => "remote_command",
            Self::SecurityFiltered => "security_filtered",
            Self::Local => "local",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one work item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed for a classified reason.
    Failure {
        /// Failure classification.
        kind: FailureKind,
        /// Human-readable detail.
        message: String,
    },
    /// The operation did not complete within its timeout.
    TimedOut,
    /// The item was never started.
    Cancelled,
}

impl Outcome {
    /// Returns `true` for [`Outcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns the failure classification, or `None` on success.
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success => None,
            Self::Failure { kind, .. } => Some(*kind),
            Self::TimedOut => Some(FailureKind::Timeout),
            Self::Cancelled => Some(FailureKind::Cancelled),
        }
    }
}

/// Lifecycle of a work item. Terminal states are final.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionState {
    /// Created but not yet picked up by a worker.
    Pending,
    /// Resolving the connection descriptor.
    Resolving,
    /// Running the operation.
    Executing,
    /// Finished successfully.
    Succeeded,
    /// Finished with a classified failure.
    Failed,
    /// Exceeded its timeout.
    TimedOut,
    /// Never started because the batch was cancelled.
    Cancelled,
}

impl ExecutionState {
    /// Returns `true` for states no item ever leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl From<&Outcome> for ExecutionState {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Succeeded,
            Outcome::Failure { .. } => Self::Failed,
            Outcome::TimedOut => Self::TimedOut,
            Outcome::Cancelled => Self::Cancelled,
        }
    }
}

/// One operation bound to one target for one invocation.
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// Target the operation runs against.
    pub target: Target,
    /// Operation shared by every item of the batch.
    pub operation: Arc<Operation>,
    /// Hard limit on the operation's duration.
    pub timeout: Duration,
    /// Short-circuit to a synthetic success without side effects.
    pub dry_run: bool,
}

/// The single result produced for a work item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionResult {
    /// Identifier of the target.
    pub target_id: String,
    /// Display name of the target, used for ordering and prefixes.
    pub display_name: String,
    /// Terminal outcome.
    pub outcome: Outcome,
    /// Exit code reported by the client, when one was observed.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Time spent on the item; equals the timeout bound for timed-out items.
    pub duration: Duration,
}

impl ExecutionResult {
    /// Builds a result carrying no output.
    #[must_use]
    pub fn without_output(target: &Target, outcome: Outcome, duration: Duration) -> Self {
        Self {
            target_id: target.id.clone(),
            display_name: target.display_name.clone(),
            outcome,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration,
        }
    }

    /// Builds the result recorded for an item that never started.
    #[must_use]
    pub fn cancelled(target: &Target) -> Self {
        Self::without_output(target, Outcome::Cancelled, Duration::ZERO)
    }

    /// Returns `true` when the outcome is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Returns the first line describing why the item failed.
    ///
    /// Prefers the classified message, falling back to the first non-empty
    /// stderr line.
    #[must_use]
    pub fn first_detail_line(&self) -> String {
        let from_outcome = match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure { message, .. } => first_line(message),
            Outcome::TimedOut => Some(format!(
                "timed out after {:.2}s",
                self.duration.as_secs_f64()
            )),
            Outcome::Cancelled => Some(String::from("cancelled before start")),
        };
        from_outcome
            .or_else(|| first_line(&self.stderr))
            .unwrap_or_default()
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
}

/// Runs work items against targets using a shared transport, resolver, and
/// path filter.
pub struct Executor<R: CommandRunner> {
    transport: Arc<SshTransport<R>>,
    resolver: Arc<dyn ConnectionResolver>,
    path_filter: Arc<dyn PathFilter>,
}

impl<R: CommandRunner> fmt::Debug for Executor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("settings", self.transport.settings())
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner> Executor<R> {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        transport: Arc<SshTransport<R>>,
        resolver: Arc<dyn ConnectionResolver>,
        path_filter: Arc<dyn PathFilter>,
    ) -> Self {
        Self {
            transport,
            resolver,
            path_filter,
        }
    }

    /// Executes `item` and classifies its outcome.
    pub async fn execute(&self, item: &WorkItem) -> ExecutionResult {
        let target = &item.target;

        if item.dry_run {
            let mut result =
                ExecutionResult::without_output(target, Outcome::Success, Duration::ZERO);
            result.stdout = item.operation.describe_for(target);
            log_transition(target, ExecutionState::Succeeded);
            return result;
        }

        let started = Instant::now();
        log_transition(target, ExecutionState::Resolving);
        let descriptor = match self.resolver.resolve(&target.id) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                let outcome = Outcome::Failure {
                    kind: FailureKind::Connection,
                    message: err.to_string(),
                };
                return finish(ExecutionResult::without_output(
                    target,
                    outcome,
                    started.elapsed(),
                ));
            }
        };

        if let Operation::Transfer(spec) = item.operation.as_ref()
            && let Some(message) = self.rejected_path(spec, target)
        {
            let outcome = Outcome::Failure {
                kind: FailureKind::SecurityFiltered,
                message,
            };
            return finish(ExecutionResult::without_output(
                target,
                outcome,
                started.elapsed(),
            ));
        }

        log_transition(target, ExecutionState::Executing);
        let attempt = timeout(
            item.timeout,
            self.perform(&descriptor, target, &item.operation),
        )
        .await;

        let result = match attempt {
            Err(_elapsed) => {
                ExecutionResult::without_output(target, Outcome::TimedOut, item.timeout)
            }
            Ok(Err(err)) => ExecutionResult::without_output(
                target,
                Outcome::Failure {
                    kind: FailureKind::Local,
                    message: err.to_string(),
                },
                started.elapsed(),
            ),
            Ok(Ok(output)) => classify(target, output, started.elapsed()),
        };
        finish(result)
    }

    async fn perform(
        &self,
        descriptor: &ConnectionDescriptor,
        target: &Target,
        operation: &Operation,
    ) -> Result<CommandOutput, TransportError> {
        match operation {
            Operation::Command(spec) => self.transport.run_command(descriptor, &spec.command).await,
            Operation::Transfer(spec) => {
                let local = spec.local_path_for(target);
                self.transport.transfer(descriptor, spec, &local).await
            }
        }
    }

    fn rejected_path(&self, spec: &TransferSpec, target: &Target) -> Option<String> {
        let remote = spec.remote_path();
        if !self.path_filter.is_allowed(remote) {
            return Some(format!("remote path {remote} rejected by security filter"));
        }
        let local = spec.local_path_for(target);
        if !self.path_filter.is_allowed(&local) {
            return Some(format!("local path {local} rejected by security filter"));
        }
        None
    }
}

fn classify(target: &Target, output: CommandOutput, duration: Duration) -> ExecutionResult {
    let outcome = match output.code {
        Some(0) => Outcome::Success,
        Some(SSH_CONNECTION_FAILURE_CODE) => Outcome::Failure {
            kind: FailureKind::Connection,
            message: first_line(&output.stderr).unwrap_or_else(|| {
                format!("ssh exited with status {SSH_CONNECTION_FAILURE_CODE}")
            }),
        },
        Some(code) => Outcome::Failure {
            kind: FailureKind::RemoteCommand,
            message: first_line(&output.stderr).map_or_else(
                || format!("exited with status {code}"),
                |line| format!("exited with status {code}: {line}"),
            ),
        },
        None => Outcome::Failure {
            kind: FailureKind::RemoteCommand,
            message: String::from("terminated without an exit status"),
        },
    };

    ExecutionResult {
        target_id: target.id.clone(),
        display_name: target.display_name.clone(),
        outcome,
        exit_code: output.code,
        stdout: output.stdout,
        stderr: output.stderr,
        duration,
    }
}

fn finish(result: ExecutionResult) -> ExecutionResult {
    let state = ExecutionState::from(&result.outcome);
    match &result.outcome {
        Outcome::Success => debug!(
            host = %result.display_name,
            elapsed_ms = result.duration.as_millis(),
            ?state,
            "work item finished"
        ),
        Outcome::TimedOut => warn!(
            host = %result.display_name,
            timeout_ms = result.duration.as_millis(),
            "work item timed out"
        ),
        Outcome::Failure { kind, message } => warn!(
            host = %result.display_name,
            kind = %kind,
            elapsed_ms = result.duration.as_millis(),
            "work item failed: {message}"
        ),
        Outcome::Cancelled => warn!(host = %result.display_name, "work item cancelled"),
    }
    result
}

fn log_transition(target: &Target, state: ExecutionState) {
    debug!(host = %target.display_name, id = %target.id, ?state, "work item transition");
}
