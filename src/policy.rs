//! Partial-failure policy: continue-vs-abort, the destructive-operation gate,
//! and the process exit signal.

use thiserror::Error;

use crate::executor::ExecutionResult;
use crate::operation::Operation;

/// Command verbs that require explicit confirmation before dispatch.
pub const DESTRUCTIVE_VERBS: &[&str] = &["shutdown", "poweroff", "reboot", "halt", "rm"];

/// Exit status for a batch where every target succeeded.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit status for a batch with at least one failed target.
pub const EXIT_PARTIAL_FAILURE: i32 = 1;

/// Behaviour of the dispatcher once a target fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Keep dispatching to every remaining target.
    #[default]
    ContinueOnError,
    /// Stop handing out new items after the first failure; unstarted items
    /// are recorded as cancelled.
    FailFast,
}

impl FailurePolicy {
    /// Returns `true` when `result` should stop further scheduling.
    #[must_use]
    pub const fn halts_after(self, result: &ExecutionResult) -> bool {
        match self {
            Self::ContinueOnError => false,
            Self::FailFast => !result.is_success(),
        }
    }
}

/// Errors raised by the confirmation gate.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PolicyError {
    /// A destructive command was requested without confirmation.
    #[error("'{verb}' is destructive; pass --yes to run it against the selected targets")]
    ConfirmationRequired {
        /// Destructive verb found in the command.
        verb: String,
    },
}

/// Maps the overall batch outcome to a process exit status.
#[must_use]
pub const fn exit_code(overall_success: bool) -> i32 {
    if overall_success {
        EXIT_SUCCESS
    } else {
        EXIT_PARTIAL_FAILURE
    }
}

/// Returns the destructive verb `command` starts with, if any.
///
/// Leading `sudo` and absolute paths are looked through, so
/// `sudo /sbin/reboot` is recognised.
#[must_use]
pub fn destructive_verb(command: &str) -> Option<&'static str> {
    let mut words = command.split_whitespace();
    let mut first = words.next()?;
    if first == "sudo" {
        first = words.next()?;
    }
    let program = first.rsplit('/').next().unwrap_or(first);
    DESTRUCTIVE_VERBS
        .iter()
        .copied()
        .find(|verb| *verb == program)
}

/// Returns `true` when `operation` needs confirmation before dispatch.
#[must_use]
pub fn is_destructive(operation: &Operation) -> bool {
    match operation {
        Operation::Command(spec) => destructive_verb(&spec.command).is_some(),
        Operation::Transfer(_) => false,
    }
}

/// Checks the confirmation gate for `operation`.
///
/// # Errors
///
/// Returns [`PolicyError::ConfirmationRequired`] when the operation is
/// destructive and `confirmed` is `false`.
pub fn authorize(operation: &Operation, confirmed: bool) -> Result<(), PolicyError> {
    if confirmed {
        return Ok(());
    }
    match operation {
        Operation::Command(spec) => destructive_verb(&spec.command).map_or(Ok(()), |verb| {
            Err(PolicyError::ConfirmationRequired {
                verb: verb.to_owned(),
            })
        }),
        Operation::Transfer(_) => Ok(()),
    }
}
