//! SSH and SCP transport built on the system client binaries.
//!
//! Commands are spawned through a [`CommandRunner`] so tests can substitute
//! scripted outputs. The process runner kills the local client when its
//! future is dropped, which is how per-target timeouts tear sessions down.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use camino::Utf8Path;
use thiserror::Error;
use tokio::process::Command;

use crate::connection::ConnectionDescriptor;
use crate::operation::{TransferDirection, TransferSpec};

/// Exit status reserved by `ssh` for its own connection failures.
pub const SSH_CONNECTION_FAILURE_CODE: i32 = 255;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised before a command produces an exit status.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when local filesystem preparation fails.
    #[error("failed to prepare {path}: {message}")]
    LocalPath {
        /// Local path that could not be prepared.
        path: String,
        /// Operating system error string.
        message: String,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, TransportError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// Dropping the returned future must abandon the command.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a>;
}

/// Real command runner that spawns processes on the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        Box::pin(async move {
            let mut command = Command::new(program);
            command.args(args).stdin(Stdio::null()).kill_on_drop(true);
            // A terminal interrupt reaches the whole foreground group; clients
            // sit in their own group so only the cancellation token reacts.
            #[cfg(unix)]
            command.process_group(0);
            let output = command
                .output()
                .await
                .map_err(|err| TransportError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Client binaries and options shared by every session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Force batch mode to avoid password prompts.
    pub batch_mode: bool,
    /// Enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; empty leaves the client default.
    pub known_hosts_file: String,
    /// TCP connect timeout handed to the client.
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            connect_timeout_secs: 10,
        }
    }
}

/// Runs commands and transfers against resolved connection descriptors.
#[derive(Clone, Debug)]
pub struct SshTransport<R: CommandRunner> {
    settings: SshSettings,
    runner: R,
}

impl SshTransport<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub const fn with_process_runner(settings: SshSettings) -> Self {
        Self::new(settings, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshTransport<R> {
    /// Creates a transport using the provided runner.
    #[must_use]
    pub const fn new(settings: SshSettings, runner: R) -> Self {
        Self { settings, runner }
    }

    /// Returns the client settings.
    #[must_use]
    pub const fn settings(&self) -> &SshSettings {
        &self.settings
    }

    /// Executes `remote_command` over SSH and captures its output.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] when the client cannot be started.
    ///
    /// # Security
    ///
    /// `remote_command` is passed verbatim to the remote shell; callers must
    /// quote untrusted input upstream.
    pub async fn run_command(
        &self,
        descriptor: &ConnectionDescriptor,
        remote_command: &str,
    ) -> Result<CommandOutput, TransportError> {
        let args = self.build_ssh_args(descriptor, remote_command);
        self.runner.run(&self.settings.ssh_bin, &args).await
    }

    /// Copies files with `scp` according to `spec`, using `local` as the
    /// local-side path.
    ///
    /// Download destinations are created before the copy starts.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::LocalPath`] when the download directory
    /// cannot be created, or [`TransportError::Spawn`] when the client cannot
    /// be started.
    pub async fn transfer(
        &self,
        descriptor: &ConnectionDescriptor,
        spec: &TransferSpec,
        local: &Utf8Path,
    ) -> Result<CommandOutput, TransportError> {
        if spec.direction == TransferDirection::Download {
            tokio::fs::create_dir_all(local)
                .await
                .map_err(|err| TransportError::LocalPath {
                    path: local.to_string(),
                    message: err.to_string(),
                })?;
        }
        let args = self.build_scp_args(descriptor, spec, local);
        self.runner.run(&self.settings.scp_bin, &args).await
    }

    pub(crate) fn build_ssh_args(
        &self,
        descriptor: &ConnectionDescriptor,
        remote_command: &str,
    ) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-T"),
            OsString::from("-p"),
            OsString::from(descriptor.port.to_string()),
        ];
        args.extend(self.common_options(descriptor));
        args.push(OsString::from(descriptor.login()));
        args.push(OsString::from(remote_command));
        args
    }

    pub(crate) fn build_scp_args(
        &self,
        descriptor: &ConnectionDescriptor,
        spec: &TransferSpec,
        local: &Utf8Path,
    ) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-P"),
            OsString::from(descriptor.port.to_string()),
        ];
        if spec.recursive {
            args.push(OsString::from("-r"));
        }
        args.extend(self.common_options(descriptor));

        let remote = descriptor.remote_path(spec.remote_path().as_str());
        match spec.direction {
            TransferDirection::Upload => {
                args.push(OsString::from(local.as_str()));
                args.push(OsString::from(remote));
            }
            TransferDirection::Download => {
                args.push(OsString::from(remote));
                args.push(OsString::from(format!("{local}/")));
            }
        }
        args
    }

    fn common_options(&self, descriptor: &ConnectionDescriptor) -> Vec<OsString> {
        let mut args = Vec::new();

        if let Some(ref identity_file) = descriptor.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.settings.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.settings.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.settings.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.settings.known_hosts_file
            )));
        }

        if self.settings.connect_timeout_secs > 0 {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout_secs
            )));
        }

        args
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use flotilla::transport::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
