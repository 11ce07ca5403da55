//! Command-line interface definitions for the `flotilla` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `flotilla` binary.
#[derive(Debug, Parser)]
#[command(
    name = "flotilla",
    about = "Run commands and copy files across a fleet of hosts over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a shell command on every selected target.
    #[command(name = "exec", about = "Run a shell command on every selected target")]
    Exec(ExecCommand),
    /// Copy files to or from every selected target.
    #[command(name = "copy", about = "Copy files to or from every selected target")]
    Copy(CopyCommand),
    /// List the targets a selection resolves to.
    #[command(name = "list", about = "List the targets a selection resolves to")]
    List(ListCommand),
}

/// Mutually exclusive target selection flags.
#[derive(Debug, Default, Args)]
#[group(id = "selection", multiple = false)]
pub(crate) struct SelectionArgs {
    /// Select a target by id or name; repeat for several.
    #[arg(long = "target", short = 't', value_name = "NAME")]
    pub(crate) targets: Vec<String>,
    /// Select targets carrying a tag, optionally with a given value.
    #[arg(long, value_name = "KEY[=VALUE]")]
    pub(crate) tag: Option<String>,
    /// Select targets whose name matches a glob pattern.
    #[arg(long, value_name = "GLOB")]
    pub(crate) pattern: Option<String>,
    /// Select every target in the inventory.
    #[arg(long)]
    pub(crate) all: bool,
}

/// Options shared by commands that dispatch work.
#[derive(Debug, Default, Args)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "each flag is an independent command-line switch"
)]
pub(crate) struct RunArgs {
    /// JSON inventory file; overrides `inventory_file` from configuration.
    #[arg(long, value_name = "FILE")]
    pub(crate) inventory: Option<String>,
    /// Maximum number of targets contacted concurrently.
    #[arg(long, short = 'w', value_name = "N")]
    pub(crate) workers: Option<usize>,
    /// Per-target timeout in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Describe what would run without contacting any target.
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// Group output per target instead of prefixing every line.
    #[arg(long)]
    pub(crate) grouped: bool,
    /// Stop dispatching new targets after the first failure.
    #[arg(long)]
    pub(crate) fail_fast: bool,
    /// Hide output lines matching a regular expression; repeatable.
    #[arg(long = "filter", value_name = "REGEX")]
    pub(crate) filters: Vec<String>,
    /// Stream each target's output to stderr as soon as it finishes.
    #[arg(long)]
    pub(crate) progress: bool,
    /// Confirm destructive commands such as `reboot` or `rm`.
    #[arg(long, short = 'y')]
    pub(crate) yes: bool,
}

/// Arguments for the `flotilla exec` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ExecCommand {
    #[command(flatten)]
    pub(crate) selection: SelectionArgs,
    #[command(flatten)]
    pub(crate) run: RunArgs,
    /// Command to execute on every target (use -- to separate flags). A
    /// single argument is passed to the remote shell verbatim.
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `flotilla copy` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CopyCommand {
    #[command(flatten)]
    pub(crate) selection: SelectionArgs,
    #[command(flatten)]
    pub(crate) run: RunArgs,
    /// Copy from each target into `DESTINATION/<target name>/` instead of
    /// uploading.
    #[arg(long)]
    pub(crate) download: bool,
    /// Copy directories recursively.
    #[arg(long, short = 'r')]
    pub(crate) recursive: bool,
    /// Local path when uploading, remote path when downloading.
    #[arg(value_name = "SOURCE")]
    pub(crate) source: String,
    /// Remote path when uploading, local directory when downloading.
    #[arg(value_name = "DESTINATION")]
    pub(crate) destination: String,
}

/// Arguments for the `flotilla list` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ListCommand {
    #[command(flatten)]
    pub(crate) selection: SelectionArgs,
    /// JSON inventory file; overrides `inventory_file` from configuration.
    #[arg(long, value_name = "FILE")]
    pub(crate) inventory: Option<String>,
}
