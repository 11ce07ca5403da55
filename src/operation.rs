//! Operations dispatched to targets: remote commands and file transfers.

use std::collections::BTreeSet;
use std::fmt;

use camino::Utf8PathBuf;

use crate::report::OutputFilter;
use crate::target::Target;

/// A remote shell command executed over SSH.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    /// Command line passed verbatim to the remote shell.
    pub command: String,
    /// Optional filter hiding known-benign lines from the rendered report.
    pub output_filter: Option<OutputFilter>,
}

impl CommandSpec {
    /// Creates a command with no output filter.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output_filter: None,
        }
    }

    /// Attaches an output filter used when rendering this command's output.
    #[must_use]
    pub fn with_output_filter(mut self, filter: OutputFilter) -> Self {
        self.output_filter = Some(filter);
        self
    }
}

/// Direction of a file transfer relative to the local host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    /// Local `source` is copied to remote `destination` on every target.
    Upload,
    /// Remote `source` is copied from every target into
    /// `destination/<display_name>/` locally, or
    /// `destination/<display_name>-<id>/` when the name is shared.
    Download,
}

/// A file copy between the local host and each target.
#[derive(Clone, Debug)]
pub struct TransferSpec {
    /// Path being copied.
    pub source: Utf8PathBuf,
    /// Path receiving the copy.
    pub destination: Utf8PathBuf,
    /// Whether the copy flows to or from the target.
    pub direction: TransferDirection,
    /// Copy directories recursively.
    pub recursive: bool,
    /// Optional filter hiding known-benign lines from the rendered report.
    pub output_filter: Option<OutputFilter>,
    /// Display names carried by more than one target of the batch.
    shared_names: BTreeSet<String>,
}

impl TransferSpec {
    /// Creates a non-recursive upload.
    #[must_use]
    pub fn upload(source: impl Into<Utf8PathBuf>, destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            direction: TransferDirection::Upload,
            recursive: false,
            output_filter: None,
            shared_names: BTreeSet::new(),
        }
    }

    /// Creates a non-recursive download.
    #[must_use]
    pub fn download(source: impl Into<Utf8PathBuf>, destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            direction: TransferDirection::Download,
            recursive: false,
            output_filter: None,
            shared_names: BTreeSet::new(),
        }
    }

    /// Enables or disables recursive copying.
    #[must_use]
    pub const fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Attaches an output filter used when rendering the client's output.
    #[must_use]
    pub fn with_output_filter(mut self, filter: OutputFilter) -> Self {
        self.output_filter = Some(filter);
        self
    }

    /// Records which display names repeat across `targets`, so their
    /// download directories are suffixed with the target id.
    #[must_use]
    pub fn with_batch_targets(mut self, targets: &[Target]) -> Self {
        let mut seen = BTreeSet::new();
        self.shared_names = targets
            .iter()
            .filter(|target| !seen.insert(target.display_name.as_str()))
            .map(|target| target.display_name.clone())
            .collect();
        self
    }

    /// Returns the remote-side path of this transfer.
    #[must_use]
    pub fn remote_path(&self) -> &Utf8PathBuf {
        match self.direction {
            TransferDirection::Upload => &self.destination,
            TransferDirection::Download => &self.source,
        }
    }

    /// Returns the local-side path used for `target`.
    ///
    /// Downloads fan in to one directory per target. A display name shared
    /// with another target of the batch gets the target id appended.
    #[must_use]
    pub fn local_path_for(&self, target: &Target) -> Utf8PathBuf {
        match self.direction {
            TransferDirection::Upload => self.source.clone(),
            TransferDirection::Download if self.shared_names.contains(&target.display_name) => {
                self.destination
                    .join(format!("{}-{}", target.display_name, target.id))
            }
            TransferDirection::Download => self.destination.join(&target.display_name),
        }
    }
}

/// One unit of work applied to every selected target.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Run a remote command.
    Command(CommandSpec),
    /// Copy files to or from the target.
    Transfer(TransferSpec),
}

impl Operation {
    /// Returns the rendering filter attached to the operation, if any.
    #[must_use]
    pub const fn output_filter(&self) -> Option<&OutputFilter> {
        match self {
            Self::Command(spec) => spec.output_filter.as_ref(),
            Self::Transfer(spec) => spec.output_filter.as_ref(),
        }
    }

    /// Binds the operation to the targets of one batch.
    #[must_use]
    pub fn for_batch(self, targets: &[Target]) -> Self {
        match self {
            Self::Transfer(spec) => Self::Transfer(spec.with_batch_targets(targets)),
            command @ Self::Command(_) => command,
        }
    }

    /// Describes what the operation would do on `target`, used for dry runs.
    #[must_use]
    pub fn describe_for(&self, target: &Target) -> String {
        match self {
            Self::Command(spec) => format!("would execute: {} on {target}", spec.command),
            Self::Transfer(spec) => {
                let local = spec.local_path_for(target);
                match spec.direction {
                    TransferDirection::Upload => format!(
                        "would execute: upload {local} to {target}:{}",
                        spec.destination
                    ),
                    TransferDirection::Download => format!(
                        "would execute: download {target}:{} to {local}",
                        spec.source
                    ),
                }
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(spec) => write!(f, "command '{}'", spec.command),
            Self::Transfer(spec) => match spec.direction {
                TransferDirection::Upload => {
                    write!(f, "upload {} -> {}", spec.source, spec.destination)
                }
                TransferDirection::Download => {
                    write!(f, "download {} -> {}", spec.source, spec.destination)
                }
            },
        }
    }
}
