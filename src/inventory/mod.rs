//! Inventory providers producing the target snapshot for one invocation.
//!
//! Providers are consulted before a batch starts; the dispatcher itself never
//! performs discovery.

use std::collections::HashSet;
use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::target::{ConnectionRef, Tags, Target};
use crate::transport::{CommandOutput, CommandRunner, ProcessCommandRunner, TransportError};

/// Default Scaleway CLI binary name.
pub const DEFAULT_SCW_BIN: &str = "scw";

/// Errors raised while loading an inventory.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InventoryError {
    /// Raised when the inventory file cannot be read.
    #[error("failed to read inventory {path}: {message}")]
    Io {
        /// Inventory path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when inventory data cannot be parsed.
    #[error("failed to parse {source_name} inventory: {message}")]
    Parse {
        /// File path or provider name.
        source_name: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when two records share an identifier.
    #[error("duplicate target id '{id}' in inventory")]
    DuplicateId {
        /// Repeated identifier.
        id: String,
    },
    /// Raised when the provider CLI exits unsuccessfully.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when the provider CLI cannot be run.
    #[error(transparent)]
    Runner(#[from] TransportError),
}

/// Future returned by [`InventoryProvider::targets`].
pub type InventoryFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Target>, InventoryError>> + Send + 'a>>;

/// Source of target metadata.
pub trait InventoryProvider: Send + Sync {
    /// Returns the current target snapshot.
    fn targets(&self) -> InventoryFuture<'_>;
}

/// Inventory held in memory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StaticInventory {
    targets: Vec<Target>,
}

impl StaticInventory {
    /// Wraps `targets`.
    #[must_use]
    pub const fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }
}

impl InventoryProvider for StaticInventory {
    fn targets(&self) -> InventoryFuture<'_> {
        let snapshot = self.targets.clone();
        Box::pin(async move { Ok(snapshot) })
    }
}

/// One record of a JSON inventory file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct InventoryRecord {
    id: String,
    name: String,
    #[serde(default)]
    tags: Tags,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    user: Option<String>,
}

impl InventoryRecord {
    fn into_target(self) -> Target {
        let reference = self.address.map(|address| {
            let host = if address.contains(':') && !address.starts_with('[') {
                format!("[{address}]")
            } else {
                address
            };
            let login = self
                .user
                .map_or_else(|| host.clone(), |user| format!("{user}@{host}"));
            self.port
                .map_or_else(|| login.clone(), |port| format!("{login}:{port}"))
        });
        Target {
            id: self.id,
            display_name: self.name,
            tags: self.tags,
            connection_ref: reference.map(ConnectionRef::new),
        }
    }
}

/// Inventory read from a JSON array of
/// `{id, name, tags, address, port?, user?}` records.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileInventory {
    path: Utf8PathBuf,
}

impl FileInventory {
    /// Creates a provider reading `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the inventory path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads and parses the inventory file synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::Io`] when the file cannot be read,
    /// [`InventoryError::Parse`] for malformed JSON, and
    /// [`InventoryError::DuplicateId`] when two records share an id.
    pub fn load(&self) -> Result<Vec<Target>, InventoryError> {
        let contents = read_file(&self.path)?;
        parse_inventory(&contents, self.path.as_str())
    }
}

impl InventoryProvider for FileInventory {
    fn targets(&self) -> InventoryFuture<'_> {
        Box::pin(async move { self.load() })
    }
}

/// Parses a JSON inventory document.
///
/// # Errors
///
/// Returns [`InventoryError::Parse`] for malformed JSON and
/// [`InventoryError::DuplicateId`] when two records share an id.
pub fn parse_inventory(contents: &str, source_name: &str) -> Result<Vec<Target>, InventoryError> {
    let records: Vec<InventoryRecord> =
        serde_json::from_str(contents).map_err(|err| InventoryError::Parse {
            source_name: source_name.to_owned(),
            message: err.to_string(),
        })?;
    let targets: Vec<Target> = records.into_iter().map(InventoryRecord::into_target).collect();
    ensure_unique(&targets)?;
    debug!(source = source_name, targets = targets.len(), "inventory loaded");
    Ok(targets)
}

fn ensure_unique(targets: &[Target]) -> Result<(), InventoryError> {
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.id.as_str()) {
            return Err(InventoryError::DuplicateId {
                id: target.id.clone(),
            });
        }
    }
    Ok(())
}

fn read_file(path: &Utf8Path) -> Result<String, InventoryError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| InventoryError::Io {
        path: path.to_path_buf(),
        message: String::from("inventory path is missing a filename"),
    })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
        InventoryError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }
    })?;
    dir.read_to_string(file_name)
        .map_err(|err| InventoryError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct ScwPublicIp {
    address: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct ScwServer {
    id: String,
    name: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    public_ip: Option<ScwPublicIp>,
    #[serde(default)]
    public_ips: Vec<ScwPublicIp>,
}

impl ScwServer {
    fn into_target(self) -> Target {
        let tags = self
            .tags
            .iter()
            .map(|tag| {
                tag.split_once('=').map_or_else(
                    || (tag.clone(), String::new()),
                    |(key, value)| (key.to_owned(), value.to_owned()),
                )
            })
            .collect();
        let address = self
            .public_ip
            .or_else(|| self.public_ips.into_iter().next())
            .map(|ip| ConnectionRef::new(ip.address));
        Target {
            id: self.id,
            display_name: self.name,
            tags,
            connection_ref: address,
        }
    }
}

/// Inventory discovered by listing servers with the Scaleway CLI.
///
/// Tags of the form `key=value` become map entries and bare tags map to the
/// empty string. Servers without a public address carry no connection
/// reference.
#[derive(Clone, Debug)]
pub struct ScwInventory<R: CommandRunner> {
    scw_bin: String,
    project_id: Option<String>,
    runner: R,
}

impl ScwInventory<ProcessCommandRunner> {
    /// Creates an inventory wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(project_id: Option<String>) -> Self {
        Self::new(DEFAULT_SCW_BIN, project_id, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> ScwInventory<R> {
    /// Creates an inventory using the provided runner.
    #[must_use]
    pub fn new(scw_bin: impl Into<String>, project_id: Option<String>, runner: R) -> Self {
        Self {
            scw_bin: scw_bin.into(),
            project_id,
            runner,
        }
    }

    fn build_list_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("instance"),
            OsString::from("server"),
            OsString::from("list"),
            OsString::from("zone=all"),
        ];
        if let Some(project_id) = &self.project_id {
            args.push(OsString::from(format!("project-id={project_id}")));
        }
        args.push(OsString::from("-o"));
        args.push(OsString::from("json"));
        args
    }

    fn check_output(&self, output: CommandOutput) -> Result<String, InventoryError> {
        if output.is_success() {
            return Ok(output.stdout);
        }
        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(InventoryError::CommandFailure {
            program: self.scw_bin.clone(),
            status_text,
            stderr: output.stderr,
        })
    }

    async fn list(&self) -> Result<Vec<Target>, InventoryError> {
        let args = self.build_list_args();
        let output = self.runner.run(&self.scw_bin, &args).await?;
        let stdout = self.check_output(output)?;
        let servers: Vec<ScwServer> =
            serde_json::from_str(&stdout).map_err(|err| InventoryError::Parse {
                source_name: String::from("servers"),
                message: err.to_string(),
            })?;
        let targets: Vec<Target> = servers.into_iter().map(ScwServer::into_target).collect();
        ensure_unique(&targets)?;
        debug!(targets = targets.len(), "scw inventory loaded");
        Ok(targets)
    }
}

impl<R: CommandRunner> InventoryProvider for ScwInventory<R> {
    fn targets(&self) -> InventoryFuture<'_> {
        Box::pin(self.list())
    }
}
