//! Core library for the Flotilla fleet dispatcher.
//!
//! The crate selects targets from an inventory snapshot, runs one command or
//! file transfer against each of them under a bounded worker budget, and
//! aggregates the per-target outcomes into a deterministic report. Per-target
//! failures never abort the batch; only selection errors do.

pub mod batch;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod executor;
pub mod inventory;
pub mod operation;
pub mod path_filter;
pub mod policy;
pub mod report;
pub mod selector;
pub mod target;
pub mod test_support;
pub mod transport;

pub use batch::{BatchContext, BatchError, BatchOptions, run_batch};
pub use config::{ConfigError, FleetConfig};
pub use connection::{
    ConnectionDescriptor, ConnectionResolver, InventoryResolver, ResolutionError, SshDefaults,
};
pub use dispatch::{Dispatcher, ProgressEvent};
pub use executor::{ExecutionResult, ExecutionState, Executor, FailureKind, Outcome, WorkItem};
pub use inventory::{
    FileInventory, InventoryError, InventoryProvider, ScwInventory, StaticInventory,
};
pub use operation::{CommandSpec, Operation, TransferDirection, TransferSpec};
pub use path_filter::{AllowAll, DenyListFilter, PathFilter};
pub use policy::{FailurePolicy, PolicyError};
pub use report::{BatchSummary, OutputFilter, OutputMode};
pub use selector::{Selection, SelectionError, select};
pub use target::{ConnectionRef, Tags, Target};
pub use transport::{CommandOutput, CommandRunner, ProcessCommandRunner, SshSettings, SshTransport};
