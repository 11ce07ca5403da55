//! Public entry point: select targets, dispatch, and aggregate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::connection::ConnectionResolver;
use crate::dispatch::{DEFAULT_MAX_WORKERS, Dispatcher, ProgressEvent};
use crate::executor::{Executor, WorkItem};
use crate::operation::Operation;
use crate::path_filter::{DenyListFilter, PathFilter};
use crate::policy::FailurePolicy;
use crate::report::{BatchSummary, OutputMode};
use crate::selector::{Selection, SelectionError, select};
use crate::target::Target;
use crate::transport::{CommandRunner, SshTransport};

/// Default per-target timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Caller-supplied flags for one batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchOptions {
    /// Concurrency bound.
    pub max_workers: usize,
    /// Per-target timeout.
    pub timeout: Duration,
    /// Describe instead of execute.
    pub dry_run: bool,
    /// Rendering preference, carried for the caller.
    pub output_mode: OutputMode,
    /// Continue-vs-abort behaviour.
    pub failure_policy: FailurePolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            timeout: DEFAULT_TIMEOUT,
            dry_run: false,
            output_mode: OutputMode::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl BatchOptions {
    /// Checks the options can drive a batch.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidOptions`] when the worker bound or the
    /// timeout is zero.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.max_workers == 0 {
            return Err(BatchError::InvalidOptions(String::from(
                "max_workers must be at least 1",
            )));
        }
        if self.timeout.is_zero() {
            return Err(BatchError::InvalidOptions(String::from(
                "timeout must be greater than zero",
            )));
        }
        Ok(())
    }
}

/// Errors that abort a whole batch before dispatch.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BatchError {
    /// Target selection failed.
    #[error(transparent)]
    Selection(#[from] SelectionError),
    /// The batch options were rejected.
    #[error("invalid batch options: {0}")]
    InvalidOptions(String),
}

/// Everything a batch needs, passed explicitly instead of through globals.
pub struct BatchContext<R: CommandRunner> {
    inventory: Vec<Target>,
    resolver: Arc<dyn ConnectionResolver>,
    path_filter: Arc<dyn PathFilter>,
    transport: Arc<SshTransport<R>>,
    options: BatchOptions,
    cancel: CancellationToken,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl<R: CommandRunner> fmt::Debug for BatchContext<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchContext")
            .field("inventory", &self.inventory.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner + 'static> BatchContext<R> {
    /// Creates a context with default options and the default path filter.
    #[must_use]
    pub fn new(
        inventory: Vec<Target>,
        resolver: Arc<dyn ConnectionResolver>,
        transport: SshTransport<R>,
    ) -> Self {
        Self {
            inventory,
            resolver,
            path_filter: Arc::new(DenyListFilter::default()),
            transport: Arc::new(transport),
            options: BatchOptions::default(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Replaces the batch options.
    #[must_use]
    pub const fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the transfer path filter.
    #[must_use]
    pub fn with_path_filter(mut self, path_filter: Arc<dyn PathFilter>) -> Self {
        self.path_filter = path_filter;
        self
    }

    /// Uses `cancel` as the interrupt signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Streams progress events to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the inventory snapshot.
    #[must_use]
    pub fn inventory(&self) -> &[Target] {
        &self.inventory
    }

    /// Returns the batch options.
    #[must_use]
    pub const fn options(&self) -> &BatchOptions {
        &self.options
    }

    fn dispatcher(&self) -> Dispatcher<R> {
        let executor = Executor::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.resolver),
            Arc::clone(&self.path_filter),
        );
        let mut dispatcher = Dispatcher::new(Arc::new(executor))
            .with_max_workers(self.options.max_workers)
            .with_policy(self.options.failure_policy)
            .with_cancellation(self.cancel.clone());
        if let Some(progress) = &self.progress {
            dispatcher = dispatcher.with_progress(progress.clone());
        }
        dispatcher
    }
}

/// Runs `operation` against every target matched by `selection`.
///
/// Returns only after every work item reached a terminal state or
/// cancellation drained the pool. Per-target failures are reported inside the
/// summary.
///
/// # Errors
///
/// Returns [`BatchError::Selection`] when no target matches or an explicit
/// target is unknown, and [`BatchError::InvalidOptions`] for unusable
/// options. No work item is created in either case.
pub async fn run_batch<R: CommandRunner + 'static>(
    ctx: &BatchContext<R>,
    selection: &Selection,
    operation: Operation,
) -> Result<BatchSummary, BatchError> {
    ctx.options.validate()?;
    let targets = select(selection, &ctx.inventory)?;

    let batch_id = Uuid::new_v4();
    let span = info_span!("batch", id = %batch_id, operation = %operation);
    async move {
        let started = Instant::now();
        info!(
            targets = targets.len(),
            selection = %selection,
            dry_run = ctx.options.dry_run,
            "batch started"
        );

        let shared = Arc::new(operation.for_batch(&targets));
        let items = targets
            .into_iter()
            .map(|target| WorkItem {
                target,
                operation: Arc::clone(&shared),
                timeout: ctx.options.timeout,
                dry_run: ctx.options.dry_run,
            })
            .collect();

        let results = ctx.dispatcher().run(items).await;
        let summary = BatchSummary::from_results(results, started.elapsed());
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_ms = summary.elapsed.as_millis(),
            "batch finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{InventoryResolver, SshDefaults};
    use crate::operation::CommandSpec;
    use crate::test_support::{ScriptedRunner, numbered_targets};
    use crate::transport::SshSettings;
    use rstest::rstest;

    fn context(runner: &ScriptedRunner, options: BatchOptions) -> BatchContext<ScriptedRunner> {
        let inventory = numbered_targets(3);
        let resolver = Arc::new(InventoryResolver::new(&inventory, SshDefaults::default()));
        BatchContext::new(
            inventory,
            resolver,
            SshTransport::new(SshSettings::default(), runner.clone()),
        )
        .with_options(options)
    }

    #[rstest]
    #[case::zero_workers(BatchOptions { max_workers: 0, ..BatchOptions::default() }, "max_workers")]
    #[case::zero_timeout(BatchOptions { timeout: Duration::ZERO, ..BatchOptions::default() }, "timeout")]
    #[tokio::test]
    async fn unusable_options_reject_the_batch_before_dispatch(
        #[case] options: BatchOptions,
        #[case] field: &str,
    ) {
        let runner = ScriptedRunner::new();
        let ctx = context(&runner, options);

        let err = run_batch(&ctx, &Selection::All, Operation::Command(CommandSpec::new("id")))
            .await
            .expect_err("options are unusable");

        assert!(
            matches!(err, BatchError::InvalidOptions(ref message) if message.contains(field)),
            "{err}"
        );
        assert!(runner.invocations().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn denied_remote_paths_are_filtered_per_target() {
        let runner = ScriptedRunner::new();
        let ctx = context(&runner, BatchOptions::default());
        let operation = Operation::Transfer(crate::operation::TransferSpec::upload(
            "motd",
            "/etc/shadow",
        ));

        let summary = run_batch(&ctx, &Selection::All, operation)
            .await
            .expect("batch runs");

        assert_eq!(summary.failed, 3);
        assert!(summary.results.iter().all(|result| {
            result.outcome.failure_kind() == Some(crate::executor::FailureKind::SecurityFiltered)
        }));
        assert!(runner.invocations().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn downloads_from_duplicate_names_land_in_distinct_directories() {
        let runner = ScriptedRunner::new();
        let inventory = vec![
            crate::test_support::fleet_target("srv-1", "web", "prod", "10.0.0.1"),
            crate::test_support::fleet_target("srv-2", "web", "prod", "10.0.0.2"),
        ];
        let resolver = Arc::new(InventoryResolver::new(&inventory, SshDefaults::default()));
        let ctx = BatchContext::new(
            inventory,
            resolver,
            SshTransport::new(SshSettings::default(), runner.clone()),
        )
        .with_options(BatchOptions {
            dry_run: true,
            ..BatchOptions::default()
        });
        let operation = Operation::Transfer(crate::operation::TransferSpec::download(
            "/var/log/syslog",
            "logs",
        ));

        let summary = run_batch(&ctx, &Selection::All, operation)
            .await
            .expect("batch runs");

        let mut plans: Vec<_> = summary
            .results
            .iter()
            .map(|result| result.stdout.clone())
            .collect();
        plans.sort();
        assert_eq!(
            plans,
            vec![
                String::from("would execute: download web:/var/log/syslog to logs/web-srv-1"),
                String::from("would execute: download web:/var/log/syslog to logs/web-srv-2"),
            ]
        );
        assert!(runner.invocations().is_empty());
    }
}
