//! Binary entry point for the Flotilla CLI.

use std::io::{self, IsTerminal, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use flotilla::inventory::InventoryProvider;
use flotilla::policy::{self, PolicyError};
use flotilla::report::{self, OutputFilter, OutputMode};
use flotilla::{
    BatchContext, BatchError, BatchOptions, CommandSpec, ConfigError, ConnectionRef, FailurePolicy,
    FileInventory, FleetConfig, InventoryError, InventoryResolver, Operation, ProgressEvent,
    ScwInventory, Selection, SelectionError, SshTransport, Target, TransferSpec, run_batch, select,
};

mod cli;

use cli::{Cli, CopyCommand, ExecCommand, ListCommand, RunArgs, SelectionArgs};

/// Exit status for errors raised before any target was contacted.
const EXIT_USAGE: i32 = 2;

/// Environment variable holding the tracing filter directive.
const LOG_ENV: &str = "FLOTILLA_LOG";

/// Inventory argument that lists servers with the Scaleway CLI.
const SCW_INVENTORY: &str = "scw";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),
    #[error("no inventory: pass --inventory FILE or set FLOTILLA_INVENTORY_FILE")]
    MissingInventory,
    #[error("no targets selected: pass --target, --tag, --pattern, or --all")]
    MissingSelection,
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("invalid output filter: {0}")]
    Filter(#[from] regex::Error),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            EXIT_USAGE
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(io::stderr().is_terminal())
                .with_target(false),
        )
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Exec(command) => exec_command(command).await,
        Cli::Copy(command) => copy_command(command).await,
        Cli::List(command) => list_command(command).await,
    }
}

async fn exec_command(args: ExecCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let mut spec = CommandSpec::new(render_remote_command(&args.command));
    if let Some(filter) = build_filter(&args.run.filters)? {
        spec = spec.with_output_filter(filter);
    }
    run_operation(&args.selection, &args.run, Operation::Command(spec)).await
}

async fn copy_command(args: CopyCommand) -> Result<i32, CliError> {
    let mut spec = if args.download {
        TransferSpec::download(args.source, args.destination)
    } else {
        TransferSpec::upload(args.source, args.destination)
    };
    if let Some(filter) = build_filter(&args.run.filters)? {
        spec = spec.with_output_filter(filter);
    }
    let operation = Operation::Transfer(spec.recursive(args.recursive));
    run_operation(&args.selection, &args.run, operation).await
}

async fn list_command(args: ListCommand) -> Result<i32, CliError> {
    let selection = selection_from(&args.selection)?.unwrap_or(Selection::All);
    let config = load_config()?;
    let inventory = load_inventory(&config, args.inventory.as_deref()).await?;
    let selected = select(&selection, &inventory)?;

    let mut stdout = io::stdout().lock();
    for target in &selected {
        writeln!(stdout, "{}", describe_target(target)).ok();
    }
    Ok(policy::EXIT_SUCCESS)
}

async fn run_operation(
    selection_args: &SelectionArgs,
    run: &RunArgs,
    operation: Operation,
) -> Result<i32, CliError> {
    let selection = selection_from(selection_args)?.ok_or(CliError::MissingSelection)?;
    policy::authorize(&operation, run.yes)?;

    let config = load_config()?;
    let inventory = load_inventory(&config, run.inventory.as_deref()).await?;
    let options = batch_options(&config, run)?;
    let output_mode = options.output_mode;
    let filter = operation
        .output_filter()
        .map_or_else(OutputFilter::ssh_noise, |filter| Ok(filter.clone()))?;

    let resolver = Arc::new(InventoryResolver::new(&inventory, config.ssh_defaults()));
    let transport = SshTransport::with_process_runner(config.ssh_settings());
    let mut ctx = BatchContext::new(inventory, resolver, transport)
        .with_options(options)
        .with_cancellation(watch_interrupts());

    let mut printer = None;
    if run.progress {
        let (sender, receiver) = mpsc::unbounded_channel();
        ctx = ctx.with_progress(sender);
        printer = Some(spawn_progress_printer(receiver, filter.clone()));
    }

    let summary = run_batch(&ctx, &selection, operation).await?;
    drop(ctx);
    if let Some(handle) = printer
        && let Err(err) = handle.await
    {
        warn!(error = %err, "progress printer stopped early");
    }

    let mut stdout = io::stdout().lock();
    write!(stdout, "{}", report::render(&summary, output_mode, Some(&filter))).ok();
    write!(stdout, "{}", report::render_failures(&summary)).ok();
    write!(stdout, "{}", report::render_totals(&summary)).ok();
    Ok(summary.exit_code())
}

fn load_config() -> Result<FleetConfig, CliError> {
    let config = FleetConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

async fn load_inventory(
    config: &FleetConfig,
    requested: Option<&str>,
) -> Result<Vec<Target>, CliError> {
    let source = requested
        .or(config.inventory_file.as_deref())
        .ok_or(CliError::MissingInventory)?;
    let provider = inventory_provider(source);
    Ok(provider.targets().await?)
}

/// Maps an inventory argument onto a provider: `scw` or `scw:<project-id>`
/// lists Scaleway servers, anything else is a JSON file path.
fn inventory_provider(source: &str) -> Box<dyn InventoryProvider> {
    if source == SCW_INVENTORY {
        return Box::new(ScwInventory::with_process_runner(None));
    }
    match source.strip_prefix("scw:") {
        Some(project) if !project.trim().is_empty() => Box::new(
            ScwInventory::with_process_runner(Some(project.trim().to_owned())),
        ),
        _ => Box::new(FileInventory::new(source)),
    }
}

fn selection_from(args: &SelectionArgs) -> Result<Option<Selection>, CliError> {
    if !args.targets.is_empty() {
        return Ok(Some(Selection::Explicit(args.targets.clone())));
    }
    if let Some(expr) = &args.tag {
        return Ok(Some(Selection::tag_from_expr(expr)?));
    }
    if let Some(pattern) = &args.pattern {
        return Ok(Some(Selection::Pattern(pattern.clone())));
    }
    Ok(args.all.then_some(Selection::All))
}

fn batch_options(config: &FleetConfig, run: &RunArgs) -> Result<BatchOptions, CliError> {
    let mut options = config.batch_options()?;
    if let Some(workers) = run.workers {
        options.max_workers = workers;
    }
    if let Some(seconds) = run.timeout {
        options.timeout = Duration::from_secs(seconds);
    }
    options.dry_run = run.dry_run;
    if run.grouped {
        options.output_mode = OutputMode::Grouped;
    }
    if run.fail_fast {
        options.failure_policy = FailurePolicy::FailFast;
    }
    Ok(options)
}

fn build_filter(patterns: &[String]) -> Result<Option<OutputFilter>, CliError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let custom = OutputFilter::new(patterns)?;
    Ok(Some(OutputFilter::ssh_noise()?.merged(custom)))
}

fn watch_interrupts() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; targets not yet started will be cancelled");
            trigger.cancel();
        }
    });
    cancel
}

fn spawn_progress_printer(
    mut receiver: UnboundedReceiver<ProgressEvent>,
    filter: OutputFilter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let ProgressEvent::Finished(result) = event {
                let rendered = report::render_prefixed(&result, Some(&filter));
                io::stderr().write_all(rendered.as_bytes()).ok();
            }
        }
    })
}

fn describe_target(target: &Target) -> String {
    let tags = target
        .tags
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(",");
    let reference = target
        .connection_ref
        .as_ref()
        .map_or("-", ConnectionRef::as_str);
    format!(
        "{}\t{}\t{}\t{}",
        target.display_name, target.id, reference, tags
    )
}

/// Renders the remote command line. A single argument is handed to the
/// remote shell verbatim so pipelines survive; several are shell-escaped.
fn render_remote_command(args: &[String]) -> String {
    if let [single] = args {
        return single.clone();
    }
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
