//! BDD step definitions for batch dispatch: selection, per-target failure
//! classification, timeouts, and dry runs.

use std::time::Duration;

use flotilla::{BatchError, BatchSummary, ExecutionResult, Selection, SelectionError};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{BatchTestError, BatchWorld};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] BatchTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a fleet of \"{count}\" dev hosts")]
fn fleet_of_hosts(batch_world: BatchWorld, count: usize) -> BatchWorld {
    batch_world.with_fleet(count)
}

#[given("host \"{host}\" refuses connections")]
fn host_refuses_connections(batch_world: BatchWorld, host: String) -> BatchWorld {
    batch_world.runner.respond(
        &host,
        Some(255),
        "",
        format!("ssh: connect to host {host} port 22: Connection refused"),
    );
    batch_world
}

#[given("host \"{host}\" exits with code \"{code}\"")]
fn host_exits_with(batch_world: BatchWorld, host: String, code: i32) -> BatchWorld {
    batch_world
        .runner
        .respond(&host, Some(code), "", "unit nginx.service could not be found");
    batch_world
}

#[given("host \"{host}\" takes \"{seconds}\" seconds to respond")]
fn host_is_slow(batch_world: BatchWorld, host: String, seconds: u64) -> BatchWorld {
    batch_world.runner.delay(&host, Duration::from_secs(seconds));
    batch_world
}

#[given("the per-target timeout is \"{seconds}\" seconds")]
fn per_target_timeout(mut batch_world: BatchWorld, seconds: u64) -> BatchWorld {
    batch_world.options.timeout = Duration::from_secs(seconds);
    batch_world
}

#[given("dry run is enabled")]
fn dry_run_enabled(mut batch_world: BatchWorld) -> BatchWorld {
    batch_world.options.dry_run = true;
    batch_world
}

#[when("I run \"{command}\" against tag \"{expr}\"")]
fn run_against_tag(
    batch_world: BatchWorld,
    command: String,
    expr: String,
) -> Result<BatchWorld, StepError> {
    let selection = Selection::tag_from_expr(&expr)
        .map_err(|err| StepError::Assertion(format!("tag expression: {err}")))?;
    Ok(batch_world.run(&selection, &command)?)
}

#[when("I run \"{command}\" against all targets")]
fn run_against_all(batch_world: BatchWorld, command: String) -> Result<BatchWorld, StepError> {
    Ok(batch_world.run(&Selection::All, &command)?)
}

#[when("I run \"{command}\" against target \"{name}\"")]
fn run_against_target(
    batch_world: BatchWorld,
    command: String,
    name: String,
) -> Result<BatchWorld, StepError> {
    Ok(batch_world.run(&Selection::Explicit(vec![name]), &command)?)
}

fn summary(batch_world: &BatchWorld) -> Result<&BatchSummary, StepError> {
    match batch_world.outcome.as_ref() {
        Some(Ok(summary)) => Ok(summary),
        Some(Err(err)) => Err(StepError::Assertion(format!(
            "expected a summary, batch was rejected: {err}"
        ))),
        None => Err(StepError::Assertion(String::from("batch did not run"))),
    }
}

fn result_for<'a>(
    summary: &'a BatchSummary,
    name: &str,
) -> Result<&'a ExecutionResult, StepError> {
    summary
        .results
        .iter()
        .find(|result| result.display_name == name)
        .ok_or_else(|| StepError::Assertion(format!("no result for {name}")))
}

#[then("\"{count}\" targets succeed")]
fn targets_succeed(batch_world: &BatchWorld, count: usize) -> Result<(), StepError> {
    let summary = summary(batch_world)?;
    if summary.succeeded == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} successes, got {} of {}",
            summary.succeeded, summary.total
        )))
    }
}

#[then("target \"{name}\" failed with kind \"{kind}\"")]
fn target_failed_with(
    batch_world: &BatchWorld,
    name: String,
    kind: String,
) -> Result<(), StepError> {
    let summary = summary(batch_world)?;
    let result = result_for(summary, &name)?;
    let actual = result.outcome.failure_kind().map(|failure| failure.as_str());
    if actual == Some(kind.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {name} to fail with {kind}, got {:?}",
            result.outcome
        )))
    }
}

#[then("target \"{name}\" timed out")]
fn target_timed_out(batch_world: &BatchWorld, name: String) -> Result<(), StepError> {
    let summary = summary(batch_world)?;
    let result = result_for(summary, &name)?;
    if result.outcome.failure_kind().map(|failure| failure.as_str()) == Some("timeout") {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {name} to time out, got {:?}",
            result.outcome
        )))
    }
}

#[then("the batch exit code is \"{code}\"")]
fn batch_exit_code(batch_world: &BatchWorld, code: i32) -> Result<(), StepError> {
    let actual = summary(batch_world)?.exit_code();
    if actual == code {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected exit code {code}, got {actual}"
        )))
    }
}

#[then("no host was contacted")]
fn no_host_contacted(batch_world: &BatchWorld) -> Result<(), StepError> {
    let invocations = batch_world.runner.invocations();
    if invocations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no invocations, got {invocations:?}"
        )))
    }
}

#[then("the batch is rejected because \"{name}\" is unknown")]
fn batch_rejected_unknown(batch_world: &BatchWorld, name: String) -> Result<(), StepError> {
    let expected = BatchError::Selection(SelectionError::UnknownTarget { target: name });
    match batch_world.outcome.as_ref() {
        Some(Err(err)) if *err == expected => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {expected}, got {other:?}"
        ))),
    }
}
