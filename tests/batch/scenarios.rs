//! BDD scenarios for batch dispatch.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BatchWorld, batch_world};

#[scenario(
    path = "tests/features/batch.feature",
    name = "Run a command across a tagged subset"
)]
fn scenario_tagged_subset(batch_world: BatchWorld) {
    drop(batch_world);
}

#[scenario(
    path = "tests/features/batch.feature",
    name = "Report an unreachable host without aborting the batch"
)]
fn scenario_unreachable_host(batch_world: BatchWorld) {
    drop(batch_world);
}

#[scenario(
    path = "tests/features/batch.feature",
    name = "Surface remote exit codes as command failures"
)]
fn scenario_remote_exit_codes(batch_world: BatchWorld) {
    drop(batch_world);
}

#[scenario(path = "tests/features/batch.feature", name = "Time out a slow host")]
fn scenario_slow_host(batch_world: BatchWorld) {
    drop(batch_world);
}

#[scenario(path = "tests/features/batch.feature", name = "Dry run contacts no host")]
fn scenario_dry_run(batch_world: BatchWorld) {
    drop(batch_world);
}

#[scenario(
    path = "tests/features/batch.feature",
    name = "Reject an unknown explicit target"
)]
fn scenario_unknown_target(batch_world: BatchWorld) {
    drop(batch_world);
}
