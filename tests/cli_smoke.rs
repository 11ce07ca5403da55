//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("flotilla");
    cmd.assert().code(2).stderr(contains("Usage: flotilla"));
}

#[test]
fn cli_help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("flotilla");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("exec"))
        .stdout(contains("copy"))
        .stdout(contains("list"));
}

#[test]
fn selection_flags_are_mutually_exclusive() {
    let mut cmd = cargo_bin_cmd!("flotilla");
    cmd.args(["exec", "--all", "--tag", "env=prod", "--", "uptime"])
        .assert()
        .code(2)
        .stderr(contains("cannot be used with"));
}
