//! End-to-end properties of `run_batch` over scripted transports.

use std::sync::Arc;
use std::time::Duration;

use flotilla::report::{self, OutputMode};
use flotilla::test_support::{CountingResolver, ScriptedRunner, fleet_target, numbered_targets};
use flotilla::{
    BatchContext, BatchError, BatchOptions, CommandSpec, ConnectionResolver, FailureKind,
    InventoryResolver, Operation, Outcome, ProgressEvent, Selection, SelectionError, SshDefaults,
    SshSettings, SshTransport, Target, run_batch,
};
use rstest::rstest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn context(
    runner: &ScriptedRunner,
    inventory: Vec<Target>,
    options: BatchOptions,
) -> BatchContext<ScriptedRunner> {
    let resolver = Arc::new(InventoryResolver::new(&inventory, SshDefaults::default()));
    BatchContext::new(
        inventory,
        resolver,
        SshTransport::new(SshSettings::default(), runner.clone()),
    )
    .with_options(options)
}

fn command(text: &str) -> Operation {
    Operation::Command(CommandSpec::new(text))
}

#[tokio::test(start_paused = true)]
async fn mixed_outcomes_are_all_reported() {
    let runner = ScriptedRunner::new();
    runner.respond_ok("10.0.0.1", "ok\n");
    runner.delay("10.0.0.2", Duration::from_secs(100));
    runner.respond(
        "10.0.0.3",
        Some(255),
        "",
        "ssh: connect to host 10.0.0.3 port 22: No route to host",
    );
    let options = BatchOptions {
        timeout: Duration::from_secs(1),
        ..BatchOptions::default()
    };
    let ctx = context(&runner, numbered_targets(3), options);
    let selection = Selection::tag_from_expr("env=dev").expect("tag expression");

    let summary = run_batch(&ctx, &selection, command("echo ok"))
        .await
        .expect("batch runs");

    assert_eq!(
        (summary.total, summary.succeeded, summary.failed),
        (3, 1, 2)
    );
    assert!(!summary.overall_success);
    let outcomes: Vec<_> = summary
        .results
        .iter()
        .map(|result| (result.display_name.as_str(), result.outcome.failure_kind()))
        .collect();
    assert_eq!(
        outcomes,
        [
            ("host-1", None),
            ("host-2", Some(FailureKind::Timeout)),
            ("host-3", Some(FailureKind::Connection)),
        ]
    );
}

#[tokio::test]
async fn empty_inventory_matches_nothing() {
    let runner = ScriptedRunner::new();
    let ctx = context(&runner, Vec::new(), BatchOptions::default());

    let err = run_batch(&ctx, &Selection::All, command("uptime"))
        .await
        .expect_err("nothing to select");

    assert!(
        matches!(
            err,
            BatchError::Selection(SelectionError::NoTargetsMatched { .. })
        ),
        "{err}"
    );
    assert!(runner.invocations().is_empty());
}

#[tokio::test]
async fn unknown_explicit_target_aborts_before_dispatch() {
    let runner = ScriptedRunner::new();
    let inventory = vec![fleet_target("a", "host-a", "dev", "10.0.0.1")];
    let ctx = context(&runner, inventory, BatchOptions::default());
    let selection = Selection::Explicit(vec![String::from("host-a"), String::from("host-x")]);

    let err = run_batch(&ctx, &selection, command("uptime"))
        .await
        .expect_err("host-x is unknown");

    assert_eq!(
        err,
        BatchError::Selection(SelectionError::UnknownTarget {
            target: String::from("host-x")
        })
    );
    assert!(runner.invocations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn output_mode_changes_rendering_only() {
    let runner = ScriptedRunner::new();
    runner.respond_ok("10.0.0.1", "alpha\n");
    runner.respond_ok("10.0.0.2", "beta\n");
    let grouped = BatchOptions {
        output_mode: OutputMode::Grouped,
        ..BatchOptions::default()
    };

    let prefixed_summary = run_batch(
        &context(&runner, numbered_targets(2), BatchOptions::default()),
        &Selection::All,
        command("hostname"),
    )
    .await
    .expect("prefixed batch");
    let grouped_summary = run_batch(
        &context(&runner, numbered_targets(2), grouped),
        &Selection::All,
        command("hostname"),
    )
    .await
    .expect("grouped batch");

    assert_eq!(
        prefixed_summary.without_timings(),
        grouped_summary.without_timings()
    );
    let prefixed = report::render(&prefixed_summary, OutputMode::Prefixed, None);
    let grouped_text = report::render(&grouped_summary, OutputMode::Grouped, None);
    assert!(prefixed.contains("[host-1] alpha"), "{prefixed}");
    assert!(grouped_text.contains("=== host-1 (ok in"), "{grouped_text}");
    assert_ne!(prefixed, grouped_text);
}

#[tokio::test(start_paused = true)]
async fn cancellation_after_first_start_cancels_the_rest() {
    let runner = ScriptedRunner::new();
    runner.default_delay(Duration::from_millis(500));
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let options = BatchOptions {
        max_workers: 1,
        ..BatchOptions::default()
    };
    let ctx = context(&runner, numbered_targets(5), options)
        .with_cancellation(cancel.clone())
        .with_progress(progress_tx);
    let watcher = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            if matches!(event, ProgressEvent::Started { .. }) {
                cancel.cancel();
                break;
            }
        }
    });

    let summary = run_batch(&ctx, &Selection::All, command("uptime"))
        .await
        .expect("batch runs");
    watcher.await.expect("watcher finishes");

    assert_eq!(summary.total, 5);
    let cancelled = summary
        .results
        .iter()
        .filter(|result| result.outcome == Outcome::Cancelled)
        .count();
    assert_eq!(cancelled, 4);
    let started = summary
        .results
        .iter()
        .find(|result| result.display_name == "host-1")
        .expect("host-1 result");
    assert!(started.outcome.is_success(), "{:?}", started.outcome);
    assert_eq!(runner.hosts_contacted(), ["10.0.0.1"]);
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(30)]
#[tokio::test(start_paused = true)]
async fn every_selected_target_gets_exactly_one_result(#[case] count: usize) {
    let runner = ScriptedRunner::new();
    runner.respond("10.0.0.1", Some(1), "", "boom");
    runner.delay("10.0.0.2", Duration::from_secs(120));
    let ctx = context(&runner, numbered_targets(count), BatchOptions::default());

    let summary = run_batch(&ctx, &Selection::All, command("uptime"))
        .await
        .expect("batch runs");

    assert_eq!(summary.total, count);
    assert_eq!(summary.results.len(), count);
    assert_eq!(summary.succeeded + summary.failed, count);
}

#[rstest]
#[case::just_over(Duration::from_millis(1_500), Duration::from_secs(1))]
#[case::far_over(Duration::from_secs(300), Duration::from_secs(5))]
#[tokio::test(start_paused = true)]
async fn overrunning_targets_time_out_rather_than_fail(
    #[case] delay: Duration,
    #[case] timeout: Duration,
) {
    let runner = ScriptedRunner::new();
    runner.respond("10.0.0.1", Some(1), "", "would have failed");
    runner.delay("10.0.0.1", delay);
    let options = BatchOptions {
        timeout,
        ..BatchOptions::default()
    };
    let ctx = context(&runner, numbered_targets(1), options);

    let summary = run_batch(&ctx, &Selection::All, command("sleep 600"))
        .await
        .expect("batch runs");

    let result = summary.results.first().expect("one result");
    assert_eq!(result.outcome, Outcome::TimedOut);
    assert_eq!(result.duration, timeout);
}

#[tokio::test]
async fn dry_runs_are_repeatable_and_side_effect_free() {
    let runner = ScriptedRunner::new();
    let options = BatchOptions {
        dry_run: true,
        ..BatchOptions::default()
    };
    let ctx = context(&runner, numbered_targets(4), options);

    let first = run_batch(&ctx, &Selection::All, command("apt-get upgrade -y"))
        .await
        .expect("first dry run");
    let second = run_batch(&ctx, &Selection::All, command("apt-get upgrade -y"))
        .await
        .expect("second dry run");

    assert_eq!(first.without_timings(), second.without_timings());
    assert!(first.overall_success);
    assert!(runner.invocations().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resolver_concurrency_never_exceeds_worker_bound() {
    let runner = ScriptedRunner::new();
    let inventory = numbered_targets(12);
    let inner: Arc<dyn ConnectionResolver> =
        Arc::new(InventoryResolver::new(&inventory, SshDefaults::default()));
    let counting = Arc::new(CountingResolver::new(inner, Duration::from_millis(20)));
    let options = BatchOptions {
        max_workers: 3,
        ..BatchOptions::default()
    };
    let ctx = BatchContext::new(
        inventory,
        Arc::clone(&counting) as Arc<dyn ConnectionResolver>,
        SshTransport::new(SshSettings::default(), runner.clone()),
    )
    .with_options(options);

    let summary = run_batch(&ctx, &Selection::All, command("uptime"))
        .await
        .expect("batch runs");

    assert_eq!(summary.total, 12);
    assert_eq!(counting.calls(), 12);
    assert!(counting.peak() <= 3, "peak was {}", counting.peak());
    assert!(runner.peak_concurrency() <= 3);
}
