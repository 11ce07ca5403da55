//! Bounded fan-out of work items and fan-in of their results.
//!
//! A pool of `min(max_workers, N)` tasks pulls items from a shared queue.
//! The queue lock is never held across an await; results travel back over a
//! channel. Cancellation stops hand-out only: in-flight items finish or time
//! out on their own, and every item left in the queue is recorded as
//! cancelled.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{ExecutionResult, Executor, FailureKind, Outcome, WorkItem};
use crate::policy::FailurePolicy;
use crate::transport::CommandRunner;

/// Default concurrency bound.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Progress notification streamed while a batch runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProgressEvent {
    /// A worker picked up the item for this target.
    Started {
        /// Identifier of the target.
        target_id: String,
        /// Display name of the target.
        display_name: String,
    },
    /// The item reached a terminal state.
    Finished(ExecutionResult),
}

type Queue = Arc<Mutex<VecDeque<WorkItem>>>;

/// Runs work items under a concurrency bound.
pub struct Dispatcher<R: CommandRunner> {
    executor: Arc<Executor<R>>,
    max_workers: usize,
    policy: FailurePolicy,
    cancel: CancellationToken,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl<R: CommandRunner + 'static> Dispatcher<R> {
    /// Creates a dispatcher with the default bound and policy.
    #[must_use]
    pub fn new(executor: Arc<Executor<R>>) -> Self {
        Self {
            executor,
            max_workers: DEFAULT_MAX_WORKERS,
            policy: FailurePolicy::default(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Sets the concurrency bound; zero is treated as one.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Sets the partial-failure policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uses `cancel` as the external interrupt signal.
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

    /// Executes every item and returns exactly one result per item, in
    /// completion order.
    pub async fn run(&self, items: Vec<WorkItem>) -> Vec<ExecutionResult> {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }
        let pool_size = self.max_workers.clamp(1, total);
        info!(total, workers = pool_size, "dispatching work items");

        let targets: Vec<_> = items.iter().map(|item| item.target.clone()).collect();
        let queue: Queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let stop = self.cancel.child_token();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let mut workers = JoinSet::new();
        for worker in 0..pool_size {
            workers.spawn(worker_loop(
                worker,
                Arc::clone(&self.executor),
                Arc::clone(&queue),
                stop.clone(),
                self.policy,
                self.progress.clone(),
                results_tx.clone(),
            ));
        }
        drop(results_tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "dispatch worker terminated abnormally");
            }
        }

        let leftovers: Vec<WorkItem> = lock(&queue).drain(..).collect();
        if !leftovers.is_empty() {
            warn!(
                cancelled = leftovers.len(),
                "batch cancelled before every item started"
            );
        }
        for item in &leftovers {
            let cancelled = ExecutionResult::cancelled(&item.target);
            self.notify(ProgressEvent::Finished(cancelled.clone()));
            results.push(cancelled);
        }

        let mut accounted: HashSet<String> = results
            .iter()
            .map(|result| result.target_id.clone())
            .collect();
        for target in &targets {
            if accounted.insert(target.id.clone()) {
                let lost = ExecutionResult::without_output(
                    target,
                    Outcome::Failure {
                        kind: FailureKind::Local,
                        message: String::from("worker terminated before reporting a result"),
                    },
                    Duration::ZERO,
                );
                self.notify(ProgressEvent::Finished(lost.clone()));
                results.push(lost);
            }
        }

        debug!(results = results.len(), "dispatch complete");
        results
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            send_progress(progress, event);
        }
    }
}

async fn worker_loop<R: CommandRunner>(
    worker: usize,
    executor: Arc<Executor<R>>,
    queue: Queue,
    stop: CancellationToken,
    policy: FailurePolicy,
    progress: Option<UnboundedSender<ProgressEvent>>,
    results: UnboundedSender<ExecutionResult>,
) {
    loop {
        if stop.is_cancelled() {
            debug!(worker, "worker stopping: hand-out cancelled");
            break;
        }
        let Some(item) = lock(&queue).pop_front() else {
            break;
        };

        if let Some(sender) = &progress {
            send_progress(
                sender,
                ProgressEvent::Started {
                    target_id: item.target.id.clone(),
                    display_name: item.target.display_name.clone(),
                },
            );
        }

        let result = executor.execute(&item).await;
        if policy.halts_after(&result) && !stop.is_cancelled() {
            warn!(host = %result.display_name, "fail-fast: halting further dispatch");
            stop.cancel();
        }
        if let Some(sender) = &progress {
            send_progress(sender, ProgressEvent::Finished(result.clone()));
        }
        if results.send(result).is_err() {
            break;
        }
    }
}

fn lock(queue: &Queue) -> std::sync::MutexGuard<'_, VecDeque<WorkItem>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send_progress(sender: &UnboundedSender<ProgressEvent>, event: ProgressEvent) {
    if sender.send(event).is_err() {
        debug!("progress receiver dropped");
    }
}
