//! Shared fixtures for batch dispatch scenarios.

use std::sync::Arc;

use flotilla::test_support::{ScriptedRunner, numbered_targets};
use flotilla::{
    BatchContext, BatchError, BatchOptions, BatchSummary, CommandSpec, InventoryResolver,
    Operation, Selection, SshDefaults, SshSettings, SshTransport, Target, run_batch,
};
use rstest::fixture;
use thiserror::Error;

/// State threaded through the steps of one scenario.
#[derive(Clone, Debug, Default)]
pub struct BatchWorld {
    pub runner: ScriptedRunner,
    pub inventory: Vec<Target>,
    pub options: BatchOptions,
    pub outcome: Option<Result<BatchSummary, BatchError>>,
}

#[derive(Debug, Error)]
pub enum BatchTestError {
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[fixture]
pub fn batch_world() -> BatchWorld {
    BatchWorld::default()
}

impl BatchWorld {
    pub fn with_fleet(mut self, count: usize) -> Self {
        self.inventory = numbered_targets(count);
        self
    }

    /// Runs `command` against `selection` on a paused clock so scripted
    /// delays and timeouts resolve instantly.
    pub fn run(mut self, selection: &Selection, command: &str) -> Result<Self, BatchTestError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()?;
        let resolver = Arc::new(InventoryResolver::new(
            &self.inventory,
            SshDefaults::default(),
        ));
        let transport = SshTransport::new(SshSettings::default(), self.runner.clone());
        let ctx = BatchContext::new(self.inventory.clone(), resolver, transport)
            .with_options(self.options);
        let operation = Operation::Command(CommandSpec::new(command));

        let outcome = runtime.block_on(run_batch(&ctx, selection, operation));
        self.outcome = Some(outcome);
        Ok(self)
    }
}
