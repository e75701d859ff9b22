//! Dispatchers shipped with the scheduler.

use async_trait::async_trait;
use runway_core::dispatch::{Assignment, RunnerDispatcher};
use runway_core::{EntryId, Result, Runner, RunnerId};
use tracing::info;

/// Accepts every assignment and only logs it. Runners pull their work
/// through the runner-facing operations instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

#[async_trait]
impl RunnerDispatcher for NullDispatcher {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn dispatch(&self, runner: &Runner, assignment: &Assignment) -> Result<()> {
        info!(
            runner_id = %runner.id,
            entry_id = %assignment.entry.id,
            job = %assignment.job.name,
            steps = assignment.steps.len(),
            "Assignment ready"
        );
        Ok(())
    }

    async fn revoke(&self, runner_id: RunnerId, entry_id: EntryId) -> Result<()> {
        info!(runner_id = %runner_id, entry_id = %entry_id, "Lease revoked");
        Ok(())
    }
}
