//! Runner dispatch trait and lease assignment types.
//!
//! The scheduler never executes work itself. It leases a queue entry to a
//! runner and hands the assignment to a [`RunnerDispatcher`], which delivers
//! it over whatever channel the runner-management layer provides.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Job, QueueEntry, Runner, Step};
use crate::{EntryId, Result, RunnerId};

/// Work handed to a runner once its lease is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub entry: QueueEntry,
    pub job: Job,
    /// Steps of the job's current attempt, in order.
    pub steps: Vec<Step>,
    pub lease_expires_at: DateTime<Utc>,
}

/// Delivers assignments and cancellation signals to runners.
#[async_trait]
pub trait RunnerDispatcher: Send + Sync {
    /// Name of this dispatcher.
    fn name(&self) -> &'static str;

    /// Deliver a freshly leased assignment. An error is treated as a
    /// transient failure of the lease.
    async fn dispatch(&self, runner: &Runner, assignment: &Assignment) -> Result<()>;

    /// Ask a runner to stop work on a revoked lease. Best effort.
    async fn revoke(&self, runner_id: RunnerId, entry_id: EntryId) -> Result<()>;
}
