//! Core domain types for the runway CI job scheduler.
//!
//! This crate contains:
//! - Typed resource identifiers
//! - The error taxonomy shared by every layer
//! - The status model and rollup rules for runs, jobs and steps
//! - Entity records (workflows, runs, jobs, steps, runners, queue entries)
//! - Resolved job-tree requests and the runner dispatch trait

pub mod dispatch;
pub mod error;
pub mod id;
pub mod model;
pub mod status;
pub mod tree;

pub use error::{Error, ErrorKind, Result};
pub use id::{EntryId, JobId, RepositoryId, RunId, RunnerId, StepId, WorkflowId};
pub use model::{
    FailureReason, Job, QueueEntry, Runner, RunnerHeartbeat, RunnerKind, Step, Workflow,
    WorkflowRun,
};
pub use status::{Conclusion, QueueStatus, RunnerStatus, Status};
