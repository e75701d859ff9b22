//! Status model shared by runs, jobs and steps.
//!
//! Runs, jobs and steps all move through the same lifecycle:
//! `queued -> in_progress -> {completed, cancelled}`. Legal moves live in a
//! single table ([`TRANSITIONS`]) so every entity is checked the same way.
//! The string forms are part of the wire contract and must not change.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Lifecycle status of a run, job or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[display("queued")]
    Queued,
    #[display("in_progress")]
    InProgress,
    #[display("completed")]
    Completed,
    #[display("cancelled")]
    Cancelled,
}

/// Terminal outcome of a run, job or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    #[display("success")]
    Success,
    #[display("failure")]
    Failure,
    #[display("cancelled")]
    Cancelled,
    #[display("skipped")]
    Skipped,
}

/// Status of a dispatch queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[display("pending")]
    Pending,
    #[display("processing")]
    Processing,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

/// Liveness of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    #[display("online")]
    Online,
    #[display("offline")]
    Offline,
    #[display("busy")]
    Busy,
}

/// Which kind of entity a transition applies to, for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EntityKind {
    #[display("run")]
    Run,
    #[display("job")]
    Job,
    #[display("step")]
    Step,
}

/// Every legal `(from, to)` pair. Same-status pairs allow updating other
/// fields of a non-terminal entity. Nothing leaves a terminal status.
pub const TRANSITIONS: &[(Status, Status)] = &[
    (Status::Queued, Status::Queued),
    (Status::Queued, Status::InProgress),
    (Status::Queued, Status::Completed),
    (Status::Queued, Status::Cancelled),
    (Status::InProgress, Status::InProgress),
    (Status::InProgress, Status::Completed),
    (Status::InProgress, Status::Cancelled),
];

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }

    /// Position in the lifecycle; terminal statuses share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Status::Queued => 0,
            Status::InProgress => 1,
            Status::Completed | Status::Cancelled => 2,
        }
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        TRANSITIONS.contains(&(*self, next))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }
}

/// Check a status write against the transition table.
pub fn check_transition(entity: EntityKind, from: Status, to: Status) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::IllegalTransition(format!(
            "{} cannot move from {} to {}",
            entity, from, to
        )))
    }
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Cancelled => "cancelled",
            Conclusion::Skipped => "skipped",
        }
    }
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Online => "online",
            RunnerStatus::Offline => "offline",
            RunnerStatus::Busy => "busy",
        }
    }
}

fn unknown(what: &str, value: &str) -> Error {
    Error::InvalidInput(format!("unknown {}: {}", what, value))
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Status::Queued),
            "in_progress" => Ok(Status::InProgress),
            "completed" => Ok(Status::Completed),
            "cancelled" => Ok(Status::Cancelled),
            _ => Err(unknown("status", s)),
        }
    }
}

impl FromStr for Conclusion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Conclusion::Success),
            "failure" => Ok(Conclusion::Failure),
            "cancelled" => Ok(Conclusion::Cancelled),
            "skipped" => Ok(Conclusion::Skipped),
            _ => Err(unknown("conclusion", s)),
        }
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            _ => Err(unknown("queue status", s)),
        }
    }
}

impl FromStr for RunnerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(RunnerStatus::Online),
            "offline" => Ok(RunnerStatus::Offline),
            "busy" => Ok(RunnerStatus::Busy),
            _ => Err(unknown("runner status", s)),
        }
    }
}

/// The part of a child's state that feeds its parent's rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildState {
    pub status: Status,
    pub conclusion: Option<Conclusion>,
    /// A failure of this child does not fail the parent
    /// (`continue_on_error` on steps and on non-required jobs).
    pub masks_failure: bool,
}

/// Status and conclusion derived for a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollup {
    pub status: Status,
    pub conclusion: Option<Conclusion>,
}

/// Derive a parent's state from its children.
///
/// The parent is `queued` until a child starts, `in_progress` while any child
/// is non-terminal, and `completed` once every child is terminal. The
/// conclusion is `failure` if an unmasked child failed, else `cancelled` if a
/// child was cancelled, else `success`: at least one child succeeded (a masked
/// failure counts as success) or every child was skipped.
pub fn rollup<I>(children: I) -> Rollup
where
    I: IntoIterator<Item = ChildState>,
{
    let mut started = false;
    let mut all_terminal = true;
    let mut failure = false;
    let mut cancelled = false;

    for child in children {
        if child.status != Status::Queued {
            started = true;
        }
        if !child.status.is_terminal() {
            all_terminal = false;
            continue;
        }
        match (child.status, child.conclusion) {
            (Status::Cancelled, _) | (_, Some(Conclusion::Cancelled)) => cancelled = true,
            (_, Some(Conclusion::Failure)) if !child.masks_failure => failure = true,
            _ => {}
        }
    }

    if !started {
        return Rollup {
            status: Status::Queued,
            conclusion: None,
        };
    }
    if !all_terminal {
        return Rollup {
            status: Status::InProgress,
            conclusion: None,
        };
    }

    let conclusion = if failure {
        Conclusion::Failure
    } else if cancelled {
        Conclusion::Cancelled
    } else {
        Conclusion::Success
    };
    Rollup {
        status: Status::Completed,
        conclusion: Some(conclusion),
    }
}
