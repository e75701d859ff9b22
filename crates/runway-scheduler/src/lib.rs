//! Job scheduling for runway.
//!
//! Tracks runners, keeps the dispatch queue, leases entries to runners, rolls
//! step and job state up into runs and drives all of it from a polling loop.
//! Coordination happens in the store, so several schedulers may share one
//! PostgreSQL database.

pub mod dispatch;
pub mod lease;
pub mod queue;
pub mod registry;
pub mod rollup;
pub mod scheduler;

pub use dispatch::NullDispatcher;
pub use lease::LeaseManager;
pub use queue::DispatchQueue;
pub use registry::RunnerRegistry;
pub use rollup::{Revocation, RollupEngine};
pub use scheduler::{JobView, RunView, Scheduler, TickReport};

/// Convert a configured duration for timestamp arithmetic. Durations too
/// large for chrono saturate.
pub(crate) fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}
