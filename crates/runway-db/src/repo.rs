//! Store trait and its PostgreSQL implementation.

pub mod postgres;
pub mod rows;
pub mod store;

pub use postgres::PgSchedulerStore;
pub use store::{Claim, SchedulerStore, guard_transition};
