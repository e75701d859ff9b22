//! KDL configuration parsing for the runway job scheduler.
//!
//! This crate handles parsing of:
//! - Scheduler configuration (timings, retry policy, database connection)
//! - Resolved job trees submitted as KDL documents

pub mod error;
pub mod jobtree;
mod nodes;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use jobtree::{load_job_tree, parse_job_tree};
pub use system::{DatabaseConfig, SchedulerConfig, load_scheduler_config, parse_scheduler_config};
