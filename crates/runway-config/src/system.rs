//! Scheduler configuration parsing.

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::nodes::{get_first_arg, get_first_string_arg, get_int_prop, get_string_prop};
use crate::{ConfigError, ConfigResult};

/// Timing and retry policy for a scheduler process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identifies this process in logs.
    pub worker_id: String,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    /// Multiplied by the job's retry count to delay a requeued entry.
    pub retry_backoff: Duration,
    /// Used for jobs whose tree does not set `max-retries`.
    pub default_max_retries: i32,
    /// How long a cancelling job may run before it is forced to `cancelled`.
    pub cancel_grace: Duration,
    /// A runner silent for longer is marked offline.
    pub runner_heartbeat_timeout: Duration,
    /// A pending job no live runner can ever take fails after this long.
    pub no_runner_timeout: Duration,
    pub dispatch_timeout: Duration,
    /// Maximum leases handed out per tick.
    pub dispatch_batch: usize,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: "scheduler".to_string(),
            poll_interval: Duration::from_millis(1000),
            lease_ttl: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(10),
            default_max_retries: 2,
            cancel_grace: Duration::from_secs(60),
            runner_heartbeat_timeout: Duration::from_secs(90),
            no_runner_timeout: Duration::from_secs(600),
            dispatch_timeout: Duration::from_millis(5000),
            dispatch_batch: 32,
            database: DatabaseConfig::default(),
        }
    }
}

// Upper bound on any configured duration or count.
const MAX_VALUE: i128 = u32::MAX as i128;

/// Parse scheduler configuration from KDL text. Every key is optional.
pub fn parse_scheduler_config(kdl: &str) -> ConfigResult<SchedulerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SchedulerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "scheduler" => parse_scheduler_block(node, &mut config)?,
            "database" => parse_database(node, &mut config.database)?,
            _ => {}
        }
    }

    Ok(config)
}

/// Read and parse a scheduler configuration file.
pub fn load_scheduler_config(path: impl AsRef<Path>) -> ConfigResult<SchedulerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_scheduler_config(&text)
}

fn parse_scheduler_block(node: &KdlNode, config: &mut SchedulerConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let key = child.name().value();
        match key {
            "worker-id" => {
                config.worker_id = get_first_string_arg(child)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| ConfigError::invalid(key, "expected a non-empty string"))?;
            }
            "poll-interval-ms" => config.poll_interval = millis(child)?,
            "lease-ttl-secs" => config.lease_ttl = secs(child)?,
            "retry-backoff-secs" => config.retry_backoff = secs(child)?,
            "default-max-retries" => {
                config.default_max_retries = non_negative(child)? as i32;
            }
            "cancel-grace-secs" => config.cancel_grace = secs(child)?,
            "runner-heartbeat-timeout-secs" => config.runner_heartbeat_timeout = secs(child)?,
            "no-runner-timeout-secs" => config.no_runner_timeout = secs(child)?,
            "dispatch-timeout-ms" => config.dispatch_timeout = millis(child)?,
            "dispatch-batch" => config.dispatch_batch = positive(child)? as usize,
            _ => {}
        }
    }
    Ok(())
}

fn parse_database(node: &KdlNode, database: &mut DatabaseConfig) -> ConfigResult<()> {
    if let Some(url) = get_string_prop(node, "url")? {
        database.url = Some(url);
    }
    if let Some(n) = get_int_prop(node, "max-connections")? {
        if n <= 0 || n > MAX_VALUE {
            return Err(ConfigError::invalid("max-connections", "must be positive"));
        }
        database.max_connections = n as u32;
    }
    Ok(())
}

fn int_arg(node: &KdlNode) -> ConfigResult<i128> {
    let key = node.name().value();
    get_first_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("value for {}", key)))?
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(key, "expected an integer"))
}

fn positive(node: &KdlNode) -> ConfigResult<u32> {
    let n = int_arg(node)?;
    if n <= 0 || n > MAX_VALUE {
        return Err(ConfigError::invalid(
            node.name().value(),
            format!("must be positive, got {}", n),
        ));
    }
    Ok(n as u32)
}

fn non_negative(node: &KdlNode) -> ConfigResult<u32> {
    let n = int_arg(node)?;
    if !(0..=i32::MAX as i128).contains(&n) {
        return Err(ConfigError::invalid(
            node.name().value(),
            format!("must not be negative, got {}", n),
        ));
    }
    Ok(n as u32)
}

fn secs(node: &KdlNode) -> ConfigResult<Duration> {
    positive(node).map(|n| Duration::from_secs(n.into()))
}

fn millis(node: &KdlNode) -> ConfigResult<Duration> {
    positive(node).map(|n| Duration::from_millis(n.into()))
}
