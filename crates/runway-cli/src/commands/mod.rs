//! CLI command implementations.

pub mod jobs;
pub mod runs;
pub mod scheduler;
pub mod workflows;

use anyhow::{Context as _, Result, bail};
use runway_config::SchedulerConfig;
use runway_db::{PgSchedulerStore, create_pool, run_migrations};
use runway_scheduler::{NullDispatcher, Scheduler};
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Connected scheduler shared by every command.
pub struct Context {
    pub pool: PgPool,
    pub scheduler: Scheduler,
}

impl Context {
    pub async fn connect(config: SchedulerConfig) -> Result<Self> {
        let Some(url) = config.database.url.clone() else {
            bail!("no database configured; set RUNWAY_DATABASE_URL or database url= in the config");
        };
        info!("Connecting to database...");
        let pool = create_pool(&url, config.database.max_connections).await?;
        info!("Database connected");

        let store = Arc::new(PgSchedulerStore::new(pool.clone()));
        let scheduler = Scheduler::new(store, Arc::new(NullDispatcher), config);
        Ok(Self { pool, scheduler })
    }
}

/// Load the scheduler configuration. A missing file means defaults.
pub fn load_config(path: &Path, database_url: Option<String>) -> Result<SchedulerConfig> {
    let mut config = if path.exists() {
        runway_config::load_scheduler_config(path)
            .with_context(|| format!("loading {}", path.display()))?
    } else {
        warn!(path = %path.display(), "Configuration file not found, using defaults");
        SchedulerConfig::default()
    };
    if database_url.is_some() {
        config.database.url = database_url;
    }
    Ok(config)
}

pub async fn migrate(ctx: &Context) -> Result<()> {
    run_migrations(&ctx.pool).await?;
    println!("Migrations applied");
    Ok(())
}

pub fn validate(path: &Path, job_tree: bool) -> Result<()> {
    let checked = if job_tree {
        runway_config::load_job_tree(path).map(|tree| {
            format!("job tree with {} jobs", tree.jobs.len())
        })
    } else {
        runway_config::load_scheduler_config(path).map(|_| "scheduler configuration".to_string())
    };
    match checked {
        Ok(what) => {
            println!("Valid {}", what);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
