//! The scheduler daemon and queue inspection.

use anyhow::Result;
use runway_db::run_migrations;
use tracing::{info, warn};

use super::Context;

pub async fn run(ctx: &Context) -> Result<()> {
    run_migrations(&ctx.pool).await?;
    ctx.scheduler
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
        })
        .await;
    Ok(())
}

pub async fn queue(ctx: &Context) -> Result<()> {
    let entries = ctx.scheduler.queue_snapshot().await?;
    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for entry in entries {
        let holder = entry
            .lease_holder
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        let quarantine = entry.quarantine_reason.as_deref().unwrap_or("");
        println!(
            "{}  job={}  {}  priority={}  holder={}  {}",
            entry.id, entry.job_id, entry.status, entry.priority, holder, quarantine
        );
    }
    Ok(())
}
