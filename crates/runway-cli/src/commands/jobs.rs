//! Job commands.

use anyhow::Result;
use runway_core::JobId;
use uuid::Uuid;

use super::Context;

pub async fn retry(ctx: &Context, id: Uuid) -> Result<()> {
    let run = ctx.scheduler.retry_job(JobId::from_uuid(id)).await?;
    println!("Re-run #{} {}", run.number, run.id);
    Ok(())
}

pub async fn enqueue(ctx: &Context, id: Uuid, priority: i32) -> Result<()> {
    let entry = ctx.scheduler.enqueue(JobId::from_uuid(id), priority).await?;
    println!("Entry {} {}", entry.id, entry.status);
    Ok(())
}
