//! Run commands.

use anyhow::Result;
use runway_core::{RepositoryId, RunId};
use std::path::Path;
use uuid::Uuid;

use super::Context;

pub async fn submit(ctx: &Context, path: &Path) -> Result<()> {
    let request = runway_config::load_job_tree(path)?;
    let run = ctx.scheduler.submit_run(&request).await?;
    println!("Run #{} {}", run.number, run.id);
    Ok(())
}

pub async fn list(ctx: &Context, repository: Uuid, limit: i64) -> Result<()> {
    let runs = ctx
        .scheduler
        .list_runs(RepositoryId::from_uuid(repository), limit)
        .await?;
    for run in runs {
        let conclusion = run.conclusion.map_or("-", |c| c.as_str());
        println!(
            "#{:<5} {}  {:<11} {:<9} {}  {}",
            run.number,
            run.id,
            run.status.as_str(),
            conclusion,
            run.event,
            run.head_sha
        );
    }
    Ok(())
}

pub async fn show(ctx: &Context, id: Uuid) -> Result<()> {
    let view = ctx.scheduler.run_view(RunId::from_uuid(id)).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

pub async fn cancel(ctx: &Context, id: Uuid) -> Result<()> {
    let run = ctx.scheduler.cancel_run(RunId::from_uuid(id)).await?;
    println!("Run #{} {}", run.number, run.status);
    Ok(())
}
