//! Workflow commands.

use anyhow::Result;
use runway_core::{RepositoryId, WorkflowId};
use uuid::Uuid;

use super::Context;

pub async fn register(ctx: &Context, repository: Uuid, path: &str) -> Result<()> {
    let workflow = ctx
        .scheduler
        .register_workflow(RepositoryId::from_uuid(repository), path)
        .await?;
    println!("{}", workflow.id);
    Ok(())
}

pub async fn set_enabled(ctx: &Context, id: Uuid, enabled: bool) -> Result<()> {
    let workflow = ctx
        .scheduler
        .set_workflow_enabled(WorkflowId::from_uuid(id), enabled)
        .await?;
    let state = if workflow.enabled { "enabled" } else { "disabled" };
    println!("Workflow {} {}", workflow.id, state);
    Ok(())
}

pub async fn delete(ctx: &Context, id: Uuid) -> Result<()> {
    ctx.scheduler.delete_workflow(WorkflowId::from_uuid(id)).await?;
    println!("Workflow {} deleted", id);
    Ok(())
}
