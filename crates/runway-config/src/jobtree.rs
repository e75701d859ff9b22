//! Job-tree documents.
//!
//! A job tree is the resolved form of a workflow for one trigger event:
//!
//! ```kdl
//! run workflow="<uuid>" repository="<uuid>" event="push" sha="abc123" actor="octo"
//! job "build" priority=100 {
//!     labels "linux" "x64"
//!     step "checkout"
//!     step "compile"
//! }
//! job "test" needs="build" { step "unit" }
//! ```

use kdl::{KdlDocument, KdlNode};
use runway_core::tree::{JobRequest, RunRequest, StepRequest};
use runway_core::{RepositoryId, WorkflowId};
use std::collections::BTreeSet;
use std::path::Path;

use crate::nodes::{
    get_all_string_args, get_bool_prop, get_first_string_arg, get_int_prop, get_string_list_prop,
    get_string_prop,
};
use crate::{ConfigError, ConfigResult};

/// Parse and validate a job tree from KDL text.
pub fn parse_job_tree(kdl: &str) -> ConfigResult<RunRequest> {
    let doc: KdlDocument = kdl.parse()?;

    let mut header = None;
    let mut jobs: Vec<JobRequest> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "run" => {
                if header.is_some() {
                    return Err(ConfigError::Duplicate("run".to_string()));
                }
                header = Some(node);
            }
            "job" => {
                let job = parse_job(node)?;
                if jobs.iter().any(|j| j.name == job.name) {
                    return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
                }
                jobs.push(job);
            }
            _ => {}
        }
    }

    let header = header.ok_or_else(|| ConfigError::MissingField("run".to_string()))?;

    let names: BTreeSet<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
    for job in &jobs {
        for dep in &job.needs {
            if !names.contains(dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.name, dep
                )));
            }
        }
    }

    let request = RunRequest {
        workflow_id: WorkflowId::from_uuid(required_uuid(header, "workflow")?),
        repository_id: RepositoryId::from_uuid(required_uuid(header, "repository")?),
        event: required_string(header, "event")?,
        head_sha: required_string(header, "sha")?,
        head_branch: get_string_prop(header, "branch")?,
        actor: get_string_prop(header, "actor")?.unwrap_or_default(),
        fail_fast: get_bool_prop(header, "fail-fast")?.unwrap_or(false),
        jobs,
    };
    request.validate()?;
    Ok(request)
}

/// Read and parse a job-tree file.
pub fn load_job_tree(path: impl AsRef<Path>) -> ConfigResult<RunRequest> {
    let text = std::fs::read_to_string(path)?;
    parse_job_tree(&text)
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobRequest> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let priority = match get_int_prop(node, "priority")? {
        Some(p) => i32::try_from(p)
            .map_err(|_| ConfigError::invalid("priority", format!("out of range: {}", p)))?,
        None => 0,
    };
    let max_retries = get_int_prop(node, "max-retries")?
        .map(|n| {
            i32::try_from(n)
                .ok()
                .filter(|n| *n >= 0)
                .ok_or_else(|| ConfigError::invalid("max-retries", format!("invalid: {}", n)))
        })
        .transpose()?;

    let mut labels = BTreeSet::new();
    let mut steps = Vec::new();
    let mut payload = serde_json::Value::Null;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "labels" => labels.extend(get_all_string_args(child)),
                "step" => {
                    let step_name = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("step name in job '{}'", name))
                    })?;
                    steps.push(StepRequest {
                        name: step_name,
                        continue_on_error: get_bool_prop(child, "continue-on-error")?
                            .unwrap_or(false),
                    });
                }
                "payload" => {
                    let raw = get_first_string_arg(child).unwrap_or_default();
                    payload = serde_json::from_str(&raw)
                        .map_err(|e| ConfigError::invalid("payload", e.to_string()))?;
                }
                _ => {}
            }
        }
    }

    Ok(JobRequest {
        needs: get_string_list_prop(node, "needs"),
        continue_on_error: get_bool_prop(node, "continue-on-error")?.unwrap_or(false),
        name,
        labels,
        priority,
        max_retries,
        steps,
        payload,
    })
}

fn required_string(node: &KdlNode, name: &str) -> ConfigResult<String> {
    get_string_prop(node, name)?.ok_or_else(|| ConfigError::MissingField(format!("run {}", name)))
}

fn required_uuid(node: &KdlNode, name: &str) -> ConfigResult<uuid::Uuid> {
    let raw = required_string(node, name)?;
    raw.parse()
        .map_err(|e: uuid::Error| ConfigError::invalid(name, e.to_string()))
}
