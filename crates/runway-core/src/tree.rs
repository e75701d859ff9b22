//! Resolved job trees, as produced by the trigger/definition resolver.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::{Error, RepositoryId, Result, WorkflowId};

/// Everything needed to create a run with its job tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub workflow_id: WorkflowId,
    pub repository_id: RepositoryId,
    pub event: String,
    pub head_sha: String,
    pub head_branch: Option<String>,
    pub actor: String,
    #[serde(default)]
    pub fail_fast: bool,
    pub jobs: Vec<JobRequest>,
}

/// One job of a resolved tree. `needs` refers to other jobs by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub priority: i32,
    /// Falls back to the scheduler's configured default.
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub steps: Vec<StepRequest>,
    /// Opaque payload stored on the queue entry and handed to the runner.
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRequest {
    pub name: String,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl RunRequest {
    /// Check job names, dependency references and acyclicity.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(Error::InvalidInput("run has no jobs".to_string()));
        }

        let mut names = BTreeSet::new();
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(Error::InvalidInput("job name is empty".to_string()));
            }
            if !names.insert(job.name.as_str()) {
                return Err(Error::InvalidInput(format!("duplicate job '{}'", job.name)));
            }
            if job.max_retries.is_some_and(|n| n < 0) {
                return Err(Error::InvalidInput(format!(
                    "job '{}' has negative max_retries",
                    job.name
                )));
            }
        }

        for job in &self.jobs {
            for dep in &job.needs {
                if !names.contains(dep.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "job '{}' depends on unknown job '{}'",
                        job.name, dep
                    )));
                }
            }
        }

        if let Some(cycle) = detect_cycle(&self.jobs) {
            return Err(Error::InvalidInput(format!(
                "cycle detected in dependencies: {}",
                cycle
            )));
        }
        Ok(())
    }
}

/// Detect cycles in the job dependency graph using DFS.
fn detect_cycle(jobs: &[JobRequest]) -> Option<String> {
    let job_map: HashMap<&str, &JobRequest> =
        jobs.iter().map(|j| (j.name.as_str(), j)).collect();
    let mut visited = HashMap::new();
    let mut on_stack = HashMap::new();

    jobs.iter().find_map(|job| {
        if visited.contains_key(job.name.as_str()) {
            None
        } else {
            dfs_detect_cycle(&job.name, &job_map, &mut visited, &mut on_stack)
        }
    })
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    job_map: &HashMap<&'a str, &'a JobRequest>,
    visited: &mut HashMap<&'a str, bool>,
    on_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    on_stack.insert(node, true);

    if let Some(job) = job_map.get(node).copied() {
        for dep in &job.needs {
            let dep: &'a str = dep.as_str();
            if !visited.contains_key(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, job_map, visited, on_stack) {
                    return Some(cycle);
                }
            } else if on_stack.get(dep).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    on_stack.insert(node, false);
    None
}
