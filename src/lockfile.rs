use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::digest::digest_strings;
use crate::job::JobDescriptor;
use crate::plan::{JobPlan, Layout};
use crate::stage::Step;

/// A resolved, reviewable snapshot of everything a job would execute.
#[derive(Debug, Serialize)]
pub struct PlanLock {
    pub job: String,
    pub variety: Option<String>,
    pub target: String,
    pub rust_toolchain: String,
    pub generated_at: DateTime<Utc>,
    pub layout: Layout,
    pub output_rules: Vec<String>,
    pub stages: Vec<StageLock>,
    pub plan_digest: String,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub name: String,
    pub steps: Vec<StepLock>,
}

#[derive(Debug, Serialize)]
pub struct StepLock {
    pub label: String,
    pub kind: &'static str,
    pub command: String,
    pub cwd: Option<String>,
    pub measured: bool,
    pub digest: String,
}

impl PlanLock {
    pub fn new(job: &JobDescriptor, layout: &Layout, plan: &JobPlan) -> Self {
        let stages: Vec<StageLock> = plan
            .stages
            .iter()
            .map(|stage| StageLock {
                name: stage.name.clone(),
                steps: stage.steps.iter().map(lock_step).collect(),
            })
            .collect();

        let plan_digest = digest_strings(
            std::iter::once(job.toolchain().to_string()).chain(
                stages
                    .iter()
                    .flat_map(|stage| stage.steps.iter().map(|step| step.digest.clone())),
            ),
        );

        Self {
            job: job.name.clone(),
            variety: job.variety.clone(),
            target: job.target.clone(),
            rust_toolchain: job.toolchain().to_string(),
            generated_at: Utc::now(),
            layout: layout.clone(),
            output_rules: job
                .output_rules
                .iter()
                .map(|rule| rule.pattern().to_string())
                .collect(),
            stages,
            plan_digest,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialise plan lock")
    }
}

pub fn generate_lock(job: &JobDescriptor, layout: &Layout, plan: &JobPlan, path: &Path) -> Result<()> {
    let lock = PlanLock::new(job, layout, plan);
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(())
}

fn lock_step(step: &Step) -> StepLock {
    let (kind, cwd, measured) = match step {
        Step::Exec(exec) => ("exec", Some(exec.cwd.display().to_string()), exec.measure),
        Step::Package { .. } => ("package", None, false),
        Step::RemoveDir { .. } => ("remove_dir", None, false),
        Step::CopyFile { .. } => ("copy_file", None, false),
        Step::CopyTree { .. } => ("copy_tree", None, false),
    };
    let command = step.describe();
    let digest = digest_strings([
        kind,
        step.label(),
        command.as_str(),
        cwd.as_deref().unwrap_or(""),
    ]);
    StepLock {
        label: step.label().to_string(),
        kind,
        command,
        cwd,
        measured,
        digest,
    }
}
