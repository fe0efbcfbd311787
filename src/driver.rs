use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::artifacts::{ArtifactSet, CollectedArtifacts};
use crate::error::CiError;
use crate::job::JobDescriptor;
use crate::observability::MetricsCollector;
use crate::plan::{JobPlan, Layout, build_plan};
use crate::runner::CommandRunner;
use crate::stage::{StageExecutor, StageFailure, StageReport};

/// Why a job stopped, in a form that can be written to a report.
#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub kind: &'static str,
    pub stage: Option<String>,
    pub step_index: Option<usize>,
    pub step: Option<String>,
    pub message: String,
    pub exit_code: i32,
}

impl From<&StageFailure> for FailureSummary {
    fn from(failure: &StageFailure) -> Self {
        Self {
            kind: failure.error.kind(),
            stage: Some(failure.stage.clone()),
            step_index: Some(failure.step_index),
            step: Some(failure.step_label.clone()),
            message: failure.error.to_string(),
            exit_code: failure.exit_code(),
        }
    }
}

impl From<&CiError> for FailureSummary {
    fn from(error: &CiError) -> Self {
        Self {
            kind: error.kind(),
            stage: None,
            step_index: None,
            step: None,
            message: error.to_string(),
            exit_code: error.exit_code(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobOutcome {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
    pub failure: Option<FailureSummary>,
    pub artifacts: Option<ArtifactSet>,
    pub collected: Option<CollectedArtifacts>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// 0 only when every stage succeeded; otherwise derived from the first failure.
    pub fn exit_code(&self) -> i32 {
        self.failure
            .as_ref()
            .map(|failure| failure.exit_code)
            .unwrap_or(0)
    }

    pub fn write_report(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        let report = RunReport {
            exit_code: self.exit_code(),
            outcome: self,
        };
        serde_json::to_writer_pretty(file, &report)
            .with_context(|| format!("Failed to write report JSON: {}", path.display()))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    exit_code: i32,
    #[serde(flatten)]
    outcome: &'a JobOutcome,
}

/// Runs a job's stages in order and collects its artifacts on success.
pub struct JobDriver<'a, R: CommandRunner + ?Sized> {
    job: &'a JobDescriptor,
    layout: Layout,
    runner: &'a mut R,
    metrics: MetricsCollector,
    artifacts_dir: Option<PathBuf>,
}

impl<'a, R: CommandRunner + ?Sized> JobDriver<'a, R> {
    pub fn new(job: &'a JobDescriptor, layout: Layout, runner: &'a mut R) -> Self {
        Self {
            job,
            layout,
            runner,
            metrics: MetricsCollector::new(),
            artifacts_dir: None,
        }
    }

    /// Copy rule matches here after a successful run instead of only listing them.
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn plan(&self) -> Result<JobPlan, CiError> {
        build_plan(self.job, &self.layout)
    }

    pub fn run(&mut self) -> JobOutcome {
        self.metrics.reset();
        let started = Instant::now();
        let started_at = Utc::now();
        info!(
            job = self.job.name.as_str(),
            variety = self.job.variety.as_deref(),
            target = self.job.target.as_str(),
            toolchain = self.job.toolchain(),
            work_dir = %self.layout.work_dir.display(),
            output_root = %self.layout.output_root.display(),
            "Starting job"
        );

        let mut outcome = JobOutcome {
            job: self.job.name.clone(),
            started_at,
            finished_at: started_at,
            stages: Vec::new(),
            failure: None,
            artifacts: None,
            collected: None,
        };

        match self.plan() {
            Ok(plan) => {
                let mut executor = StageExecutor::new(&mut *self.runner, self.metrics.clone());
                for stage in &plan.stages {
                    match executor.run_stage(stage) {
                        Ok(report) => outcome.stages.push(report),
                        Err(failure) => {
                            outcome.failure = Some(FailureSummary::from(&failure));
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                error!("{err}");
                outcome.failure = Some(FailureSummary::from(&err));
            }
        }

        if outcome.succeeded() {
            self.collect_artifacts(&mut outcome);
        }

        self.metrics.record_total_duration(started.elapsed());
        outcome.finished_at = Utc::now();

        match &outcome.failure {
            None => info!(job = self.job.name.as_str(), "Job succeeded"),
            Some(failure) => error!(
                job = self.job.name.as_str(),
                stage = failure.stage.as_deref(),
                step = failure.step.as_deref(),
                exit_code = failure.exit_code,
                "Job failed"
            ),
        }
        outcome
    }

    /// Output rules are advisory, so problems here are logged and never fail the job.
    fn collect_artifacts(&self, outcome: &mut JobOutcome) {
        let set = match ArtifactSet::resolve(&self.job.output_rules, &self.layout.output_root) {
            Ok(set) => set,
            Err(err) => {
                warn!("Failed to resolve output rules: {err:#}");
                return;
            }
        };
        set.log();

        if let Some(dir) = &self.artifacts_dir {
            match set.collect(dir) {
                Ok(collected) => outcome.collected = Some(collected),
                Err(err) => warn!("Failed to collect artifacts: {err:#}"),
            }
        }
        outcome.artifacts = Some(set);
    }
}
