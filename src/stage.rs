use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::artifacts::copy_path;
use crate::error::CiError;
use crate::observability::MetricsCollector;
use crate::runner::{CommandRunner, ExecStep, ExecutionResult, ExitOutcome, StepRole};

/// A named, ordered group of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Stage {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Exec(ExecStep),
    /// Copy a freshly built artifact into the output tree. A missing source
    /// means the build lied about success.
    Package {
        label: String,
        from: PathBuf,
        to: PathBuf,
    },
    /// Force-remove a directory; absence is fine.
    RemoveDir { label: String, path: PathBuf },
    CopyFile {
        label: String,
        from: PathBuf,
        to: PathBuf,
    },
    /// Replace `to` with a recursive copy of `from`.
    CopyTree {
        label: String,
        from: PathBuf,
        to: PathBuf,
    },
}

impl Step {
    pub fn label(&self) -> &str {
        match self {
            Step::Exec(exec) => &exec.label,
            Step::Package { label, .. }
            | Step::RemoveDir { label, .. }
            | Step::CopyFile { label, .. }
            | Step::CopyTree { label, .. } => label,
        }
    }

    /// Human-readable form used in logs and the plan lock.
    pub fn describe(&self) -> String {
        match self {
            Step::Exec(exec) => exec.command_line(),
            Step::Package { from, to, .. } => {
                format!("package {} -> {}", from.display(), to.display())
            }
            Step::RemoveDir { path, .. } => format!("rm -rf {}", path.display()),
            Step::CopyFile { from, to, .. } => format!("cp {} {}", from.display(), to.display()),
            Step::CopyTree { from, to, .. } => {
                format!("cp -r {} {}", from.display(), to.display())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub label: String,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExitOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_kb: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub duration: Duration,
    pub steps: Vec<StepReport>,
}

/// The first failing step of a stage and why it failed.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed at step {step_index} ({step_label}): {error}")]
pub struct StageFailure {
    pub stage: String,
    pub step_index: usize,
    pub step_label: String,
    pub result: Option<ExecutionResult>,
    #[source]
    pub error: CiError,
}

impl StageFailure {
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

const FAILURE_TAIL_LINES: usize = 40;

/// Runs stages step by step through a [`CommandRunner`], stopping at the first failure.
pub struct StageExecutor<'a, R: CommandRunner + ?Sized> {
    runner: &'a mut R,
    metrics: MetricsCollector,
}

impl<'a, R: CommandRunner + ?Sized> StageExecutor<'a, R> {
    pub fn new(runner: &'a mut R, metrics: MetricsCollector) -> Self {
        Self { runner, metrics }
    }

    #[instrument(skip_all, fields(stage = %stage.name))]
    pub fn run_stage(&mut self, stage: &Stage) -> Result<StageReport, StageFailure> {
        info!("==> stage {}", stage.name);
        let _timer = self.metrics.start_stage(&stage.name);
        let started = Instant::now();
        let mut steps = Vec::with_capacity(stage.steps.len());

        for (step_index, step) in stage.steps.iter().enumerate() {
            let step_started = Instant::now();
            let (result, failure) = self.run_step(step);
            let duration = step_started.elapsed();
            let measured = matches!(step, Step::Exec(exec) if exec.measure);
            self.metrics.record_step(
                &stage.name,
                step.label(),
                result.as_ref().map(|r| r.duration).unwrap_or(duration),
                result.as_ref().and_then(|r| r.peak_memory_kb),
                measured,
            );

            if let Some(error) = failure {
                error!(
                    stage = stage.name.as_str(),
                    step = step.label(),
                    step_index,
                    command = %step.describe(),
                    exit_code = error.exit_code(),
                    "{error}"
                );
                self.metrics.record_failure(&stage.name);
                return Err(StageFailure {
                    stage: stage.name.clone(),
                    step_index,
                    step_label: step.label().to_string(),
                    result,
                    error,
                });
            }

            steps.push(StepReport {
                label: step.label().to_string(),
                duration,
                outcome: result.as_ref().map(|r| r.outcome),
                peak_memory_kb: result.and_then(|r| r.peak_memory_kb),
            });
        }

        Ok(StageReport {
            name: stage.name.clone(),
            duration: started.elapsed(),
            steps,
        })
    }

    fn run_step(&mut self, step: &Step) -> (Option<ExecutionResult>, Option<CiError>) {
        match step {
            Step::Exec(exec) => match self.runner.run(exec) {
                Ok(result) => {
                    let failure = classify(exec, &result);
                    (Some(result), failure)
                }
                Err(err) => (None, Some(err)),
            },
            Step::Package { from, to, .. } => (None, package(from, to).err()),
            Step::RemoveDir { path, .. } => (None, remove_dir(path).err()),
            Step::CopyFile { from, to, .. } => (
                None,
                copy_path(from, to)
                    .map_err(|source| {
                        CiError::io(
                            format!("failed to copy {} to {}", from.display(), to.display()),
                            source,
                        )
                    })
                    .err(),
            ),
            Step::CopyTree { from, to, .. } => (None, replace_tree(from, to).err()),
        }
    }
}

/// Turn a finished command into the error its role calls for, if any.
fn classify(exec: &ExecStep, result: &ExecutionResult) -> Option<CiError> {
    let output_tail = result.output_tail(FAILURE_TAIL_LINES);
    match (result.outcome, &exec.role) {
        (ExitOutcome::Code(0), _) => exec
            .expects
            .as_ref()
            .filter(|path| !path.exists())
            .map(|path| CiError::ManifestGeneration { path: path.clone() }),
        (ExitOutcome::Signal(signal), _) => Some(CiError::AbnormalTermination {
            command: exec.command_line(),
            signal,
            output_tail,
        }),
        (ExitOutcome::Code(code), StepRole::Fetch { repository }) => Some(CiError::Fetch {
            repository: repository.clone(),
            code,
            output_tail,
        }),
        (ExitOutcome::Code(code), StepRole::Command) => Some(CiError::CommandFailure {
            command: exec.command_line(),
            code,
            output_tail,
        }),
    }
}

fn package(from: &Path, to: &Path) -> Result<(), CiError> {
    if !from.is_file() {
        return Err(CiError::Packaging {
            path: from.to_path_buf(),
        });
    }
    copy_path(from, to).map_err(|source| {
        CiError::io(
            format!("failed to package {} into {}", from.display(), to.display()),
            source,
        )
    })?;
    info!(from = %from.display(), to = %to.display(), "Packaged artifact");
    Ok(())
}

fn remove_dir(path: &Path) -> Result<(), CiError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            info!(path = %path.display(), "Removed stale directory");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CiError::io(
            format!("failed to remove {}", path.display()),
            err,
        )),
    }
}

fn replace_tree(from: &Path, to: &Path) -> Result<(), CiError> {
    remove_dir(to)?;
    copy_path(from, to).map_err(|source| {
        CiError::io(
            format!("failed to copy {} to {}", from.display(), to.display()),
            source,
        )
    })
}
