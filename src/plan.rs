//! The fixed stage sequence a job runs.
//!
//! Every step carries its own working directory, so entering the fetched
//! tree is a property of the steps that follow the clone rather than
//! process-wide state.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::CiError;
use crate::job::JobDescriptor;
use crate::runner::{ExecStep, Invocation, StepRole};
use crate::stage::{Stage, Step};

pub const STAGE_PROBE: &str = "probe";
pub const STAGE_BUILD: &str = "build";
pub const STAGE_PACKAGE: &str = "package";
pub const STAGE_STATIC_CHECK: &str = "static-check";
pub const STAGE_TEST: &str = "test";

pub const STAGE_ORDER: [&str; 5] = [
    STAGE_PROBE,
    STAGE_BUILD,
    STAGE_PACKAGE,
    STAGE_STATIC_CHECK,
    STAGE_TEST,
];

/// Directories a job reads from and writes to, all absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    /// The project checkout that is built.
    pub work_dir: PathBuf,
    /// Where packaged artifacts and test outputs land.
    pub output_root: PathBuf,
    pub target_dir: PathBuf,
    /// Clone destination for the test stage; removed before every fetch.
    pub scratch_dir: PathBuf,
}

impl Layout {
    pub fn new(job: &JobDescriptor, work_dir: &Path, output_root: &Path) -> io::Result<Self> {
        let work_dir = std::path::absolute(work_dir)?;
        let output_root = std::path::absolute(output_root)?;
        let scratch = &job.settings.fetch.scratch_dir;
        let scratch_dir = if scratch.is_absolute() {
            scratch.clone()
        } else {
            work_dir.join(scratch)
        };
        Ok(Self {
            target_dir: work_dir.join("target"),
            work_dir,
            output_root,
            scratch_dir,
        })
    }

    pub fn packaged(&self, configuration: &str, artifact: &str) -> PathBuf {
        self.output_root.join(configuration).join(artifact)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPlan {
    pub stages: Vec<Stage>,
}

impl JobPlan {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.steps.len()).sum()
    }
}

pub fn build_plan(job: &JobDescriptor, layout: &Layout) -> Result<JobPlan, CiError> {
    let settings = &job.settings;
    if settings.artifact.trim().is_empty() {
        return Err(CiError::InvalidJob("artifact name is empty".into()));
    }
    let executor = Invocation::from_argv(&settings.build_executor)
        .ok_or_else(|| CiError::InvalidJob("build executor command is empty".into()))?;
    if settings.fetch.repository.trim().is_empty() {
        return Err(CiError::InvalidJob(
            "settings.fetch.repository is required for the test stage".into(),
        ));
    }

    let work = layout.work_dir.as_path();
    let cargo = |label: &str, args: &[&str]| {
        Step::Exec(ExecStep::new(
            label,
            Invocation::new(settings.cargo.as_str(), args.iter().copied()),
            work,
        ))
    };
    let artifact = settings.artifact.as_str();

    let probe = Stage::new(
        STAGE_PROBE,
        vec![
            Step::Exec(ExecStep::new(
                "rustc-version",
                Invocation::new(settings.rustc.as_str(), ["--version"]),
                work,
            )),
            cargo("cargo-version", &["--version"]),
        ],
    );

    let build = Stage::new(
        STAGE_BUILD,
        vec![
            cargo("check", &["check"]),
            cargo("build-debug", &["build"]),
            cargo("build-release", &["build", "--release"]),
        ],
    );

    let package = Stage::new(
        STAGE_PACKAGE,
        ["debug", "release"]
            .into_iter()
            .map(|configuration| Step::Package {
                label: format!("package-{configuration}"),
                from: layout.target_dir.join(configuration).join(artifact),
                to: layout.packaged(configuration, artifact),
            })
            .collect(),
    );

    let static_check = Stage::new(
        STAGE_STATIC_CHECK,
        vec![
            cargo("fmt", &["fmt", "--all", "--", "--check"]),
            cargo(
                "clippy",
                &["clippy", "--all-targets", "--", "--deny", "warnings"],
            ),
        ],
    );

    let scratch = layout.scratch_dir.as_path();
    let fetch = &settings.fetch;
    let manifest = scratch.join(&settings.manifest_file);
    let release_binary = layout.packaged("release", artifact);
    let test = Stage::new(
        STAGE_TEST,
        vec![
            Step::RemoveDir {
                label: "clean-scratch".into(),
                path: scratch.to_path_buf(),
            },
            Step::Exec(
                ExecStep::new(
                    "fetch",
                    Invocation::new(
                        settings.git.as_str(),
                        [
                            "clone".to_string(),
                            "--depth".to_string(),
                            "1".to_string(),
                            "--branch".to_string(),
                            fetch.branch.clone(),
                            fetch.repository.clone(),
                            scratch.display().to_string(),
                        ],
                    ),
                    work,
                )
                .with_role(StepRole::Fetch {
                    repository: fetch.repository.clone(),
                }),
            ),
            Step::Exec(
                ExecStep::new(
                    "generate-manifest",
                    Invocation::new(release_binary.display().to_string(), Vec::<String>::new()),
                    scratch,
                )
                .measured()
                .expecting(&manifest),
            ),
            Step::CopyFile {
                label: "copy-manifest".into(),
                from: manifest,
                to: layout.output_root.join(&settings.manifest_file),
            },
            Step::Exec(ExecStep::new("execute-manifest", executor, scratch).measured()),
            Step::CopyTree {
                label: "copy-build-output".into(),
                from: scratch.join(&settings.build_output_dir),
                to: layout.output_root.join(&settings.build_output_dir),
            },
        ],
    );

    Ok(JobPlan {
        stages: vec![probe, build, package, static_check, test],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSettings, OutputRule};

    fn job() -> JobDescriptor {
        let mut settings = JobSettings::default();
        settings.fetch.repository = "https://example.invalid/eos.git".into();
        JobDescriptor {
            name: "build-and-test".into(),
            variety: Some("basic".into()),
            target: "helios-2.0".into(),
            rust_toolchain: "stable".into(),
            output_rules: vec![OutputRule::from("debug/*")],
            settings,
        }
    }

    fn layout(job: &JobDescriptor) -> Layout {
        Layout::new(job, Path::new("/src/eos"), Path::new("/work")).unwrap()
    }

    #[test]
    fn stages_follow_fixed_order() {
        let job = job();
        let plan = build_plan(&job, &layout(&job)).unwrap();
        let names: Vec<_> = plan.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, STAGE_ORDER);
        assert_eq!(plan.step_count(), 15);
    }

    #[test]
    fn test_stage_enters_scratch_tree_explicitly() {
        let job = job();
        let layout = layout(&job);
        let plan = build_plan(&job, &layout).unwrap();
        let test = plan.stage(STAGE_TEST).unwrap();

        let labels: Vec<_> = test.steps.iter().map(Step::label).collect();
        assert_eq!(
            labels,
            vec![
                "clean-scratch",
                "fetch",
                "generate-manifest",
                "copy-manifest",
                "execute-manifest",
                "copy-build-output"
            ]
        );

        let Step::Exec(generate) = &test.steps[2] else {
            panic!("expected exec step");
        };
        assert_eq!(generate.cwd, PathBuf::from("/src/eos/scratch"));
        assert!(generate.measure);
        assert_eq!(generate.pipeline[0].program, "/work/release/eos");
        assert_eq!(
            generate.expects,
            Some(PathBuf::from("/src/eos/scratch/build.ninja"))
        );

        let Step::Exec(fetch) = &test.steps[1] else {
            panic!("expected exec step");
        };
        assert!(matches!(fetch.role, StepRole::Fetch { .. }));
        assert_eq!(
            fetch.command_line(),
            "git clone --depth 1 --branch main https://example.invalid/eos.git /src/eos/scratch"
        );
    }

    #[test]
    fn lint_treats_warnings_as_errors() {
        let job = job();
        let plan = build_plan(&job, &layout(&job)).unwrap();
        let check = plan.stage(STAGE_STATIC_CHECK).unwrap();
        let Step::Exec(clippy) = &check.steps[1] else {
            panic!("expected exec step");
        };
        assert_eq!(
            clippy.command_line(),
            "cargo clippy --all-targets -- --deny warnings"
        );
    }

    #[test]
    fn missing_repository_is_rejected() {
        let mut job = job();
        job.settings.fetch.repository.clear();
        let err = build_plan(&job, &layout(&job)).unwrap_err();
        assert!(matches!(err, CiError::InvalidJob(_)));
    }

    #[test]
    fn absolute_scratch_dir_is_kept() {
        let mut job = job();
        job.settings.fetch.scratch_dir = PathBuf::from("/tmp/eos-src");
        assert_eq!(layout(&job).scratch_dir, PathBuf::from("/tmp/eos-src"));
    }
}
