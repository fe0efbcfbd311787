use serde::Serialize;

use crate::job::JobDescriptor;

const KNOWN_VARIETIES: [&str; 2] = ["basic", "rolling"];

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_job(job: &JobDescriptor) -> ValidationReport {
    let mut report = ValidationReport::default();

    if job.name.trim().is_empty() {
        report.errors.push("Job name cannot be empty".into());
    }
    if job.target.trim().is_empty() {
        report.errors.push("Target platform cannot be empty".into());
    }
    if job.toolchain().is_empty() {
        report.errors.push("Toolchain version cannot be empty".into());
    }
    if let Some(variety) = &job.variety
        && !KNOWN_VARIETIES.contains(&variety.as_str())
    {
        report
            .warnings
            .push(format!("Unrecognised job variety '{variety}'"));
    }

    report.merge(validate_output_rules(job));
    report.merge(validate_settings(job));
    report
}

fn validate_output_rules(job: &JobDescriptor) -> ValidationReport {
    let mut report = ValidationReport::default();
    if job.output_rules.is_empty() {
        report
            .errors
            .push("At least one output rule is required".into());
    }
    for (idx, rule) in job.output_rules.iter().enumerate() {
        let pattern = rule.pattern();
        if pattern.trim().is_empty() {
            report
                .errors
                .push(format!("Output rule {} is empty", idx + 1));
        } else if let Err(err) = glob::Pattern::new(pattern) {
            report.errors.push(format!(
                "Output rule {} ('{}') is not a valid glob: {}",
                idx + 1,
                pattern,
                err
            ));
        }
        if let Some(destination) = rule.destination()
            && destination.is_absolute()
        {
            report.errors.push(format!(
                "Output rule {} destination '{}' must be relative",
                idx + 1,
                destination.display()
            ));
        }
    }
    report
}

fn validate_settings(job: &JobDescriptor) -> ValidationReport {
    let mut report = ValidationReport::default();
    let settings = &job.settings;

    if settings.artifact.trim().is_empty() {
        report.errors.push("Artifact name cannot be empty".into());
    } else if settings.artifact.contains('/') {
        report
            .errors
            .push(format!("Artifact name '{}' must not contain '/'", settings.artifact));
    }
    if settings.build_executor.is_empty() {
        report
            .errors
            .push("Build executor command cannot be empty".into());
    }
    if settings.measure_wrapper.is_empty() {
        report.warnings.push(
            "No measurement wrapper configured; peak memory will not be reported".into(),
        );
    }
    if settings.fetch.repository.trim().is_empty() {
        report
            .errors
            .push("settings.fetch.repository is required for the test stage".into());
    }
    if settings.fetch.branch.trim().is_empty() {
        report.errors.push("Fetch branch cannot be empty".into());
    }
    if settings.manifest_file.trim().is_empty() {
        report.errors.push("Manifest file name cannot be empty".into());
    }
    if settings.build_output_dir.trim().is_empty() {
        report
            .errors
            .push("Build output directory cannot be empty".into());
    }
    report
}
