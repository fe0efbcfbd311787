use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use eos_ci::artifacts::ArtifactSet;
use eos_ci::driver::JobDriver;
use eos_ci::error::EXIT_INVALID_JOB;
use eos_ci::job::JobDescriptor;
use eos_ci::lockfile::{PlanLock, generate_lock};
use eos_ci::observability::log_snapshot;
use eos_ci::plan::{Layout, STAGE_ORDER, build_plan};
use eos_ci::runner::ProcessRunner;
use eos_ci::validation::{ValidationReport, validate_job};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let otlp_endpoint = match &cli.command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };
    configure_tracing(otlp_endpoint.as_deref())?;

    let result = match cli.command {
        Commands::Run {
            job,
            layout,
            artifacts_dir,
            dry_run,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            report,
            otlp_endpoint: _,
        } => run_job(RunOptions {
            job_path: job,
            layout,
            artifacts_dir,
            dry_run,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            report,
        }),
        Commands::Validate { job } => validate_job_cmd(&job),
        Commands::Plan {
            job,
            layout,
            output,
        } => plan_job(&job, &layout, output),
        Commands::Collect {
            job,
            output_root,
            artifacts_dir,
        } => collect_artifacts(&job, &output_root, &artifacts_dir),
        Commands::ListStages => {
            list_stages();
            Ok(ExitCode::SUCCESS)
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "eos-ci")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct RunOptions {
    job_path: PathBuf,
    layout: LayoutArgs,
    artifacts_dir: Option<PathBuf>,
    dry_run: bool,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    report: Option<PathBuf>,
}

fn run_job(options: RunOptions) -> Result<ExitCode> {
    let job = JobDescriptor::load(&options.job_path)?;
    let report = validate_job(&job);
    if !log_validation(&options.job_path, &report) {
        error!(
            file = %options.job_path.display(),
            "Job validation failed with {} error(s)",
            report.errors.len()
        );
        return Ok(exit_code(EXIT_INVALID_JOB));
    }

    let layout = options.layout.resolve(&job)?;
    let mut runner = ProcessRunner::new(job.toolchain(), job.settings.measure_wrapper.clone());
    let mut driver = JobDriver::new(&job, layout, &mut runner);
    if let Some(dir) = options.artifacts_dir {
        driver = driver.with_artifacts_dir(dir);
    }

    if options.dry_run {
        let plan = driver.plan()?;
        info!(
            job = job.name.as_str(),
            stages = plan.stages.len(),
            steps = plan.step_count(),
            "Dry run: plan resolved, nothing executed"
        );
        for stage in &plan.stages {
            for step in &stage.steps {
                info!(stage = stage.name.as_str(), step = step.label(), "{}", step.describe());
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let metrics = driver.metrics();
    let outcome = driver.run();

    let snapshot = metrics.snapshot();
    if options.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = options.metrics_json {
        ensure_parent(&path)?;
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics snapshot written");
    }
    if let Some(path) = options.metrics_prometheus {
        ensure_parent(&path)?;
        std::fs::write(&path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    if let Some(path) = options.report {
        outcome.write_report(&path)?;
        info!(report = %path.display(), "Run report written");
    }

    Ok(exit_code(outcome.exit_code()))
}

fn validate_job_cmd(job_path: &Path) -> Result<ExitCode> {
    let job = JobDescriptor::load(job_path)?;
    let report = validate_job(&job);
    if log_validation(job_path, &report) {
        info!(file = %job_path.display(), "Job validation passed");
        Ok(ExitCode::SUCCESS)
    } else {
        Err(anyhow!(
            "Job validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn plan_job(job_path: &Path, layout: &LayoutArgs, output: Option<PathBuf>) -> Result<ExitCode> {
    let job = JobDescriptor::load(job_path)?;
    let report = validate_job(&job);
    if !log_validation(job_path, &report) {
        return Err(anyhow!(
            "Cannot generate plan due to {} validation error(s)",
            report.errors.len()
        ));
    }

    let layout = layout.resolve(&job)?;
    let plan = build_plan(&job, &layout)?;

    match output {
        Some(path) => {
            ensure_parent(&path)?;
            generate_lock(&job, &layout, &plan, &path)?;
            info!(lockfile = %path.display(), "Plan lock generated");
        }
        None => print!("{}", PlanLock::new(&job, &layout, &plan).to_yaml()?),
    }
    Ok(ExitCode::SUCCESS)
}

fn collect_artifacts(job_path: &Path, output_root: &Path, artifacts_dir: &Path) -> Result<ExitCode> {
    let job = JobDescriptor::load(job_path)?;
    let set = ArtifactSet::resolve(&job.output_rules, output_root)?;
    set.log();
    let collected = set.collect(artifacts_dir)?;
    println!(
        "Collected {} file(s) into {}",
        collected.files.len(),
        artifacts_dir.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn list_stages() {
    println!("Stages (run in this order):");
    for name in STAGE_ORDER {
        println!("- {name}");
    }
}

/// Log warnings and errors; true when the job is usable.
fn log_validation(job_path: &Path, report: &ValidationReport) -> bool {
    for warning in &report.warnings {
        warn!(file = %job_path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %job_path.display(), "{error_msg}");
    }
    report.is_ok()
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[derive(Parser)]
#[command(
    name = "eos-ci",
    version,
    about = "Linear CI job runner: probe, build, package, static-check, test"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct LayoutArgs {
    /// Project checkout to build.
    #[arg(long = "work-dir", default_value = ".")]
    work_dir: PathBuf,
    /// Directory that packaged artifacts and test outputs are written to.
    #[arg(long = "output-root", default_value = "work")]
    output_root: PathBuf,
}

impl LayoutArgs {
    fn resolve(&self, job: &JobDescriptor) -> Result<Layout> {
        Layout::new(job, &self.work_dir, &self.output_root)
            .context("Failed to resolve job directories")
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of a job and collect its artifacts.
    Run {
        job: PathBuf,
        #[command(flatten)]
        layout: LayoutArgs,
        /// Copy output-rule matches here after a successful run.
        #[arg(long = "artifacts-dir")]
        artifacts_dir: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Check a job descriptor without running anything.
    Validate { job: PathBuf },
    /// Print or write the resolved plan with per-step digests.
    Plan {
        job: PathBuf,
        #[command(flatten)]
        layout: LayoutArgs,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Apply the output rules to an existing output root.
    Collect {
        job: PathBuf,
        #[arg(long = "output-root", default_value = "work")]
        output_root: PathBuf,
        #[arg(long = "artifacts-dir")]
        artifacts_dir: PathBuf,
    },
    ListStages,
}
