#![cfg(unix)]

mod support;

use eos_ci::driver::JobDriver;
use eos_ci::runner::ProcessRunner;
use support::{FakeToolchain, sample_job, sample_layout, serial, write_file};
use tempfile::tempdir;

#[test]
fn job_runs_end_to_end_against_real_processes() {
    let _guard = serial();
    let temp = tempdir().unwrap();
    let tools = FakeToolchain::install(temp.path(), 0);
    let mut job = sample_job(temp.path());
    tools.apply(&mut job.settings);
    let layout = sample_layout(&job, temp.path());
    write_file(&layout.scratch_dir.join("stale.txt"), "left over");
    let mut runner = ProcessRunner::new(job.toolchain(), Vec::new()).quiet();

    let outcome = JobDriver::new(&job, layout.clone(), &mut runner).run();

    assert!(outcome.succeeded(), "{:?}", outcome.failure);
    let out = &layout.output_root;
    assert!(out.join("debug/eos").is_file());
    assert!(out.join("release/eos").is_file());
    assert_eq!(
        std::fs::read_to_string(out.join("build.ninja")).unwrap().trim(),
        "rule cc"
    );
    assert!(out.join("bld/kernel/genunix").is_file());
    assert!(!layout.scratch_dir.join("stale.txt").exists());
    assert!(layout.scratch_dir.join("README.md").is_file());
}

#[test]
fn lint_failure_propagates_status_and_output() {
    let _guard = serial();
    let temp = tempdir().unwrap();
    let tools = FakeToolchain::install(temp.path(), 1);
    let mut job = sample_job(temp.path());
    tools.apply(&mut job.settings);
    let layout = sample_layout(&job, temp.path());
    let mut runner = ProcessRunner::new(job.toolchain(), Vec::new()).quiet();

    let outcome = JobDriver::new(&job, layout.clone(), &mut runner).run();

    assert_eq!(outcome.exit_code(), 1);
    let failure = outcome.failure.expect("failure summary");
    assert_eq!(failure.step.as_deref(), Some("clippy"));
    assert!(failure.message.contains("clippy finished"));
    assert!(!layout.scratch_dir.exists());
    assert!(!layout.output_root.join("build.ninja").exists());
}

#[test]
fn missing_tool_exits_like_a_shell() {
    let _guard = serial();
    let temp = tempdir().unwrap();
    let tools = FakeToolchain::install(temp.path(), 0);
    let mut job = sample_job(temp.path());
    tools.apply(&mut job.settings);
    job.settings.rustc = temp.path().join("bin/no-such-rustc").display().to_string();
    let layout = sample_layout(&job, temp.path());
    let mut runner = ProcessRunner::new(job.toolchain(), Vec::new()).quiet();

    let outcome = JobDriver::new(&job, layout, &mut runner).run();

    assert_eq!(outcome.exit_code(), 127);
    assert_eq!(outcome.failure.unwrap().kind, "spawn");
}
