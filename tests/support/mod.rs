#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eos_ci::error::CiError;
use eos_ci::job::{JobDescriptor, JobSettings, OutputRule};
use eos_ci::plan::Layout;
use eos_ci::runner::{CommandRunner, ExecStep, ExecutionResult, ExitOutcome};

/// Every exec step label of a full run, in execution order.
pub const EXEC_LABELS: [&str; 10] = [
    "rustc-version",
    "cargo-version",
    "check",
    "build-debug",
    "build-release",
    "fmt",
    "clippy",
    "fetch",
    "generate-manifest",
    "execute-manifest",
];

pub fn sample_job(root: &Path) -> JobDescriptor {
    let mut settings = JobSettings::default();
    settings.fetch.repository = "https://example.invalid/eos.git".into();
    settings.fetch.scratch_dir = root.join("scratch");
    JobDescriptor {
        name: "build-and-test".into(),
        variety: Some("basic".into()),
        target: "helios-2.0".into(),
        rust_toolchain: "1.80.0".into(),
        output_rules: vec![
            OutputRule::from("debug/*"),
            OutputRule::from("release/*"),
            OutputRule::from("build.ninja"),
            OutputRule::from("bld"),
        ],
        settings,
    }
}

pub fn sample_layout(job: &JobDescriptor, root: &Path) -> Layout {
    let work = root.join("src");
    fs::create_dir_all(&work).unwrap();
    Layout::new(job, &work, &root.join("work")).unwrap()
}

type Effect = Box<dyn Fn(&ExecStep) -> ExitOutcome>;

/// A runner that records step labels and imitates the file system effects
/// of the real tools instead of spawning them.
pub struct SimulatedRunner {
    pub calls: Vec<String>,
    failures: HashMap<String, ExitOutcome>,
    spawn_errors: Vec<String>,
    effects: HashMap<String, Effect>,
}

impl SimulatedRunner {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            failures: HashMap::new(),
            spawn_errors: Vec::new(),
            effects: HashMap::new(),
        }
    }

    /// Imitate cargo, git, the release binary and ninja for `layout`.
    pub fn simulating(layout: &Layout, settings: &JobSettings) -> Self {
        let target = layout.target_dir.clone();
        let artifact = settings.artifact.clone();
        let manifest = settings.manifest_file.clone();
        let output_dir = settings.build_output_dir.clone();

        let debug_target = target.clone();
        let debug_artifact = artifact.clone();
        Self::new()
            .on("build-debug", move |_| {
                write_file(&debug_target.join("debug").join(&debug_artifact), "debug build");
                ExitOutcome::Code(0)
            })
            .on("build-release", move |_| {
                write_file(&target.join("release").join(&artifact), "release build");
                ExitOutcome::Code(0)
            })
            .on("fetch", |step| {
                let destination = PathBuf::from(
                    step.pipeline[0]
                        .args
                        .last()
                        .expect("clone destination argument"),
                );
                if destination.exists() {
                    return ExitOutcome::Code(128);
                }
                write_file(&destination.join("README.md"), "eos sources");
                ExitOutcome::Code(0)
            })
            .on("generate-manifest", move |step| {
                write_file(&step.cwd.join(&manifest), "rule cc\nbuild kernel: cc\n");
                ExitOutcome::Code(0)
            })
            .on("execute-manifest", move |step| {
                write_file(&step.cwd.join(&output_dir).join("kernel"), "kernel image");
                ExitOutcome::Code(0)
            })
    }

    pub fn on(
        mut self,
        label: &str,
        effect: impl Fn(&ExecStep) -> ExitOutcome + 'static,
    ) -> Self {
        self.effects.insert(label.to_string(), Box::new(effect));
        self
    }

    /// Exit with `code` at `label` without producing any side effect.
    pub fn failing(mut self, label: &str, code: i32) -> Self {
        self.failures
            .insert(label.to_string(), ExitOutcome::Code(code));
        self
    }

    pub fn killed(mut self, label: &str, signal: i32) -> Self {
        self.failures
            .insert(label.to_string(), ExitOutcome::Signal(signal));
        self
    }

    pub fn unspawnable(mut self, label: &str) -> Self {
        self.spawn_errors.push(label.to_string());
        self
    }
}

impl CommandRunner for SimulatedRunner {
    fn run(&mut self, step: &ExecStep) -> Result<ExecutionResult, CiError> {
        self.calls.push(step.label.clone());
        if self.spawn_errors.contains(&step.label) {
            return Err(CiError::Spawn {
                command: step.command_line(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }

        let outcome = match self.failures.get(&step.label) {
            Some(outcome) => *outcome,
            None => match self.effects.get(&step.label) {
                Some(effect) => effect(step),
                None => ExitOutcome::Code(0),
            },
        };
        Ok(ExecutionResult {
            outcome,
            duration: Duration::from_millis(1),
            peak_memory_kb: step.measure.then_some(2048),
            stdout_tail: String::new(),
            stderr_tail: format!("{} finished\n", step.label),
        })
    }
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

/// Relative path to contents for every file under `root`.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, String> {
    let mut files = BTreeMap::new();
    if root.exists() {
        collect(root, root, &mut files);
    }
    files
}

fn collect(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, String>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect(root, &path, files);
        } else {
            let relative = path.strip_prefix(root).unwrap().to_path_buf();
            files.insert(relative, fs::read_to_string(&path).unwrap_or_default());
        }
    }
}

/// Held by tests that exec freshly written scripts, so no other test forks
/// while a script is still open for writing (ETXTBSY).
pub fn serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shell scripts standing in for rustc, cargo, git and ninja.
#[cfg(unix)]
pub struct FakeToolchain {
    pub bin: PathBuf,
}

#[cfg(unix)]
impl FakeToolchain {
    /// `clippy_exit` is the status the fake `cargo clippy` returns.
    pub fn install(dir: &Path, clippy_exit: i32) -> Self {
        let bin = dir.join("bin");
        fs::create_dir_all(&bin).unwrap();

        write_script(&bin.join("rustc"), "#!/bin/sh\necho \"rustc 1.80.0 (fake)\"\n");
        write_script(
            &bin.join("cargo"),
            &format!(
                r#"#!/bin/sh
case "$1" in
  --version) echo "cargo 1.80.0 (fake)" ;;
  check|fmt) ;;
  clippy) echo "clippy finished" >&2; exit {clippy_exit} ;;
  build)
    if [ "$2" = "--release" ]; then dir=target/release; else dir=target/debug; fi
    mkdir -p "$dir"
    printf '#!/bin/sh\necho "rule cc" > build.ninja\n' > "$dir/eos"
    chmod +x "$dir/eos"
    ;;
  *) echo "unexpected cargo invocation: $*" >&2; exit 101 ;;
esac
"#
            ),
        );
        write_script(
            &bin.join("git"),
            r#"#!/bin/sh
for last; do :; done
if [ -e "$last" ]; then
  echo "fatal: destination path '$last' already exists" >&2
  exit 128
fi
mkdir -p "$last" && echo "eos sources" > "$last/README.md"
"#,
        );
        write_script(
            &bin.join("ninja"),
            "#!/bin/sh\n[ -f build.ninja ] || exit 1\nmkdir -p bld/kernel && echo image > bld/kernel/genunix\n",
        );
        Self { bin }
    }

    pub fn apply(&self, settings: &mut JobSettings) {
        settings.rustc = self.tool("rustc");
        settings.cargo = self.tool("cargo");
        settings.git = self.tool("git");
        settings.build_executor = vec![self.tool("ninja")];
        settings.measure_wrapper = Vec::new();
    }

    pub fn tool(&self, name: &str) -> String {
        self.bin.join(name).display().to_string()
    }
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}
