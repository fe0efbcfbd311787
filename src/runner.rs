//! External command execution.
//!
//! Every command runs with stdout/stderr piped through reader threads that
//! forward output to this process as it arrives and keep a bounded tail for
//! diagnostics. Piped sequences fail if any member fails.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CiError;

/// Environment variable that pins the toolchain for every child process.
pub const TOOLCHAIN_ENV: &str = "RUSTUP_TOOLCHAIN";

const DEFAULT_TAIL_BYTES: usize = 64 * 1024;
const PEAK_MEMORY_MARKER: &str = "Maximum resident set size (kbytes):";
const SIGNAL_MARKER: &str = "Command terminated by signal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build an invocation from a full argument vector (`argv[0]` is the program).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    fn wrapped(&self, wrapper: &[String]) -> Invocation {
        match wrapper.split_first() {
            Some((program, prefix)) => Invocation::new(
                program.clone(),
                prefix.iter().cloned().chain(self.argv()),
            ),
            None => self.clone(),
        }
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.argv().iter().map(|arg| quote_arg(arg)).collect();
        f.write_str(&rendered.join(" "))
    }
}

fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// How a failure of this step is classified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    #[default]
    Command,
    Fetch { repository: String },
}

/// One external command, or several joined by pipes, run in an explicit directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStep {
    pub label: String,
    pub pipeline: Vec<Invocation>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub measure: bool,
    #[serde(default)]
    pub role: StepRole,
    /// A path the command must have produced when it exits successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expects: Option<PathBuf>,
}

impl ExecStep {
    pub fn new(label: impl Into<String>, invocation: Invocation, cwd: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            pipeline: vec![invocation],
            cwd: cwd.into(),
            measure: false,
            role: StepRole::Command,
            expects: None,
        }
    }

    /// Feed this step's stdout into `next`.
    pub fn pipe(mut self, next: Invocation) -> Self {
        self.pipeline.push(next);
        self
    }

    pub fn measured(mut self) -> Self {
        self.measure = true;
        self
    }

    pub fn with_role(mut self, role: StepRole) -> Self {
        self.role = role;
        self
    }

    pub fn expecting(mut self, path: impl Into<PathBuf>) -> Self {
        self.expects = Some(path.into());
        self
    }

    pub fn command_line(&self) -> String {
        self.pipeline
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }

    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signal(signal);
            }
        }
        ExitOutcome::Code(-1)
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exit status {code}"),
            ExitOutcome::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub outcome: ExitOutcome,
    pub duration: Duration,
    /// Peak resident set size in KiB, when the step was measured.
    pub peak_memory_kb: Option<u64>,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.outcome.success()
    }

    /// A short excerpt of captured output for failure reports.
    pub fn output_tail(&self, max_lines: usize) -> String {
        let source = if self.stderr_tail.trim().is_empty() {
            &self.stdout_tail
        } else {
            &self.stderr_tail
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Executes external commands on behalf of the stage executor.
pub trait CommandRunner {
    fn run(&mut self, step: &ExecStep) -> Result<ExecutionResult, CiError>;
}

/// Runs steps as real child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    pinned_env: Vec<(String, String)>,
    measure_wrapper: Vec<String>,
    tail_bytes: usize,
    echo: bool,
}

impl ProcessRunner {
    pub fn new(toolchain: &str, measure_wrapper: Vec<String>) -> Self {
        let mut pinned_env = Vec::new();
        if !toolchain.trim().is_empty() {
            pinned_env.push((TOOLCHAIN_ENV.to_string(), toolchain.trim().to_string()));
        }
        Self {
            pinned_env,
            measure_wrapper,
            tail_bytes: DEFAULT_TAIL_BYTES,
            echo: true,
        }
    }

    /// Capture output without forwarding it to this process.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    fn resolve(&self, step: &ExecStep) -> Vec<Invocation> {
        step.pipeline
            .iter()
            .map(|invocation| {
                if step.measure {
                    invocation.wrapped(&self.measure_wrapper)
                } else {
                    invocation.clone()
                }
            })
            .collect()
    }

    fn sink(&self, stream: Stream) -> Box<dyn Write + Send> {
        match (self.echo, stream) {
            (false, _) => Box::new(io::sink()),
            (true, Stream::Stdout) => Box::new(io::stdout()),
            (true, Stream::Stderr) => Box::new(io::stderr()),
        }
    }

    fn spawn_member(
        &self,
        invocation: &Invocation,
        cwd: &Path,
        stdin: Stdio,
        last: bool,
    ) -> Result<Member, CiError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(cwd)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.pinned_env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| CiError::Spawn {
            command: invocation.to_string(),
            source,
        })?;

        let stderr = child.stderr.take().map(|pipe| {
            let sink = self.sink(Stream::Stderr);
            let limit = self.tail_bytes;
            thread::spawn(move || tee_stream(pipe, sink, limit))
        });

        let (stdout, downstream) = if last {
            let reader = child.stdout.take().map(|pipe| {
                let sink = self.sink(Stream::Stdout);
                let limit = self.tail_bytes;
                thread::spawn(move || tee_stream(pipe, sink, limit))
            });
            (reader, None)
        } else {
            (None, child.stdout.take())
        };

        Ok(Member {
            child,
            stdout,
            stderr,
            downstream,
        })
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&mut self, step: &ExecStep) -> Result<ExecutionResult, CiError> {
        let invocations = self.resolve(step);
        if invocations.is_empty() {
            return Err(CiError::InvalidJob(format!(
                "step '{}' has no command",
                step.label
            )));
        }

        for invocation in &invocations {
            info!(
                step = step.label.as_str(),
                cwd = %step.cwd.display(),
                env = ?self.pinned_env,
                "+ {invocation}"
            );
        }

        let started = Instant::now();
        let mut members: Vec<Member> = Vec::with_capacity(invocations.len());
        let mut upstream: Option<ChildStdout> = None;
        for (idx, invocation) in invocations.iter().enumerate() {
            let stdin = match upstream.take() {
                Some(pipe) => Stdio::from(pipe),
                None => Stdio::null(),
            };
            let last = idx + 1 == invocations.len();
            match self.spawn_member(invocation, &step.cwd, stdin, last) {
                Ok(mut member) => {
                    upstream = member.downstream.take();
                    members.push(member);
                }
                Err(err) => {
                    abort_members(members);
                    return Err(err);
                }
            }
        }

        let mut outcome = ExitOutcome::Code(0);
        let mut stdout_tail = Vec::new();
        let mut stderr_tail = Vec::new();
        let mut peak_memory_kb: Option<u64> = None;
        let wrapped = step.measure && !self.measure_wrapper.is_empty();
        for member in members {
            let finished = member.finish().map_err(|source| {
                CiError::io(format!("failed to wait for `{}`", step.command_line()), source)
            })?;
            let mut member_outcome = ExitOutcome::from_status(finished.status);
            if wrapped {
                let report = String::from_utf8_lossy(&finished.stderr);
                // the wrapper exits normally even when the measured command was killed
                if let ExitOutcome::Code(code) = member_outcome
                    && code != 0
                    && let Some(signal) = parse_terminating_signal(&report)
                {
                    member_outcome = ExitOutcome::Signal(signal);
                }
                if let Some(kb) = parse_peak_memory_kb(&report) {
                    peak_memory_kb = Some(peak_memory_kb.map_or(kb, |prev| prev.max(kb)));
                }
            }
            // pipefail: the rightmost failing member decides the outcome
            if !member_outcome.success() {
                outcome = member_outcome;
            }
            stderr_tail.extend_from_slice(&finished.stderr);
            if let Some(stdout) = finished.stdout {
                stdout_tail = stdout;
            }
        }
        let duration = started.elapsed();

        debug!(
            step = step.label.as_str(),
            %outcome,
            duration_ms = duration.as_secs_f64() * 1_000.0,
            peak_memory_kb,
            "Command finished"
        );
        if step.measure {
            info!(
                step = step.label.as_str(),
                wall_secs = duration.as_secs_f64(),
                peak_memory_kb,
                "Resource usage"
            );
        }

        Ok(ExecutionResult {
            outcome,
            duration,
            peak_memory_kb,
            stdout_tail: lossy_tail(stdout_tail, self.tail_bytes),
            stderr_tail: lossy_tail(stderr_tail, self.tail_bytes),
        })
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type Reader = thread::JoinHandle<io::Result<Vec<u8>>>;

struct Member {
    child: Child,
    stdout: Option<Reader>,
    stderr: Option<Reader>,
    downstream: Option<ChildStdout>,
}

struct Finished {
    status: ExitStatus,
    stdout: Option<Vec<u8>>,
    stderr: Vec<u8>,
}

impl Member {
    fn finish(mut self) -> io::Result<Finished> {
        drop(self.downstream.take());
        let status = self.child.wait()?;
        let stdout = self.stdout.map(join_reader).transpose()?;
        let stderr = self.stderr.map(join_reader).transpose()?.unwrap_or_default();
        Ok(Finished {
            status,
            stdout,
            stderr,
        })
    }
}

fn abort_members(members: Vec<Member>) {
    for mut member in members {
        if let Err(err) = member.child.kill() {
            warn!(err = %err, "failed to kill pipeline member");
        }
        let _ = member.finish();
    }
}

fn join_reader(handle: Reader) -> io::Result<Vec<u8>> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("output reader thread panicked")))
}

/// Copy `reader` into `sink` as data arrives, keeping only the last `limit` bytes.
fn tee_stream<R: Read>(
    mut reader: R,
    mut sink: Box<dyn Write + Send>,
    limit: usize,
) -> io::Result<Vec<u8>> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if let Err(err) = sink.write_all(&chunk[..n]).and_then(|_| sink.flush()) {
            warn!(err = %err, "failed to forward child output");
        }
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
        }
    }
    Ok(tail)
}

fn lossy_tail(mut bytes: Vec<u8>, limit: usize) -> String {
    if bytes.len() > limit {
        let excess = bytes.len() - limit;
        bytes.drain(..excess);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Extract the peak RSS reported by GNU `time -v`.
pub fn parse_peak_memory_kb(stderr: &str) -> Option<u64> {
    stderr
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(PEAK_MEMORY_MARKER))
        .and_then(|value| value.trim().parse().ok())
}

/// Extract the signal GNU `time` reports for a command it saw killed.
pub fn parse_terminating_signal(stderr: &str) -> Option<i32> {
    stderr
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(SIGNAL_MARKER))
        .and_then(|value| value.trim().parse().ok())
}
