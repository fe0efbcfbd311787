use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Exit code reported when a program cannot be started at all.
pub const EXIT_SPAWN: i32 = 127;
/// Exit code reported when the job descriptor is unusable.
pub const EXIT_INVALID_JOB: i32 = 2;

#[derive(Debug, Error)]
pub enum CiError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command `{command}` exited with status {code}{}", tail_suffix(.output_tail))]
    CommandFailure {
        command: String,
        code: i32,
        output_tail: String,
    },

    #[error("command `{command}` was terminated by signal {signal}{}", tail_suffix(.output_tail))]
    AbnormalTermination {
        command: String,
        signal: i32,
        output_tail: String,
    },

    #[error("expected build artifact '{}' is missing after a successful build", .path.display())]
    Packaging { path: PathBuf },

    #[error("fetching '{repository}' failed with status {code}{}", tail_suffix(.output_tail))]
    Fetch {
        repository: String,
        code: i32,
        output_tail: String,
    },

    #[error("manifest generator succeeded but produced no manifest at '{}'", .path.display())]
    ManifestGeneration { path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid job descriptor: {0}")]
    InvalidJob(String),
}

impl CiError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        CiError::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code that reflects this failure to the outer scheduler.
    pub fn exit_code(&self) -> i32 {
        match self {
            CiError::Spawn { .. } => EXIT_SPAWN,
            CiError::CommandFailure { code, .. } | CiError::Fetch { code, .. } => {
                clamp_exit_code(*code)
            }
            CiError::AbnormalTermination { signal, .. } => 128 + signal,
            CiError::InvalidJob(_) => EXIT_INVALID_JOB,
            CiError::Packaging { .. } | CiError::ManifestGeneration { .. } | CiError::Io { .. } => {
                1
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CiError::Spawn { .. } => "spawn",
            CiError::CommandFailure { .. } => "command_failure",
            CiError::AbnormalTermination { .. } => "abnormal_termination",
            CiError::Packaging { .. } => "packaging",
            CiError::Fetch { .. } => "fetch",
            CiError::ManifestGeneration { .. } => "manifest_generation",
            CiError::Io { .. } => "io",
            CiError::InvalidJob(_) => "invalid_job",
        }
    }
}

/// Map an arbitrary child status onto something a shell can carry.
fn clamp_exit_code(code: i32) -> i32 {
    if (1..=255).contains(&code) { code } else { 1 }
}

fn tail_suffix(tail: &str) -> String {
    let trimmed = tail.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n--- output tail ---\n{trimmed}")
    }
}
