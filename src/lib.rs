pub mod artifacts;
pub mod digest;
pub mod driver;
pub mod error;
pub mod job;
pub mod lockfile;
pub mod observability;
pub mod plan;
pub mod runner;
pub mod stage;
pub mod validation;

pub use artifacts::ArtifactSet;
pub use driver::{JobDriver, JobOutcome};
pub use error::CiError;
pub use job::JobDescriptor;
pub use plan::{JobPlan, Layout};
pub use runner::{CommandRunner, ExecStep, ExecutionResult, ProcessRunner};
pub use stage::{Stage, StageExecutor, StageFailure, Step};
