// ABOUTME: Guest runner library executed inside sandbox containers
// ABOUTME: One-shot and session loops driving an execution kernel over the file/NDJSON protocol

pub mod emit;
pub mod error;
pub mod kernel;
pub mod oneshot;
pub mod repl;
pub mod scan;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Result, RunnerError};
pub use kernel::{Execution, ExecutionFailure, Kernel, NamespaceBindings};
pub use oneshot::{run_job, RunnerDirs, RunnerOptions};
pub use repl::ReplKernel;
pub use session::{serve, SessionRunnerOptions};
