// ABOUTME: Sandboxed execution of untrusted analysis code in hardened containers
// ABOUTME: Ephemeral per-call and persistent per-conversation executors, idle sweeping and status events

pub mod artifacts;
pub mod ephemeral;
pub mod error;
pub mod events;
pub mod files;
pub mod output;
pub mod providers;
pub mod session;
pub mod settings;
pub mod sweeper;
pub mod types;
pub mod workspace;

pub use artifacts::{load_artifacts, ArtifactError, ArtifactLimits};
pub use ephemeral::EphemeralExecutor;
pub use error::{Result, SandboxError};
pub use events::{stages, StatusEvent, StatusEventBus};
pub use files::{FileStore, InputMaterializer, LocalFileStore};
pub use providers::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, DockerRuntime, Mount,
    OutputChunk, OutputStream, RuntimeError, StreamType,
};
pub use session::{SessionExecutor, SessionWorkspace};
pub use settings::SandboxSettings;
pub use sweeper::{IdleSweeper, SweepReport};
pub use types::{
    ExecutionStatus, InputSource, LivenessReason, SandboxArtifact, SandboxExecutionRequest,
    SandboxExecutionResult, SandboxInputFile, SandboxInputFileMapping, SessionStatus,
};
pub use workspace::{allocate_name, sanitize_filename, InputWorkspace};
