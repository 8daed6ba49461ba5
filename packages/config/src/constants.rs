// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Codebox

// Container Image
pub const CODEBOX_IMAGE: &str = "CODEBOX_IMAGE";
pub const CODEBOX_RUNNER_PATH: &str = "CODEBOX_RUNNER_PATH";
pub const CODEBOX_CONTAINER_USER: &str = "CODEBOX_CONTAINER_USER";

// Resource Caps
pub const CODEBOX_MEMORY_MB: &str = "CODEBOX_MEMORY_MB";
pub const CODEBOX_CPUS: &str = "CODEBOX_CPUS";
pub const CODEBOX_PIDS_LIMIT: &str = "CODEBOX_PIDS_LIMIT";
pub const CODEBOX_TMPFS_SIZE_MB: &str = "CODEBOX_TMPFS_SIZE_MB";

// Execution Limits
pub const CODEBOX_TIMEOUT_SECS: &str = "CODEBOX_TIMEOUT_SECS";
pub const CODEBOX_MAX_CODE_CHARS: &str = "CODEBOX_MAX_CODE_CHARS";
pub const CODEBOX_MAX_ARTIFACTS: &str = "CODEBOX_MAX_ARTIFACTS";
pub const CODEBOX_MAX_ARTIFACT_BYTES: &str = "CODEBOX_MAX_ARTIFACT_BYTES";
pub const CODEBOX_MAX_INPUT_BYTES: &str = "CODEBOX_MAX_INPUT_BYTES";
pub const CODEBOX_OUTPUT_TAIL_CHARS: &str = "CODEBOX_OUTPUT_TAIL_CHARS";
pub const CODEBOX_TRACEBACK_LINES: &str = "CODEBOX_TRACEBACK_LINES";

// Persistent Sessions
pub const CODEBOX_SESSION_TTL_SECS: &str = "CODEBOX_SESSION_TTL_SECS";
pub const CODEBOX_READY_TIMEOUT_SECS: &str = "CODEBOX_READY_TIMEOUT_SECS";
pub const CODEBOX_QUEUE_WAIT_TIMEOUT_SECS: &str = "CODEBOX_QUEUE_WAIT_TIMEOUT_SECS";
pub const CODEBOX_POLL_INTERVAL_MS: &str = "CODEBOX_POLL_INTERVAL_MS";
pub const CODEBOX_SWEEP_INTERVAL_SECS: &str = "CODEBOX_SWEEP_INTERVAL_SECS";

// Paths & Identity
pub const CODEBOX_SESSIONS_ROOT: &str = "CODEBOX_SESSIONS_ROOT";
pub const CODEBOX_EPHEMERAL_ROOT: &str = "CODEBOX_EPHEMERAL_ROOT";
pub const CODEBOX_DATABASE_URL: &str = "CODEBOX_DATABASE_URL";
pub const CODEBOX_HOST_ID: &str = "CODEBOX_HOST_ID";

// Guest Runner
pub const CODEBOX_PYTHON: &str = "CODEBOX_PYTHON";

// System Environment Variables
pub const RUST_LOG: &str = "RUST_LOG";
