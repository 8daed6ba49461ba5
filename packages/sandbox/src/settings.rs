// ABOUTME: Sandbox configuration: image identity, resource caps, timeouts and workspace roots
// ABOUTME: Defaults overlaid with CODEBOX_* environment variables and validated before use

use crate::error::{Result, SandboxError};
use codebox_config::{constants, env_parse, env_string};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    // Container image
    pub image: String,
    pub runner_path: String,
    /// `uid:gid` for guest processes; defaults to the owner of the workspace
    pub container_user: Option<String>,

    // Resource caps
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: i64,
    pub tmpfs_size_mb: u64,

    // Execution limits
    pub timeout_secs: u64,
    pub max_code_chars: usize,
    pub max_artifacts: usize,
    pub max_artifact_bytes: u64,
    pub max_input_bytes: u64,
    pub output_tail_chars: usize,
    pub traceback_lines: usize,

    // Persistent sessions
    pub session_ttl_secs: u64,
    pub ready_timeout_secs: u64,
    pub queue_wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub sweep_interval_secs: u64,

    // Paths & identity
    pub sessions_root: PathBuf,
    pub ephemeral_root: PathBuf,
    pub database_url: String,
    pub host_id: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let base = std::env::temp_dir().join("codebox");
        Self {
            image: "codebox-sandbox:latest".to_string(),
            runner_path: "/usr/local/bin/codebox-runner".to_string(),
            container_user: None,
            memory_mb: 1024,
            cpus: 1.0,
            pids_limit: 256,
            tmpfs_size_mb: 256,
            timeout_secs: 60,
            max_code_chars: 100_000,
            max_artifacts: 20,
            max_artifact_bytes: 20 * 1024 * 1024,
            max_input_bytes: 100 * 1024 * 1024,
            output_tail_chars: 8_000,
            traceback_lines: 40,
            session_ttl_secs: 30 * 60,
            ready_timeout_secs: 30,
            queue_wait_timeout_secs: 120,
            poll_interval_ms: 200,
            sweep_interval_secs: 60,
            database_url: format!("sqlite://{}", base.join("codebox.db").display()),
            sessions_root: base.join("sessions"),
            ephemeral_root: base.join("runs"),
            host_id: default_host_id(),
        }
    }
}

fn default_host_id() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Could not determine hostname, using 'localhost': {}", e);
            "localhost".to_string()
        }
    }
}

impl SandboxSettings {
    /// Defaults overlaid with any CODEBOX_* environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            image: env_string(constants::CODEBOX_IMAGE).unwrap_or(d.image),
            runner_path: env_string(constants::CODEBOX_RUNNER_PATH).unwrap_or(d.runner_path),
            container_user: env_string(constants::CODEBOX_CONTAINER_USER).or(d.container_user),
            memory_mb: env_parse(constants::CODEBOX_MEMORY_MB, d.memory_mb),
            cpus: env_parse(constants::CODEBOX_CPUS, d.cpus),
            pids_limit: env_parse(constants::CODEBOX_PIDS_LIMIT, d.pids_limit),
            tmpfs_size_mb: env_parse(constants::CODEBOX_TMPFS_SIZE_MB, d.tmpfs_size_mb),
            timeout_secs: env_parse(constants::CODEBOX_TIMEOUT_SECS, d.timeout_secs),
            max_code_chars: env_parse(constants::CODEBOX_MAX_CODE_CHARS, d.max_code_chars),
            max_artifacts: env_parse(constants::CODEBOX_MAX_ARTIFACTS, d.max_artifacts),
            max_artifact_bytes: env_parse(constants::CODEBOX_MAX_ARTIFACT_BYTES, d.max_artifact_bytes),
            max_input_bytes: env_parse(constants::CODEBOX_MAX_INPUT_BYTES, d.max_input_bytes),
            output_tail_chars: env_parse(constants::CODEBOX_OUTPUT_TAIL_CHARS, d.output_tail_chars),
            traceback_lines: env_parse(constants::CODEBOX_TRACEBACK_LINES, d.traceback_lines),
            session_ttl_secs: env_parse(constants::CODEBOX_SESSION_TTL_SECS, d.session_ttl_secs),
            ready_timeout_secs: env_parse(constants::CODEBOX_READY_TIMEOUT_SECS, d.ready_timeout_secs),
            queue_wait_timeout_secs: env_parse(
                constants::CODEBOX_QUEUE_WAIT_TIMEOUT_SECS,
                d.queue_wait_timeout_secs,
            ),
            poll_interval_ms: env_parse(constants::CODEBOX_POLL_INTERVAL_MS, d.poll_interval_ms),
            sweep_interval_secs: env_parse(constants::CODEBOX_SWEEP_INTERVAL_SECS, d.sweep_interval_secs),
            sessions_root: env_string(constants::CODEBOX_SESSIONS_ROOT)
                .map(PathBuf::from)
                .unwrap_or(d.sessions_root),
            ephemeral_root: env_string(constants::CODEBOX_EPHEMERAL_ROOT)
                .map(PathBuf::from)
                .unwrap_or(d.ephemeral_root),
            database_url: env_string(constants::CODEBOX_DATABASE_URL).unwrap_or(d.database_url),
            host_id: env_string(constants::CODEBOX_HOST_ID).unwrap_or(d.host_id),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SandboxError::Config(msg.to_string()));

        if self.image.trim().is_empty() {
            return invalid("image must not be empty");
        }
        if self.runner_path.trim().is_empty() {
            return invalid("runner_path must not be empty");
        }
        if self.memory_mb < 64 {
            return invalid("memory_mb must be at least 64");
        }
        if !(self.cpus > 0.0) {
            return invalid("cpus must be positive");
        }
        if self.pids_limit <= 0 {
            return invalid("pids_limit must be positive");
        }
        if self.timeout_secs == 0
            || self.ready_timeout_secs == 0
            || self.queue_wait_timeout_secs == 0
        {
            return invalid("timeouts must be positive");
        }
        if self.poll_interval_ms == 0 || self.sweep_interval_secs == 0 {
            return invalid("poll and sweep intervals must be positive");
        }
        if self.session_ttl_secs == 0 {
            return invalid("session_ttl_secs must be positive");
        }
        if self.max_artifacts == 0 || self.max_artifact_bytes == 0 {
            return invalid("artifact limits must be positive");
        }
        if self.host_id.trim().is_empty() {
            return invalid("host_id must not be empty");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn queue_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SandboxSettings::default().validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let settings = SandboxSettings {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(SandboxError::Config(_))));
    }

    #[test]
    fn test_empty_image_rejected() {
        let settings = SandboxSettings {
            image: "  ".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_nano_cpus() {
        let settings = SandboxSettings {
            cpus: 1.5,
            ..Default::default()
        };
        assert_eq!(settings.nano_cpus(), 1_500_000_000);
    }
}
