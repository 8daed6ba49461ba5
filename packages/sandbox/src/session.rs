// ABOUTME: Persistent per-conversation executor backed by a session row, a workspace and a long-lived container
// ABOUTME: Requests are queued as sequence-named files and answered through response files

use crate::artifacts::{load_artifacts, ArtifactLimits};
use crate::ephemeral::{guest_env, workspace_owner};
use crate::error::{Result, SandboxError};
use crate::events::{stages, StatusEventBus};
use crate::files::{FileStore, InputMaterializer};
use crate::output::trim_traceback;
use crate::providers::{
    name_fragment, ContainerRuntime, ContainerSpec, ContainerState, Mount, KIND_SESSION,
    LABEL_CONVERSATION_ID, LABEL_HOST, LABEL_KIND, LABEL_SESSION_ID,
};
use crate::settings::SandboxSettings;
use crate::types::{
    ExecutionStatus, LivenessReason, SandboxExecutionRequest, SandboxExecutionResult,
    SandboxInputFileMapping, SessionStatus,
};
use crate::workspace::InputWorkspace;
use codebox_protocol::{
    request_file_stem, truncate_tail, write_json_atomic, IpcLayout, RequestFile, ResponseFile,
    ResponseStatus, MANIFEST_FILE_NAME,
};
use codebox_storage::{ConversationSandboxSession, NewSession, SessionStorage, StorageError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const WORKSPACE_INPUT_DIR: &str = "/workspace/input";
pub const WORKSPACE_OUTPUT_DIR: &str = "/workspace/output";
pub const WORKSPACE_IPC_DIR: &str = "/workspace/ipc";

/// Prefix of every session container name
pub const SESSION_CONTAINER_PREFIX: &str = "codebox-session-";

const MAX_ACQUIRE_ATTEMPTS: usize = 3;
const STOP_TIMEOUT_SECS: u64 = 2;

/// Host-side layout of one session workspace.
#[derive(Debug, Clone)]
pub struct SessionWorkspace {
    root: PathBuf,
}

impl SessionWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn ipc(&self) -> IpcLayout {
        IpcLayout::new(self.root.join("ipc"))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    pub fn inputs(&self) -> InputWorkspace {
        InputWorkspace::new(self.input_dir(), self.manifest_path(), WORKSPACE_INPUT_DIR)
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.input_dir()).await?;
        tokio::fs::create_dir_all(self.output_dir()).await?;
        self.ipc().create_dirs()?;
        Ok(())
    }
}

/// Bookkeeping for one enqueued request
struct Ticket {
    sequence: i64,
    stem: String,
    inputs: Vec<SandboxInputFileMapping>,
    enqueued_at: Instant,
}

pub struct SessionExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    storage: SessionStorage,
    settings: Arc<SandboxSettings>,
    events: StatusEventBus,
    materializer: InputMaterializer,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        storage: SessionStorage,
        settings: Arc<SandboxSettings>,
        events: StatusEventBus,
    ) -> Self {
        let materializer = InputMaterializer::new(None, settings.max_input_bytes);
        Self {
            runtime,
            storage,
            settings,
            events,
            materializer,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.materializer = InputMaterializer::new(Some(store), self.settings.max_input_bytes);
        self
    }

    pub fn events(&self) -> &StatusEventBus {
        &self.events
    }

    /// In-process serialization of bookkeeping for one conversation.
    async fn conversation_guard(&self, conversation_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Run `request` in the conversation's persistent session, creating or
    /// replacing the session as needed. Never fails: every host-side error
    /// becomes a terminal result.
    pub async fn execute(
        &self,
        conversation_id: &str,
        request: &SandboxExecutionRequest,
    ) -> SandboxExecutionResult {
        let started = Instant::now();
        let run_id = request.run_id.as_str();
        info!(conversation_id, run_id, "Starting session execution");

        let mut result = if request.code.chars().count() > self.settings.max_code_chars {
            SandboxExecutionResult::failed(
                run_id,
                format!("Code exceeds the {} character limit", self.settings.max_code_chars),
            )
        } else {
            match self.execute_queued(conversation_id, request).await {
                Ok(result) => result,
                Err(e) => {
                    error!(conversation_id, run_id, "Session execution failed: {}", e);
                    SandboxExecutionResult::failed(run_id, format!("Sandbox session error: {}", e))
                }
            }
        };

        result.duration_ms = started.elapsed().as_millis() as u64;
        let stage = match result.status {
            ExecutionStatus::Succeeded => stages::COMPLETED,
            ExecutionStatus::Failed => stages::FAILED,
            ExecutionStatus::Timeout => stages::TIMEOUT,
        };
        self.events.publish(run_id, stage, result.summary.clone());
        info!(
            conversation_id,
            run_id,
            status = %result.status,
            sequence = ?result.request_sequence,
            "Session execution finished"
        );
        result
    }

    async fn execute_queued(
        &self,
        conversation_id: &str,
        request: &SandboxExecutionRequest,
    ) -> Result<SandboxExecutionResult> {
        let run_id = request.run_id.as_str();
        self.events.publish(run_id, stages::PREPARING, "Preparing session");

        let (session, reused, ticket) = {
            let _guard = self.conversation_guard(conversation_id).await;
            let (session, reused) = self.acquire(conversation_id, run_id).await?;
            let ticket = self.enqueue(conversation_id, &session, request).await?;
            (session, reused, ticket)
        };

        self.events.publish(
            run_id,
            stages::QUEUED,
            format!("Queued as request {}", ticket.sequence),
        );

        let mut result = self.wait(conversation_id, &session, &ticket, run_id).await?;
        result.session_id = Some(session.id.clone());
        result.reused = reused;
        result.request_sequence = Some(ticket.sequence);
        result.input_files = ticket.inputs;
        Ok(result)
    }

    /// Find a live session owned by this host, or replace whatever is there.
    async fn acquire(
        &self,
        conversation_id: &str,
        run_id: &str,
    ) -> Result<(ConversationSandboxSession, bool)> {
        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let mut tx = self.storage.lock_conversation(conversation_id).await?;

            if let Some(existing) = tx.current().await? {
                if existing.owner_host == self.settings.host_id {
                    match self.assess(&existing).await? {
                        None => {
                            tx.commit().await?;
                            debug!(conversation_id, session_id = %existing.id, "Reusing session");
                            return Ok((existing, true));
                        }
                        Some(reason) => info!(
                            conversation_id,
                            session_id = %existing.id,
                            "Replacing session: {}",
                            reason.as_str()
                        ),
                    }
                } else {
                    warn!(
                        conversation_id,
                        session_id = %existing.id,
                        "Session is owned by host {}, recreating it here",
                        existing.owner_host
                    );
                }
                tx.delete(&existing.id).await?;
                tx.commit().await?;
                self.teardown(&existing).await;
                continue;
            }

            let session_id = uuid::Uuid::new_v4().to_string();
            let new = NewSession {
                container_name: format!("{}{}", SESSION_CONTAINER_PREFIX, session_id),
                workspace_path: self
                    .settings
                    .sessions_root
                    .join(&session_id)
                    .to_string_lossy()
                    .into_owned(),
                owner_host: self.settings.host_id.clone(),
                id: session_id,
            };
            let session = match tx.insert(&new).await {
                Ok(session) => session,
                Err(StorageError::Conflict(_)) => {
                    debug!(conversation_id, attempt, "Lost session insert race, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            tx.commit().await?;

            info!(conversation_id, session_id = %session.id, "Creating session");
            match self.provision(&session, run_id).await {
                Ok(()) => return Ok((session, false)),
                Err(e) => {
                    error!(conversation_id, session_id = %session.id, "Session failed to start: {}", e);
                    if let Err(cleanup) = self.reset_if_current(conversation_id, &session.id).await {
                        warn!(conversation_id, "Failed to discard session: {}", cleanup);
                    }
                    return Err(e);
                }
            }
        }
        Err(SandboxError::Acquire(conversation_id.to_string()))
    }

    async fn provision(&self, session: &ConversationSandboxSession, run_id: &str) -> Result<()> {
        let workspace = SessionWorkspace::new(&session.workspace_path);
        workspace.create().await?;

        self.events
            .publish(run_id, stages::STARTING_CONTAINER, "Starting session container");
        let spec = self.container_spec(session, &workspace);
        self.runtime.create_container(&spec).await?;
        self.wait_ready(session, &workspace).await
    }

    async fn wait_ready(
        &self,
        session: &ConversationSandboxSession,
        workspace: &SessionWorkspace,
    ) -> Result<()> {
        let ready_path = workspace.ipc().ready_path();
        let deadline = Instant::now() + self.settings.ready_timeout();
        loop {
            if tokio::fs::try_exists(&ready_path).await.unwrap_or(false) {
                debug!(session_id = %session.id, "Session runner is ready");
                return Ok(());
            }
            if self.runtime.container_state(&session.container_name).await? != ContainerState::Running {
                return Err(SandboxError::Runtime(crate::providers::RuntimeError::ContainerError(
                    format!("{} exited before becoming ready", session.container_name),
                )));
            }
            if Instant::now() >= deadline {
                return Err(SandboxError::ReadyTimeout(self.settings.ready_timeout()));
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    fn container_spec(
        &self,
        session: &ConversationSandboxSession,
        workspace: &SessionWorkspace,
    ) -> ContainerSpec {
        let settings = &self.settings;
        let mount = |host: PathBuf, container_path: &str, read_only: bool| Mount {
            host_path: host.to_string_lossy().into_owned(),
            container_path: container_path.to_string(),
            read_only,
        };

        ContainerSpec {
            name: session.container_name.clone(),
            image: settings.image.clone(),
            command: vec![
                settings.runner_path.clone(),
                "--tail-chars".to_string(),
                settings.output_tail_chars.to_string(),
                "session".to_string(),
                "--ipc-dir".to_string(),
                WORKSPACE_IPC_DIR.to_string(),
                "--input-dir".to_string(),
                WORKSPACE_INPUT_DIR.to_string(),
                "--output-dir".to_string(),
                WORKSPACE_OUTPUT_DIR.to_string(),
                "--poll-interval-ms".to_string(),
                settings.poll_interval_ms.to_string(),
            ],
            working_dir: WORKSPACE_OUTPUT_DIR.to_string(),
            mounts: vec![
                mount(workspace.input_dir(), WORKSPACE_INPUT_DIR, true),
                mount(workspace.output_dir(), WORKSPACE_OUTPUT_DIR, false),
                mount(workspace.ipc().root().to_path_buf(), WORKSPACE_IPC_DIR, false),
            ],
            env: guest_env(),
            labels: HashMap::from([
                (LABEL_KIND.to_string(), KIND_SESSION.to_string()),
                (LABEL_SESSION_ID.to_string(), session.id.clone()),
                (LABEL_CONVERSATION_ID.to_string(), session.conversation_id.clone()),
                (LABEL_HOST.to_string(), settings.host_id.clone()),
            ]),
            memory_mb: settings.memory_mb,
            nano_cpus: settings.nano_cpus(),
            pids_limit: settings.pids_limit,
            tmpfs_size_mb: settings.tmpfs_size_mb,
            user: settings
                .container_user
                .clone()
                .or_else(|| workspace_owner(workspace.root())),
        }
    }

    /// Sync inputs, claim a sequence and write the request file under the row lock.
    async fn enqueue(
        &self,
        conversation_id: &str,
        session: &ConversationSandboxSession,
        request: &SandboxExecutionRequest,
    ) -> Result<Ticket> {
        let workspace = SessionWorkspace::new(&session.workspace_path);
        let mut tx = self.storage.lock_conversation(conversation_id).await?;
        match tx.current().await? {
            Some(current) if current.id == session.id => {}
            _ => return Err(SandboxError::SessionGone(session.id.clone())),
        }

        let synced = workspace
            .inputs()
            .sync(&request.input_files, &self.materializer)
            .await?;
        let sequence = tx.advance_sequence(&session.id).await?;
        let stem = request_file_stem(sequence, &name_fragment(&request.run_id));
        let file = RequestFile {
            id: request.run_id.clone(),
            sequence,
            code: request.code.clone(),
            file_manifest: synced.manifest,
        };
        write_json_atomic(&workspace.ipc().request_path(&stem), &file)?;
        tx.commit().await?;

        debug!(conversation_id, session_id = %session.id, sequence, "Enqueued request {}", stem);
        Ok(Ticket {
            sequence,
            stem,
            inputs: synced.requested,
            enqueued_at: Instant::now(),
        })
    }

    async fn wait(
        &self,
        conversation_id: &str,
        session: &ConversationSandboxSession,
        ticket: &Ticket,
        run_id: &str,
    ) -> Result<SandboxExecutionResult> {
        let workspace = SessionWorkspace::new(&session.workspace_path);
        let ipc = workspace.ipc();
        let response_path = ipc.response_path(&ticket.stem);
        let deadline = ticket.enqueued_at + self.settings.queue_wait_timeout();

        loop {
            if tokio::fs::try_exists(&response_path).await.unwrap_or(false) {
                break;
            }
            if !workspace.exists() {
                warn!(conversation_id, session_id = %session.id, "Workspace vanished while waiting");
                return Ok(SandboxExecutionResult::failed(
                    run_id,
                    "Session was reset while the request was waiting",
                ));
            }
            if Instant::now() >= deadline {
                warn!(
                    conversation_id,
                    session_id = %session.id,
                    sequence = ticket.sequence,
                    "No response within {:?}, resetting session",
                    self.settings.queue_wait_timeout()
                );
                if let Err(e) = self.reset_if_current(conversation_id, &session.id).await {
                    warn!(conversation_id, "Failed to reset timed out session: {}", e);
                }
                let mut result = SandboxExecutionResult::timeout(
                    run_id,
                    format!(
                        "No response within {}s; the session was reset",
                        self.settings.queue_wait_timeout_secs
                    ),
                );
                result.queue_wait_ms = Some(ticket.enqueued_at.elapsed().as_millis() as u64);
                return Ok(result);
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
        let queue_wait_ms = ticket.enqueued_at.elapsed().as_millis() as u64;

        let response: ResponseFile = serde_json::from_slice(&tokio::fs::read(&response_path).await?)?;
        let artifacts_dir = ipc.artifacts_dir(&ticket.stem);

        self.events
            .publish(run_id, stages::COLLECTING_ARTIFACTS, "Collecting artifacts");
        let limits = ArtifactLimits {
            max_count: self.settings.max_artifacts,
            max_bytes: self.settings.max_artifact_bytes,
        };
        let loaded = match response.status {
            ResponseStatus::Succeeded => Some(load_artifacts(&artifacts_dir, &response.artifacts, limits).await),
            ResponseStatus::Failed => None,
        };

        remove_dir_if_present(&artifacts_dir).await;
        if let Err(e) = tokio::fs::remove_file(&response_path).await {
            warn!(conversation_id, "Failed to remove response {}: {}", response_path.display(), e);
        }
        if let Err(e) = self.storage.touch(&session.id).await {
            warn!(conversation_id, "Failed to refresh session timestamp: {}", e);
        }

        let tail = self.settings.output_tail_chars;
        let mut result = match loaded {
            Some(Ok(artifacts)) => {
                let mut result = SandboxExecutionResult::succeeded(run_id, response.summary);
                result.artifacts = artifacts;
                result
            }
            Some(Err(e)) => {
                warn!(conversation_id, run_id, "Artifact rejected: {}", e);
                SandboxExecutionResult::failed(run_id, format!("Artifact rejected: {}", e))
            }
            None => {
                let message = response
                    .error_message
                    .unwrap_or_else(|| "Execution failed".to_string());
                let mut result = SandboxExecutionResult::failed(
                    run_id,
                    trim_traceback(&message, self.settings.traceback_lines),
                );
                result.summary = response.summary;
                result
            }
        };
        result.stdout_tail = truncate_tail(&response.stdout_tail, tail);
        result.stderr_tail = truncate_tail(&response.stderr_tail, tail);
        result.queue_wait_ms = Some(queue_wait_ms);
        Ok(result)
    }

    /// Liveness of `session`, checked in priority order. `None` means alive.
    async fn assess(&self, session: &ConversationSandboxSession) -> Result<Option<LivenessReason>> {
        let ttl = chrono::Duration::seconds(self.settings.session_ttl_secs as i64);
        if session.is_expired(ttl, chrono::Utc::now()) {
            return Ok(Some(LivenessReason::TtlExpired));
        }
        if !SessionWorkspace::new(&session.workspace_path).exists() {
            return Ok(Some(LivenessReason::WorkspaceMissing));
        }
        match self.runtime.container_state(&session.container_name).await? {
            ContainerState::Running => Ok(None),
            ContainerState::Exited | ContainerState::Missing => {
                Ok(Some(LivenessReason::ContainerNotRunning))
            }
        }
    }

    pub async fn status(&self, conversation_id: &str) -> Result<SessionStatus> {
        let Some(session) = self.storage.get_by_conversation(conversation_id).await? else {
            return Ok(SessionStatus::absent());
        };
        let reason = self.assess(&session).await?;

        let available_files = match SessionWorkspace::new(&session.workspace_path).inputs().entries() {
            Ok(entries) => entries.iter().map(SandboxInputFileMapping::from).collect(),
            Err(e) => {
                warn!(conversation_id, "Failed to read input manifest: {}", e);
                Vec::new()
            }
        };

        Ok(SessionStatus {
            alive: reason.is_none(),
            session_id: Some(session.id.clone()),
            request_sequence: session.last_request_seq(),
            reason,
            available_files,
        })
    }

    /// Delete the conversation's session and tear down its resources.
    /// Returns false when there was nothing to reset.
    pub async fn reset(&self, conversation_id: &str) -> Result<bool> {
        let _guard = self.conversation_guard(conversation_id).await;
        let mut tx = self.storage.lock_conversation(conversation_id).await?;
        let Some(session) = tx.current().await? else {
            tx.commit().await?;
            return Ok(false);
        };
        tx.delete(&session.id).await?;
        tx.commit().await?;

        info!(conversation_id, session_id = %session.id, "Session reset");
        self.teardown(&session).await;
        Ok(true)
    }

    /// Reset only if `session_id` is still the conversation's session.
    async fn reset_if_current(&self, conversation_id: &str, session_id: &str) -> Result<bool> {
        let mut tx = self.storage.lock_conversation(conversation_id).await?;
        let session = match tx.current().await? {
            Some(session) if session.id == session_id => session,
            _ => {
                tx.commit().await?;
                return Ok(false);
            }
        };
        tx.delete(&session.id).await?;
        tx.commit().await?;
        self.teardown(&session).await;
        Ok(true)
    }

    async fn teardown(&self, session: &ConversationSandboxSession) {
        teardown_session(self.runtime.as_ref(), session).await;
    }
}

/// Stop and remove a session's container and delete its workspace.
pub(crate) async fn teardown_session(
    runtime: &dyn ContainerRuntime,
    session: &ConversationSandboxSession,
) {
    if let Err(e) = runtime
        .stop_container(&session.container_name, STOP_TIMEOUT_SECS)
        .await
    {
        debug!(session_id = %session.id, "Stop failed, removing anyway: {}", e);
    }
    if let Err(e) = runtime.remove_container(&session.container_name).await {
        warn!(session_id = %session.id, "Failed to remove container {}: {}", session.container_name, e);
    }
    remove_dir_if_present(Path::new(&session.workspace_path)).await;
    debug!(session_id = %session.id, "Session torn down");
}

pub(crate) async fn remove_dir_if_present(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
