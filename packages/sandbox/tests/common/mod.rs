// ABOUTME: In-process container runtime for integration tests
// ABOUTME: Runs the real guest runner loops against a scripted kernel, mapping container paths through mounts

#![allow(dead_code)]

use async_trait::async_trait;
use codebox_protocol::{IpcLayout, JobFile};
use codebox_runner::testing::ScriptKernel;
use codebox_runner::{run_job, serve, RunnerDirs, RunnerOptions, SessionRunnerOptions};
use codebox_sandbox::providers::Result as RuntimeResult;
use codebox_sandbox::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, EphemeralExecutor,
    IdleSweeper, OutputChunk, OutputStream, SandboxSettings, SessionExecutor, StatusEventBus,
    StreamType,
};
use codebox_storage::SessionStorage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What a created container does
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Run the guest runner named by the container command
    Runner,
    /// Print these stdout lines, then exit with the code
    Raw { lines: Vec<String>, exit_code: i64 },
    /// Never produce output or exit
    Hang,
}

struct FakeContainer {
    labels: HashMap<String, String>,
    created_at: chrono::DateTime<chrono::Utc>,
    output: Option<mpsc::UnboundedReceiver<OutputChunk>>,
    exit: watch::Receiver<Option<i64>>,
    exit_tx: Arc<watch::Sender<Option<i64>>>,
    handle: JoinHandle<()>,
}

pub struct FakeRuntime {
    behavior: Mutex<Behavior>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    created: Mutex<Vec<ContainerSpec>>,
    removed: Mutex<Vec<String>>,
}

fn host_path(spec: &ContainerSpec, container_path: &str) -> PathBuf {
    spec.mounts
        .iter()
        .filter(|m| container_path.starts_with(&m.container_path))
        .max_by_key(|m| m.container_path.len())
        .map(|m| {
            let rest = container_path[m.container_path.len()..].trim_start_matches('/');
            Path::new(&m.host_path).join(rest)
        })
        .unwrap_or_else(|| panic!("{} is not mounted", container_path))
}

fn flag(command: &[String], name: &str) -> Option<String> {
    command
        .iter()
        .position(|arg| arg == name)
        .and_then(|i| command.get(i + 1).cloned())
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(Behavior::Runner),
            containers: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.containers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a hanging container that nothing in the database knows about.
    pub fn insert_container(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        created_at: chrono::DateTime<chrono::Utc>,
    ) {
        let (exit_tx, exit) = watch::channel(None);
        let handle = tokio::spawn(std::future::pending::<()>());
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                created_at,
                output: None,
                exit,
                exit_tx: Arc::new(exit_tx),
                handle,
            },
        );
    }

    /// Simulate the container dying on its own.
    pub fn crash(&self, name: &str) {
        if let Some(container) = self.containers.lock().unwrap().get(name) {
            container.handle.abort();
            let _ = container.exit_tx.send(Some(137));
        }
    }

    fn launch(
        spec: &ContainerSpec,
        behavior: Behavior,
        tx: mpsc::UnboundedSender<OutputChunk>,
        exit_tx: Arc<watch::Sender<Option<i64>>>,
    ) -> JoinHandle<()> {
        let command = spec.command.clone();
        match behavior {
            Behavior::Hang => tokio::spawn(async move {
                let _keep_open = tx;
                std::future::pending::<()>().await;
            }),
            Behavior::Raw { lines, exit_code } => tokio::spawn(async move {
                for line in lines {
                    let _ = tx.send(stdout_chunk(format!("{}\n", line).into_bytes()));
                }
                drop(tx);
                let _ = exit_tx.send(Some(exit_code));
            }),
            Behavior::Runner if command.iter().any(|a| a == "oneshot") => {
                let job_path = host_path(spec, &flag(&command, "--job").expect("--job"));
                let dirs = RunnerDirs {
                    input_dir: host_path(spec, &flag(&command, "--input-dir").expect("--input-dir")),
                    output_dir: host_path(spec, &flag(&command, "--output-dir").expect("--output-dir")),
                };
                tokio::spawn(async move {
                    let job: JobFile =
                        serde_json::from_slice(&std::fs::read(&job_path).unwrap()).unwrap();
                    let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
                    let forward = tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        loop {
                            match reader.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    let _ = tx.send(stdout_chunk(buf[..n].to_vec()));
                                }
                            }
                        }
                    });
                    let mut kernel = ScriptKernel::new();
                    let ok = run_job(&job, &dirs, &mut kernel, &mut writer, &RunnerOptions::default())
                        .await
                        .unwrap_or(false);
                    drop(writer);
                    let _ = forward.await;
                    let _ = exit_tx.send(Some(if ok { 0 } else { 1 }));
                })
            }
            Behavior::Runner => {
                let layout = IpcLayout::new(host_path(spec, &flag(&command, "--ipc-dir").expect("--ipc-dir")));
                let dirs = RunnerDirs {
                    input_dir: host_path(spec, &flag(&command, "--input-dir").expect("--input-dir")),
                    output_dir: host_path(spec, &flag(&command, "--output-dir").expect("--output-dir")),
                };
                drop(tx);
                tokio::spawn(async move {
                    let options = SessionRunnerOptions {
                        poll_interval: Duration::from_millis(10),
                        tail_chars: 8_000,
                    };
                    let mut kernel = ScriptKernel::new();
                    let _ = serve(&layout, &dirs, &mut kernel, &options).await;
                    let _ = exit_tx.send(Some(0));
                })
            }
        }
    }
}

fn stdout_chunk(data: Vec<u8>) -> OutputChunk {
    OutputChunk {
        timestamp: chrono::Utc::now(),
        stream: StreamType::Stdout,
        data,
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_available(&self) -> RuntimeResult<bool> {
        Ok(true)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.created.lock().unwrap().push(spec.clone());
        let behavior = self.behavior.lock().unwrap().clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let (exit_tx, exit) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        let handle = Self::launch(spec, behavior, tx, exit_tx.clone());

        self.containers.lock().unwrap().insert(
            spec.name.clone(),
            FakeContainer {
                labels: spec.labels.clone(),
                created_at: chrono::Utc::now(),
                output: Some(rx),
                exit,
                exit_tx,
                handle,
            },
        );
        Ok(spec.name.clone())
    }

    async fn stream_output(&self, container_id: &str) -> RuntimeResult<OutputStream> {
        let receiver = self
            .containers
            .lock()
            .unwrap()
            .get_mut(container_id)
            .and_then(|c| c.output.take())
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        Ok(OutputStream { receiver })
    }

    async fn wait_container(&self, container_id: &str) -> RuntimeResult<i64> {
        let exit = self
            .containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.exit.clone());
        let Some(mut exit) = exit else {
            return Err(codebox_sandbox::RuntimeError::NotFound(container_id.to_string()));
        };
        loop {
            if let Some(code) = *exit.borrow() {
                return Ok(code);
            }
            if exit.changed().await.is_err() {
                return Ok(137);
            }
        }
    }

    async fn kill_container(&self, container_id: &str) -> RuntimeResult<()> {
        if let Some(container) = self.containers.lock().unwrap().get(container_id) {
            container.handle.abort();
            let _ = container.exit_tx.send(Some(137));
        }
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: u64) -> RuntimeResult<()> {
        if let Some(container) = self.containers.lock().unwrap().get(container_id) {
            container.handle.abort();
            if container.exit_tx.borrow().is_none() {
                let _ = container.exit_tx.send(Some(0));
            }
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()> {
        if let Some(container) = self.containers.lock().unwrap().remove(container_id) {
            container.handle.abort();
            self.removed.lock().unwrap().push(container_id.to_string());
        }
        Ok(())
    }

    async fn container_state(&self, container_id: &str) -> RuntimeResult<ContainerState> {
        Ok(match self.containers.lock().unwrap().get(container_id) {
            None => ContainerState::Missing,
            Some(c) if c.exit.borrow().is_some() || c.handle.is_finished() => ContainerState::Exited,
            Some(_) => ContainerState::Running,
        })
    }

    async fn list_containers(&self, labels: &[(&str, &str)]) -> RuntimeResult<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| {
                labels
                    .iter()
                    .all(|(k, v)| c.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(name, c)| ContainerSummary {
                id: name.clone(),
                name: name.clone(),
                labels: c.labels.clone(),
                created_at: c.created_at,
            })
            .collect())
    }
}

pub const HOST_ID: &str = "test-host";

pub struct Harness {
    pub dir: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub storage: SessionStorage,
    pub settings: Arc<SandboxSettings>,
    pub events: StatusEventBus,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    pub async fn with_settings(configure: impl FnOnce(&mut SandboxSettings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = SandboxSettings {
            timeout_secs: 5,
            ready_timeout_secs: 5,
            queue_wait_timeout_secs: 5,
            poll_interval_ms: 20,
            sessions_root: dir.path().join("sessions"),
            ephemeral_root: dir.path().join("runs"),
            database_url: format!("sqlite://{}", dir.path().join("codebox.db").display()),
            host_id: HOST_ID.to_string(),
            container_user: Some("1000:1000".to_string()),
            ..SandboxSettings::default()
        };
        configure(&mut settings);

        let pool = codebox_storage::connect(&settings.database_url).await.unwrap();
        Self {
            dir,
            runtime: Arc::new(FakeRuntime::new()),
            storage: SessionStorage::new(pool),
            settings: Arc::new(settings),
            events: StatusEventBus::default(),
        }
    }

    pub fn session_executor(&self) -> SessionExecutor {
        SessionExecutor::new(
            self.runtime.clone(),
            self.storage.clone(),
            self.settings.clone(),
            self.events.clone(),
        )
    }

    pub fn ephemeral_executor(&self) -> EphemeralExecutor {
        EphemeralExecutor::new(self.runtime.clone(), self.settings.clone(), self.events.clone())
    }

    pub fn sweeper(&self) -> IdleSweeper {
        IdleSweeper::new(self.runtime.clone(), self.storage.clone(), self.settings.clone())
    }

    pub fn sessions_root(&self) -> &Path {
        &self.settings.sessions_root
    }
}
