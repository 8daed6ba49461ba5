// ABOUTME: Periodic reconciliation of session rows, containers and workspace directories
// ABOUTME: Removes expired sessions plus anything left behind by crashes or restarts

use crate::ephemeral::RUN_DIR_PREFIX;
use crate::error::Result;
use crate::providers::{
    ContainerRuntime, KIND_EPHEMERAL, KIND_SESSION, LABEL_HOST, LABEL_KIND, LABEL_SESSION_ID,
};
use crate::session::{remove_dir_if_present, teardown_session};
use crate::settings::SandboxSettings;
use chrono::Utc;
use codebox_storage::SessionStorage;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub orphaned_containers: usize,
    pub orphaned_workspaces: usize,
    pub stale_ephemeral_containers: usize,
    pub stale_ephemeral_workspaces: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired_sessions
            + self.orphaned_containers
            + self.orphaned_workspaces
            + self.stale_ephemeral_containers
            + self.stale_ephemeral_workspaces
    }
}

struct DirEntryInfo {
    name: String,
    path: PathBuf,
    modified: Option<SystemTime>,
}

async fn list_dirs(root: &Path) -> Result<Vec<DirEntryInfo>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if !meta.is_dir() {
            continue;
        }
        dirs.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            modified: meta.modified().ok(),
        });
    }
    Ok(dirs)
}

#[derive(Clone)]
pub struct IdleSweeper {
    runtime: Arc<dyn ContainerRuntime>,
    storage: SessionStorage,
    settings: Arc<SandboxSettings>,
    running: Arc<RwLock<bool>>,
}

impl IdleSweeper {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        storage: SessionStorage,
        settings: Arc<SandboxSettings>,
    ) -> Self {
        Self {
            runtime,
            storage,
            settings,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start sweeping in the background at the configured interval
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return; // Already running
        }
        *running = true;
        drop(running);

        let sweeper = self.clone();
        tokio::spawn(async move {
            info!("Idle sweeper started");
            let mut ticker = tokio::time::interval(sweeper.settings.sweep_interval());
            loop {
                ticker.tick().await;
                if !*sweeper.running.read().await {
                    info!("Idle sweeper stopped");
                    break;
                }
                match sweeper.sweep_once().await {
                    Ok(report) if report.total() > 0 => info!(?report, "Sweep removed stale resources"),
                    Ok(_) => debug!("Sweep found nothing to remove"),
                    Err(e) => error!("Sweep failed: {}", e),
                }
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// One reconciliation pass over the database, the runtime and the filesystem.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let host = self.settings.host_id.as_str();

        // Observe containers and directories before reading rows: a session's
        // row is committed before its resources exist, so anything seen here
        // without a row is a genuine orphan.
        let session_containers = self
            .runtime
            .list_containers(&[(LABEL_KIND, KIND_SESSION), (LABEL_HOST, host)])
            .await?;
        let workspace_dirs = list_dirs(&self.settings.sessions_root).await?;
        let ephemeral_containers = self
            .runtime
            .list_containers(&[(LABEL_KIND, KIND_EPHEMERAL), (LABEL_HOST, host)])
            .await?;
        let ephemeral_dirs = list_dirs(&self.settings.ephemeral_root).await?;

        let expired = self.expire_sessions().await?;
        report.expired_sessions = expired.len();

        // Sessions expired above were already torn down
        let mut known: HashSet<String> = self
            .storage
            .list_sessions()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        known.extend(expired);

        for container in session_containers {
            let owned = container
                .label(LABEL_SESSION_ID)
                .is_some_and(|id| known.contains(id));
            if owned {
                continue;
            }
            info!(container = %container.name, "Removing orphaned session container");
            if let Err(e) = self.runtime.remove_container(&container.id).await {
                warn!(container = %container.name, "Failed to remove orphan: {}", e);
                continue;
            }
            report.orphaned_containers += 1;
        }

        for dir in workspace_dirs {
            if known.contains(&dir.name) {
                continue;
            }
            info!("Removing orphaned workspace {}", dir.path.display());
            remove_dir_if_present(&dir.path).await;
            report.orphaned_workspaces += 1;
        }

        let stale_after = self.settings.timeout() * 2;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::hours(1));
        for container in ephemeral_containers {
            if container.created_at > cutoff {
                continue;
            }
            info!(container = %container.name, "Removing stale ephemeral container");
            if let Err(e) = self.runtime.remove_container(&container.id).await {
                warn!(container = %container.name, "Failed to remove stale container: {}", e);
                continue;
            }
            report.stale_ephemeral_containers += 1;
        }

        let now = SystemTime::now();
        for dir in ephemeral_dirs {
            if !dir.name.starts_with(RUN_DIR_PREFIX) {
                continue;
            }
            let age = dir
                .modified
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if age < stale_after {
                continue;
            }
            info!("Removing stale run directory {}", dir.path.display());
            remove_dir_if_present(&dir.path).await;
            report.stale_ephemeral_workspaces += 1;
        }

        Ok(report)
    }

    /// Delete this host's sessions idle past the TTL, rechecking each under its row lock.
    /// Returns the ids of the sessions removed.
    async fn expire_sessions(&self) -> Result<Vec<String>> {
        let ttl = chrono::Duration::seconds(self.settings.session_ttl_secs as i64);
        let host = self.settings.host_id.as_str();
        let candidates: Vec<_> = self
            .storage
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| s.owner_host == host && s.is_expired(ttl, Utc::now()))
            .collect();

        let mut expired = Vec::new();
        for candidate in candidates {
            let mut tx = self.storage.lock_conversation(&candidate.conversation_id).await?;
            let session = match tx.current().await? {
                Some(s) if s.id == candidate.id && s.is_expired(ttl, Utc::now()) => s,
                _ => {
                    tx.commit().await?;
                    continue;
                }
            };
            tx.delete(&session.id).await?;
            tx.commit().await?;

            info!(
                conversation_id = %session.conversation_id,
                session_id = %session.id,
                "Expiring idle session"
            );
            teardown_session(self.runtime.as_ref(), &session).await;
            expired.push(session.id);
        }
        Ok(expired)
    }
}
