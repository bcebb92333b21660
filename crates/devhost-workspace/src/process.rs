//! One backend instance and its lifecycle state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use devhost_protocol::{WorkspaceDescriptor, WorkspaceKey};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::info;

/// Lifecycle of a [`WorkspaceProcess`]. Transitions only move forward:
/// `Spawning → Ready | Degraded`, `Degraded → Ready`, anything `→ Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Spawning,
    /// Admitted after the readiness deadline passed without a successful dial.
    Degraded,
    Ready,
    Dead,
}

impl Lifecycle {
    fn rank(self) -> u8 {
        match self {
            Lifecycle::Spawning => 0,
            Lifecycle::Degraded => 1,
            Lifecycle::Ready => 2,
            Lifecycle::Dead => 3,
        }
    }
}

/// A running (or starting) backend owned by the registry.
#[derive(Debug)]
pub struct WorkspaceProcess {
    key: WorkspaceKey,
    folder: PathBuf,
    socket_path: PathBuf,
    control_socket_path: Option<PathBuf>,
    pid: Option<u32>,
    generation: u64,
    spawned_at: DateTime<Utc>,
    adopted: bool,
    state: watch::Sender<Lifecycle>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Serializable view of a workspace for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSummary {
    pub key: WorkspaceKey,
    pub path: PathBuf,
    pub socket_path: PathBuf,
    pub pid: Option<u32>,
    pub state: Lifecycle,
    pub adopted: bool,
    pub spawned_at: DateTime<Utc>,
}

pub(crate) struct NewProcess {
    pub key: WorkspaceKey,
    pub folder: PathBuf,
    pub socket_path: PathBuf,
    pub control_socket_path: Option<PathBuf>,
    pub pid: Option<u32>,
    pub generation: u64,
    pub adopted: bool,
    pub initial: Lifecycle,
    pub kill_tx: oneshot::Sender<()>,
}

impl WorkspaceProcess {
    pub(crate) fn new(parts: NewProcess) -> Self {
        let (state, _) = watch::channel(parts.initial);
        Self {
            key: parts.key,
            folder: parts.folder,
            socket_path: parts.socket_path,
            control_socket_path: parts.control_socket_path,
            pid: parts.pid,
            generation: parts.generation,
            spawned_at: Utc::now(),
            adopted: parts.adopted,
            state,
            kill_tx: Mutex::new(Some(parts.kill_tx)),
        }
    }

    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn control_socket_path(&self) -> Option<&Path> {
        self.control_socket_path.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Monotonic instance number; a respawn for the same key gets a new one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this instance was re-adopted at startup rather than spawned.
    pub fn adopted(&self) -> bool {
        self.adopted
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.borrow()
    }

    /// Apply a forward transition. Returns false if it would move backwards.
    pub(crate) fn transition(&self, next: Lifecycle) -> bool {
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Promote a degraded instance to `Ready`.
    pub(crate) fn mark_reachable(&self) -> bool {
        let promoted = self.state() == Lifecycle::Degraded && self.transition(Lifecycle::Ready);
        if promoted {
            info!("Workspace {} reachable again", self.folder.display());
        }
        promoted
    }

    /// Wait until the instance leaves `Spawning`, or `timeout` elapses.
    /// Returns the state observed at that point.
    pub async fn wait_ready(&self, timeout: Duration) -> Lifecycle {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|s| *s != Lifecycle::Spawning)).await;
        match settled {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }

    /// Wait until the instance is `Dead`.
    pub async fn dead(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == Lifecycle::Dead).await;
    }

    /// Ask the watcher to kill the backend. Only the first call has effect.
    pub(crate) fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn descriptor(&self) -> WorkspaceDescriptor {
        WorkspaceDescriptor {
            path: self.folder.clone(),
            socket_path: self.socket_path.clone(),
            control_socket_path: self.control_socket_path.clone(),
            pid: self.pid,
        }
    }

    pub fn summary(&self) -> WorkspaceSummary {
        WorkspaceSummary {
            key: self.key.clone(),
            path: self.folder.clone(),
            socket_path: self.socket_path.clone(),
            pid: self.pid,
            state: self.state(),
            adopted: self.adopted,
            spawned_at: self.spawned_at,
        }
    }
}
