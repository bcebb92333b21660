//! WorkspaceRegistry: the single owner of every backend instance.
//!
//! All read-modify-write sequences on the map (lookup-or-create, delete,
//! exit handling, reconciliation) run under one async mutex, and the
//! snapshot file is rewritten while that mutex is held, so concurrent
//! first-touch requests observe exactly one spawn and snapshot writes never
//! interleave.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use devhost_protocol::{PersistedSnapshot, WorkspaceKey};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{StateError, WorkspaceError};
use crate::launcher::{BackendChild, BackendExit, LaunchSpec, Launcher};
use crate::probe::{ProbePolicy, Readiness, wait_for_socket};
use crate::process::{Lifecycle, NewProcess, WorkspaceProcess, WorkspaceSummary};
use crate::state::StateStore;

/// Longest path (excluding the trailing NUL) that fits in `sockaddr_un.sun_path`.
#[cfg(target_os = "linux")]
pub const MAX_SOCKET_PATH: usize = 107;
#[cfg(not(target_os = "linux"))]
pub const MAX_SOCKET_PATH: usize = 103;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory holding backend sockets.
    pub socket_dir: PathBuf,
    pub probe: ProbePolicy,
    /// Liveness poll interval for re-adopted backends.
    pub adopt_poll_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            probe: ProbePolicy::default(),
            adopt_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Posted by a backend's watcher when the backend goes away.
#[derive(Debug)]
struct ExitEvent {
    key: WorkspaceKey,
    generation: u64,
    exit: BackendExit,
}

pub(crate) type WorkspaceMap = HashMap<WorkspaceKey, Arc<WorkspaceProcess>>;

pub struct WorkspaceRegistry {
    pub(crate) workspaces: Mutex<WorkspaceMap>,
    pub(crate) config: RegistryConfig,
    launcher: Arc<dyn Launcher>,
    store: StateStore,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    next_generation: AtomicU64,
}

impl WorkspaceRegistry {
    /// Build the registry and start its exit-event reaper.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: RegistryConfig, launcher: Arc<dyn Launcher>, store: StateStore) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            workspaces: Mutex::new(HashMap::new()),
            config,
            launcher,
            store,
            exit_tx,
            next_generation: AtomicU64::new(1),
        });
        tokio::spawn(reap_exits(Arc::downgrade(&registry), exit_rx));
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Return the workspace for `key`, spawning its backend if absent.
    ///
    /// At most one backend is launched per key no matter how many callers
    /// race here. Each caller then waits for readiness on its own, bounded by
    /// the probe deadline; a timeout is logged and the instance is returned
    /// anyway.
    pub async fn get_or_create(
        &self,
        key: &WorkspaceKey,
    ) -> Result<Arc<WorkspaceProcess>, WorkspaceError> {
        let process = {
            let mut workspaces = self.workspaces.lock().await;
            match workspaces.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let process = self.spawn_locked(key)?;
                    workspaces.insert(key.clone(), process.clone());
                    self.persist_logged(&workspaces);
                    process
                }
            }
        };

        if process.state() == Lifecycle::Spawning
            && process.wait_ready(self.config.probe.deadline).await == Lifecycle::Spawning
        {
            warn!(
                "Workspace {} not ready after {:?}; continuing degraded",
                process.folder().display(),
                self.config.probe.deadline
            );
        }
        Ok(process)
    }

    pub async fn get(&self, key: &WorkspaceKey) -> Option<Arc<WorkspaceProcess>> {
        self.workspaces.lock().await.get(key).cloned()
    }

    /// Summaries of every registered workspace, ordered by folder.
    pub async fn list(&self) -> Vec<WorkspaceSummary> {
        let workspaces = self.workspaces.lock().await;
        let mut summaries: Vec<_> = workspaces.values().map(|p| p.summary()).collect();
        summaries.sort_by(|a, b| a.path.cmp(&b.path));
        summaries
    }

    /// The workspace whose folder is the longest prefix of `file`.
    pub async fn workspace_for_file(&self, file: &Path) -> Option<Arc<WorkspaceProcess>> {
        let workspaces = self.workspaces.lock().await;
        workspaces
            .values()
            .filter(|p| file.starts_with(p.folder()))
            .max_by_key(|p| p.folder().as_os_str().len())
            .cloned()
    }

    /// Tear down the workspace for `key`. Deleting an absent key is a no-op.
    pub async fn delete(&self, key: &WorkspaceKey) -> bool {
        let mut workspaces = self.workspaces.lock().await;
        self.retire_locked(&mut workspaces, key, "deleted").is_some()
    }

    /// Tear down `process` only if it is still the registered instance for
    /// its key. Used after a dial failure so that concurrent failures against
    /// the same dead backend retire it once and never a fresh respawn.
    pub async fn invalidate(&self, process: &WorkspaceProcess) -> bool {
        let mut workspaces = self.workspaces.lock().await;
        let current = workspaces
            .get(process.key())
            .is_some_and(|p| p.generation() == process.generation());
        current
            && self
                .retire_locked(&mut workspaces, process.key(), "unreachable")
                .is_some()
    }

    /// Record that `process` answered a proxied request.
    ///
    /// A degraded instance that is still registered is promoted to `Ready`.
    pub async fn mark_reachable(&self, process: &WorkspaceProcess) -> bool {
        if process.state() != Lifecycle::Degraded {
            return false;
        }
        let workspaces = self.workspaces.lock().await;
        let current = workspaces
            .get(process.key())
            .is_some_and(|p| p.generation() == process.generation());
        current && process.mark_reachable()
    }

    /// Rewrite the snapshot file from the current map.
    pub async fn persist(&self) -> Result<(), StateError> {
        let workspaces = self.workspaces.lock().await;
        self.persist_locked(&workspaces)
    }

    pub(crate) fn persist_locked(&self, workspaces: &WorkspaceMap) -> Result<(), StateError> {
        let descriptors = workspaces
            .iter()
            .filter(|(_, p)| p.state() != Lifecycle::Dead)
            .map(|(key, p)| (key.clone(), p.descriptor()))
            .collect();
        self.store.save(&PersistedSnapshot::new(descriptors))
    }

    pub(crate) fn persist_logged(&self, workspaces: &WorkspaceMap) {
        if let Err(e) = self.persist_locked(workspaces) {
            warn!("Failed to persist workspace state: {e}");
        }
    }

    fn spawn_locked(&self, key: &WorkspaceKey) -> Result<Arc<WorkspaceProcess>, WorkspaceError> {
        let folder = key.to_path();
        let dir = &self.config.socket_dir;
        std::fs::create_dir_all(dir).map_err(|source| WorkspaceError::Socket {
            path: dir.clone(),
            source,
        })?;

        let socket_path = key.socket_path(dir);
        check_socket_path(&socket_path)?;
        let control_socket_path = self
            .launcher
            .wants_control_socket()
            .then(|| key.control_socket_path(dir));

        // A leftover socket from a dead backend would make the new bind fail.
        for path in std::iter::once(&socket_path).chain(control_socket_path.as_ref()) {
            remove_socket_file(path).map_err(|source| WorkspaceError::Socket {
                path: path.clone(),
                source,
            })?;
        }

        let child = self.launcher.launch(&LaunchSpec {
            key,
            folder: &folder,
            socket_path: &socket_path,
            control_socket_path: control_socket_path.as_deref(),
        })?;
        info!(
            "Spawned backend for {} (pid {:?}, socket {})",
            folder.display(),
            child.pid(),
            socket_path.display()
        );

        let process = self.track(key.clone(), folder, socket_path, control_socket_path, child, false);
        tokio::spawn(probe_until_ready(process.clone(), self.config.probe));
        Ok(process)
    }

    /// Wrap a launched or adopted backend and forward its exit to the reaper.
    pub(crate) fn track(
        &self,
        key: WorkspaceKey,
        folder: PathBuf,
        socket_path: PathBuf,
        control_socket_path: Option<PathBuf>,
        child: BackendChild,
        adopted: bool,
    ) -> Arc<WorkspaceProcess> {
        let (pid, kill_tx, exited) = child.into_parts();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let process = Arc::new(WorkspaceProcess::new(NewProcess {
            key: key.clone(),
            folder,
            socket_path,
            control_socket_path,
            pid,
            generation,
            adopted,
            initial: if adopted { Lifecycle::Ready } else { Lifecycle::Spawning },
            kill_tx,
        }));

        let exit_tx = self.exit_tx.clone();
        tokio::spawn(forward_exit(key, generation, exited, exit_tx));
        process
    }

    /// Remove `key`, mark it dead, kill its backend and delete its sockets.
    fn retire_locked(
        &self,
        workspaces: &mut WorkspaceMap,
        key: &WorkspaceKey,
        reason: &str,
    ) -> Option<Arc<WorkspaceProcess>> {
        let process = workspaces.remove(key)?;
        process.transition(Lifecycle::Dead);
        process.kill();
        for path in std::iter::once(process.socket_path()).chain(process.control_socket_path()) {
            if let Err(e) = remove_socket_file(path) {
                warn!("Failed to remove socket {}: {e}", path.display());
            }
        }
        info!(
            "Workspace {} retired ({reason}, pid {:?})",
            process.folder().display(),
            process.pid()
        );
        self.persist_logged(workspaces);
        Some(process)
    }

    async fn handle_exit(&self, event: ExitEvent) {
        let mut workspaces = self.workspaces.lock().await;
        let current = workspaces
            .get(&event.key)
            .is_some_and(|p| p.generation() == event.generation);
        if !current {
            debug!(
                "Ignoring exit of stale backend generation {} ({:?})",
                event.generation, event.exit
            );
            return;
        }
        let reason = match event.exit {
            BackendExit::Exited(Some(code)) => format!("exited with status {code}"),
            BackendExit::Exited(None) => "exited".to_string(),
            BackendExit::Killed => "killed".to_string(),
            BackendExit::Lost => "lost".to_string(),
        };
        self.retire_locked(&mut workspaces, &event.key, &reason);
    }
}

async fn reap_exits(registry: Weak<WorkspaceRegistry>, mut rx: mpsc::UnboundedReceiver<ExitEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.handle_exit(event).await;
    }
}

async fn forward_exit(
    key: WorkspaceKey,
    generation: u64,
    exited: oneshot::Receiver<BackendExit>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
) {
    let exit = exited.await.unwrap_or(BackendExit::Lost);
    let _ = exit_tx.send(ExitEvent {
        key,
        generation,
        exit,
    });
}

async fn probe_until_ready(process: Arc<WorkspaceProcess>, policy: ProbePolicy) {
    let readiness = tokio::select! {
        readiness = wait_for_socket(process.socket_path(), policy) => readiness,
        _ = process.dead() => return,
    };
    match readiness {
        Readiness::Ready => {
            if process.transition(Lifecycle::Ready) {
                info!("Workspace {} ready", process.folder().display());
            }
        }
        Readiness::TimedOut => {
            if process.transition(Lifecycle::Degraded) {
                warn!(
                    "Workspace {} did not accept connections within {:?}; admitted degraded",
                    process.folder().display(),
                    policy.deadline
                );
            }
        }
    }
}

fn check_socket_path(path: &Path) -> Result<(), WorkspaceError> {
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH {
        return Err(WorkspaceError::SocketPathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_SOCKET_PATH,
        });
    }
    Ok(())
}

/// Delete a socket file; a missing file is fine.
pub(crate) fn remove_socket_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
