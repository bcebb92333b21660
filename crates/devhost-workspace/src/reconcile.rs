//! Startup reconciliation: re-adopt backends that survived a router
//! restart, discard the rest, and sweep orphaned sockets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use devhost_protocol::{PersistedSnapshot, SOCKET_PREFIX, SOCKET_SUFFIX, WorkspaceDescriptor, WorkspaceKey};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;
use crate::launcher::BackendChild;
use crate::probe::probe_socket;
use crate::registry::{WorkspaceRegistry, remove_socket_file};

/// Why a persisted descriptor was not re-admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscardReason {
    #[error("descriptor does not match the key's folder or socket path")]
    ForeignDescriptor,
    #[error("socket file is missing")]
    SocketMissing,
    #[error("no running process references the socket")]
    NoProcess,
    #[error("process {0} does not accept connections")]
    Unresponsive(u32),
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub admitted: Vec<WorkspaceKey>,
    pub discarded: Vec<(WorkspaceKey, DiscardReason)>,
    /// Orphaned socket files removed by the sweep.
    pub swept: Vec<PathBuf>,
}

impl WorkspaceRegistry {
    /// Re-admit the snapshot's surviving backends as `Ready`.
    ///
    /// Per-entry failures only drop that entry. The only fatal error is a
    /// stale socket that cannot be removed, since it would break every later
    /// spawn for that key.
    pub async fn reconcile(
        &self,
        snapshot: PersistedSnapshot,
    ) -> Result<ReconcileReport, WorkspaceError> {
        let mut report = ReconcileReport::default();
        let mut workspaces = self.workspaces.lock().await;
        let dir = self.config.socket_dir.clone();

        for (key, descriptor) in snapshot.workspaces {
            if workspaces.contains_key(&key) {
                continue;
            }
            let socket_path = key.socket_path(&dir);
            let control_socket_path = key.control_socket_path(&dir);

            match verify(&key, &descriptor, &socket_path).await {
                Ok(pid) => {
                    let control = descriptor
                        .control_socket_path
                        .filter(|p| *p == control_socket_path && p.exists());
                    let child = BackendChild::adopt(pid, self.config.adopt_poll_interval);
                    let process = self.track(
                        key.clone(),
                        descriptor.path,
                        socket_path,
                        control,
                        child,
                        true,
                    );
                    info!(
                        "Re-adopted workspace {} (pid {pid})",
                        process.folder().display()
                    );
                    workspaces.insert(key.clone(), process);
                    report.admitted.push(key);
                }
                Err(reason) => {
                    warn!(
                        "Discarding persisted workspace {}: {reason}",
                        descriptor.path.display()
                    );
                    if let Some(pid) = descriptor.pid
                        && !matches!(reason, DiscardReason::Unresponsive(_))
                        && owns_recorded_socket(&key, &descriptor.socket_path, &dir)
                        && process_names_socket(pid, &descriptor.socket_path).await
                    {
                        kill_pid(pid);
                    }
                    for path in [&socket_path, &control_socket_path] {
                        remove_socket_file(path).map_err(|source| WorkspaceError::StaleSocket {
                            path: path.clone(),
                            source,
                        })?;
                    }
                    let recorded = std::iter::once(&descriptor.socket_path)
                        .chain(descriptor.control_socket_path.as_ref())
                        .filter(|p| **p != socket_path && **p != control_socket_path)
                        .filter(|p| owns_recorded_socket(&key, p, &dir));
                    for path in recorded {
                        if let Err(e) = remove_socket_file(path) {
                            warn!("Failed to remove recorded socket {}: {e}", path.display());
                        }
                    }
                    report.discarded.push((key, reason));
                }
            }
        }

        let keep: HashSet<PathBuf> = workspaces
            .values()
            .flat_map(|p| {
                std::iter::once(p.socket_path().to_path_buf())
                    .chain(p.control_socket_path().map(Path::to_path_buf))
            })
            .collect();
        report.swept = sweep_orphan_sockets(&dir, &keep)?;
        self.persist_logged(&workspaces);

        info!(
            "Reconciled workspaces: {} admitted, {} discarded, {} orphan socket(s) swept",
            report.admitted.len(),
            report.discarded.len(),
            report.swept.len()
        );
        Ok(report)
    }
}

/// Whether a socket path from a discarded descriptor may be cleaned up.
///
/// It must carry a backend socket name. Inside the current socket directory
/// it must also belong to `key`, since other names there may be live.
fn owns_recorded_socket(key: &WorkspaceKey, path: &Path, dir: &Path) -> bool {
    match WorkspaceKey::from_any_socket_path(path) {
        Some(owner) => owner == *key || path.parent() != Some(dir),
        None => false,
    }
}

async fn verify(
    key: &WorkspaceKey,
    descriptor: &WorkspaceDescriptor,
    socket_path: &Path,
) -> Result<u32, DiscardReason> {
    if descriptor.path != key.to_path() || descriptor.socket_path != socket_path {
        return Err(DiscardReason::ForeignDescriptor);
    }
    if std::fs::symlink_metadata(socket_path).is_err() {
        return Err(DiscardReason::SocketMissing);
    }
    let pid = find_backend_process(socket_path, descriptor.pid)
        .await
        .ok_or(DiscardReason::NoProcess)?;
    if !probe_socket(socket_path).await {
        kill_pid(pid);
        return Err(DiscardReason::Unresponsive(pid));
    }
    Ok(pid)
}

/// Find a live process whose command line references `socket`.
///
/// The persisted PID is preferred when it matches; otherwise the whole
/// process table is scanned.
pub async fn find_backend_process(socket: &Path, hint: Option<u32>) -> Option<u32> {
    let socket = socket.to_path_buf();
    let scan = tokio::task::spawn_blocking(move || {
        let system = process_table(ProcessesToUpdate::All);
        let own = Pid::from_u32(std::process::id());
        if let Some(pid) = hint
            && system
                .process(Pid::from_u32(pid))
                .is_some_and(|p| cmd_names_socket(p, &socket))
        {
            return Some(pid);
        }
        system
            .processes()
            .iter()
            .filter(|(pid, p)| **pid != own && p.thread_kind().is_none())
            .filter(|(_, p)| cmd_names_socket(p, &socket))
            // Forked children briefly share the parent's command line.
            .map(|(pid, _)| pid.as_u32())
            .min()
    });
    match scan.await {
        Ok(found) => found,
        Err(e) => {
            debug!("Process scan failed: {e}");
            None
        }
    }
}

/// Whether `pid` is alive and its command line references `socket`.
pub async fn process_names_socket(pid: u32, socket: &Path) -> bool {
    let socket = socket.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let pid = Pid::from_u32(pid);
        process_table(ProcessesToUpdate::Some(&[pid]))
            .process(pid)
            .is_some_and(|p| cmd_names_socket(p, &socket))
    })
    .await
    .unwrap_or(false)
}

fn process_table(which: ProcessesToUpdate<'_>) -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        which,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    system
}

fn cmd_names_socket(process: &Process, socket: &Path) -> bool {
    let needle = socket.to_string_lossy();
    process.status() != ProcessStatus::Zombie
        && process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(needle.as_ref()))
}

/// Whether `pid` names a live, non-zombie process.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs existence and permission checks.
    let rc = unsafe { libc::kill(raw, 0) };
    let exists = rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    process_table(ProcessesToUpdate::Some(&[pid]))
        .process(pid)
        .is_some_and(|p| p.status() == ProcessStatus::Zombie)
}

/// SIGKILL a process that is not our child.
pub fn kill_pid(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    // SAFETY: plain kill(2) on a positive PID.
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc != 0 {
        debug!("kill({pid}) failed: {}", std::io::Error::last_os_error());
    } else {
        info!("Killed backend process {pid}");
    }
}

/// Delete every backend socket in `dir` that is not in `keep`.
pub fn sweep_orphan_sockets(
    dir: &Path,
    keep: &HashSet<PathBuf>,
) -> Result<Vec<PathBuf>, WorkspaceError> {
    let pattern = format!(
        "{}/{SOCKET_PREFIX}*{SOCKET_SUFFIX}",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Skipping socket sweep of {}: {e}", dir.display());
            return Ok(Vec::new());
        }
    };

    let mut swept = Vec::new();
    for path in entries.flatten() {
        if keep.contains(&path) || WorkspaceKey::from_any_socket_path(&path).is_none() {
            continue;
        }
        remove_socket_file(&path).map_err(|source| WorkspaceError::StaleSocket {
            path: path.clone(),
            source,
        })?;
        debug!("Swept orphan socket {}", path.display());
        swept.push(path);
    }
    Ok(swept)
}
