//! Shared fixtures: an in-process fake backend launcher.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use devhost_workspace::{
    BackendChild, BackendExit, LaunchSpec, Launcher, ProbePolicy, RegistryConfig, StateStore,
    WorkspaceError, WorkspaceRegistry,
};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::oneshot;

struct Controls {
    crash: Option<oneshot::Sender<()>>,
    sever: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Inner {
    spawns: AtomicUsize,
    never_listen: AtomicBool,
    startup_delay: Mutex<Duration>,
    folders: Mutex<Vec<PathBuf>>,
    controls: Mutex<HashMap<usize, Controls>>,
}

/// Launches in-process HTTP servers bound to the requested unix socket.
///
/// Every backend answers any request with JSON naming its instance number
/// (1-based, in spawn order), its folder, and the request path.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    inner: Arc<Inner>,
}

enum Ending {
    Exit(BackendExit),
    Severed,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends never bind their socket.
    pub fn never_listening() -> Self {
        let launcher = Self::default();
        launcher.inner.never_listen.store(true, Ordering::SeqCst);
        launcher
    }

    pub fn with_startup_delay(delay: Duration) -> Self {
        let launcher = Self::default();
        *launcher.inner.startup_delay.lock() = delay;
        launcher
    }

    pub fn spawns(&self) -> usize {
        self.inner.spawns.load(Ordering::SeqCst)
    }

    pub fn folders(&self) -> Vec<PathBuf> {
        self.inner.folders.lock().clone()
    }

    /// Make backend `instance` exit with status 137, as if OOM-killed.
    pub fn crash(&self, instance: usize) {
        let tx = self
            .inner
            .controls
            .lock()
            .get_mut(&instance)
            .and_then(|c| c.crash.take());
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Make backend `instance` stop serving and drop its socket without the
    /// process exiting, so only a dial notices.
    pub fn sever(&self, instance: usize) {
        let tx = self
            .inner
            .controls
            .lock()
            .get_mut(&instance)
            .and_then(|c| c.sever.take());
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<BackendChild, WorkspaceError> {
        let instance = self.inner.spawns.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.folders.lock().push(spec.folder.to_path_buf());

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exited) = oneshot::channel();
        let (crash_tx, crash_rx) = oneshot::channel::<()>();
        let (sever_tx, sever_rx) = oneshot::channel::<()>();
        self.inner.controls.lock().insert(
            instance,
            Controls {
                crash: Some(crash_tx),
                sever: Some(sever_tx),
            },
        );

        let socket = spec.socket_path.to_path_buf();
        let bind_path = socket.clone();
        let folder = spec.folder.to_path_buf();
        let delay = *self.inner.startup_delay.lock();
        let listen = !self.inner.never_listen.load(Ordering::SeqCst);

        tokio::spawn(async move {
            let serve = async move {
                tokio::time::sleep(delay).await;
                if !listen {
                    return std::future::pending::<()>().await;
                }
                let listener = UnixListener::bind(&bind_path).unwrap();
                let _ = axum::serve(listener, backend_app(instance, folder)).await;
            };
            let ending = tokio::select! {
                _ = serve => Ending::Exit(BackendExit::Exited(Some(0))),
                _ = &mut kill_rx => Ending::Exit(BackendExit::Killed),
                Ok(()) = crash_rx => Ending::Exit(BackendExit::Exited(Some(137))),
                Ok(()) = sever_rx => Ending::Severed,
            };
            let exit = match ending {
                Ending::Exit(exit) => exit,
                Ending::Severed => {
                    let _ = std::fs::remove_file(&socket);
                    let _ = kill_rx.await;
                    BackendExit::Killed
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(BackendChild::new(
            Some(4_000_000 + instance as u32),
            kill_tx,
            exited,
        ))
    }
}

fn backend_app(instance: usize, folder: PathBuf) -> Router {
    Router::new().fallback(move |req: Request<Body>| {
        let folder = folder.clone();
        async move {
            axum::Json(json!({
                "instance": instance,
                "folder": folder,
                "path": req.uri().to_string(),
            }))
        }
    })
}

pub struct Harness {
    pub dir: TempDir,
    pub launcher: FakeLauncher,
    pub registry: Arc<WorkspaceRegistry>,
}

impl Harness {
    pub fn new(launcher: FakeLauncher) -> Self {
        Self::with_probe(launcher, ProbePolicy::default())
    }

    pub fn with_probe(launcher: FakeLauncher, probe: ProbePolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new(
            RegistryConfig {
                socket_dir: dir.path().join("s"),
                probe,
                adopt_poll_interval: Duration::from_millis(50),
            },
            Arc::new(launcher.clone()),
            StateStore::new(dir.path().join("state.json")),
        );
        Self {
            dir,
            launcher,
            registry,
        }
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.dir.path().join("s")
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.dir.path().join("state.json"))
    }
}

/// Poll `check` until it yields true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
