//! Shared fixtures: fake editor backends and a running application.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Request};
use axum::routing::{any, post};
use devhost_server::{ServerConfig, build_app};
use devhost_transport::{TransportConfig, TransportServer, TunnelTarget};
use devhost_workspace::{
    BackendChild, BackendExit, LaunchSpec, Launcher, ProbePolicy, RegistryConfig, StateStore,
    WorkspaceError, WorkspaceRegistry,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::oneshot;

#[derive(Default)]
struct Inner {
    spawns: AtomicUsize,
    hang_up: AtomicBool,
    control: AtomicBool,
    severs: Mutex<HashMap<usize, oneshot::Sender<()>>>,
    crashes: Mutex<HashMap<usize, oneshot::Sender<()>>>,
    commands: Mutex<Vec<Value>>,
}

/// In-process editor backends bound to the requested unix sockets.
///
/// `GET /ws` echoes WebSocket messages; every other request gets JSON
/// describing the instance and what it received.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    inner: Arc<Inner>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends accept connections and close them without answering.
    pub fn hanging_up() -> Self {
        let launcher = Self::default();
        launcher.inner.hang_up.store(true, Ordering::SeqCst);
        launcher
    }

    /// Backends also serve a control socket that records commands.
    pub fn with_control() -> Self {
        let launcher = Self::default();
        launcher.inner.control.store(true, Ordering::SeqCst);
        launcher
    }

    pub fn spawns(&self) -> usize {
        self.inner.spawns.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Value> {
        self.inner.commands.lock().clone()
    }

    /// Stop serving and remove the socket without reporting an exit.
    pub fn sever(&self, instance: usize) {
        if let Some(tx) = self.inner.severs.lock().remove(&instance) {
            let _ = tx.send(());
        }
    }

    /// Exit as if the process died.
    pub fn crash(&self, instance: usize) {
        if let Some(tx) = self.inner.crashes.lock().remove(&instance) {
            let _ = tx.send(());
        }
    }
}

enum Ending {
    Exit(BackendExit),
    Severed,
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<BackendChild, WorkspaceError> {
        let instance = self.inner.spawns.fetch_add(1, Ordering::SeqCst) + 1;
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exited) = oneshot::channel();
        let (sever_tx, sever_rx) = oneshot::channel::<()>();
        let (crash_tx, crash_rx) = oneshot::channel::<()>();
        self.inner.severs.lock().insert(instance, sever_tx);
        self.inner.crashes.lock().insert(instance, crash_tx);

        let socket = spec.socket_path.to_path_buf();
        let listener = UnixListener::bind(&socket).unwrap();
        let control = spec
            .control_socket_path
            .map(|path| UnixListener::bind(path).unwrap());
        let folder = spec.folder.to_path_buf();
        let hang_up = self.inner.hang_up.load(Ordering::SeqCst);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let serve = async move {
                if let Some(control) = control {
                    tokio::spawn(axum::serve(control, control_app(inner)).into_future());
                }
                if !hang_up {
                    let _ = axum::serve(listener, backend_app(instance, folder)).await;
                    return;
                }
                loop {
                    if let Ok((stream, _)) = listener.accept().await {
                        drop(stream);
                    }
                }
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

        Ok(BackendChild::new(None, kill_tx, exited))
    }

    fn wants_control_socket(&self) -> bool {
        self.inner.control.load(Ordering::SeqCst)
    }
}

fn backend_app(instance: usize, folder: PathBuf) -> Router {
    Router::new()
        .route("/ws", any(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo) }))
        .fallback(move |headers: HeaderMap, req: Request<Body>| {
            let folder = folder.clone();
            async move {
                let header = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                axum::Json(json!({
                    "instance": instance,
                    "folder": folder,
                    "path": req.uri().to_string(),
                    "host": header("host"),
                    "forwardedProto": header("x-forwarded-proto"),
                    "forwardedFor": header("x-forwarded-for"),
                    "cookie": header("cookie"),
                }))
            }
        })
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

fn control_app(inner: Arc<Inner>) -> Router {
    Router::new().route(
        "/",
        post(move |axum::Json(command): axum::Json<Value>| {
            let inner = inner.clone();
            async move {
                inner.commands.lock().push(command);
                "ok"
            }
        }),
    )
}

pub struct Harness {
    pub dir: TempDir,
    pub launcher: FakeLauncher,
    pub registry: Arc<WorkspaceRegistry>,
    pub server: TransportServer,
    pub base: String,
}

pub fn test_config(editor_host: Option<&str>) -> ServerConfig {
    ServerConfig {
        editor_host: editor_host.map(str::to_string),
        frontend_url: None,
        public_origin: "https://dev.localhost:12345".into(),
        secure_cookies: false,
        home_dir: PathBuf::from("/home/u"),
    }
}

pub async fn start(launcher: FakeLauncher, editor_host: Option<&str>) -> Harness {
    start_with(launcher, test_config(editor_host)).await
}

pub async fn start_with(launcher: FakeLauncher, config: ServerConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let registry = WorkspaceRegistry::new(
        RegistryConfig {
            socket_dir: dir.path().join("s"),
            probe: ProbePolicy {
                initial_backoff: Duration::from_millis(10),
                deadline: Duration::from_secs(2),
            },
            adopt_poll_interval: Duration::from_millis(50),
        },
        Arc::new(launcher.clone()),
        StateStore::new(dir.path().join("state.json")),
    );

    let server = TransportServer::start(
        TransportConfig {
            hostname: "127.0.0.1".into(),
            port: 0,
            tls: None,
            tunnel_target: TunnelTarget::Loopback,
            sniff_timeout: Duration::from_secs(2),
        },
        build_app(registry.clone(), config),
    )
    .await
    .unwrap();
    let base = format!("http://127.0.0.1:{}", server.port());

    Harness {
        dir,
        launcher,
        registry,
        server,
        base,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// `name=value` of the session cookie set by `response`, if any.
pub fn session_cookie(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("workspace-key="))
        .map(|v| v.split(';').next().unwrap_or_default().to_string())
}
