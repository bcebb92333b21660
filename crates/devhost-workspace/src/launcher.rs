//! Launching backends and watching them until they exit.
//!
//! A [`Launcher`] turns a [`LaunchSpec`] into a running backend and hands
//! back a [`BackendChild`]: the backend's PID, a way to request a kill, and
//! a one-shot notification of its exit. The registry never touches OS
//! process handles directly.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use devhost_protocol::WorkspaceKey;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::WorkspaceError;
use crate::reconcile::{kill_pid, pid_alive};

/// Everything a launcher needs to start one workspace backend.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub key: &'a WorkspaceKey,
    pub folder: &'a Path,
    pub socket_path: &'a Path,
    pub control_socket_path: Option<&'a Path>,
}

/// How a backend left the `Ready` world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendExit {
    /// The process exited on its own (exit code, if any).
    Exited(Option<i32>),
    /// The process was killed at the registry's request.
    Killed,
    /// The watcher lost track of the process.
    Lost,
}

/// Handle to a launched backend.
#[derive(Debug)]
pub struct BackendChild {
    pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
    exited: oneshot::Receiver<BackendExit>,
}

impl BackendChild {
    /// Assemble a handle from its parts. The launcher must kill the backend
    /// when `kill_tx` fires and report on `exited` once it is gone.
    pub fn new(
        pid: Option<u32>,
        kill_tx: oneshot::Sender<()>,
        exited: oneshot::Receiver<BackendExit>,
    ) -> Self {
        Self { pid, kill_tx, exited }
    }

    /// Watch a child process spawned by this router.
    pub fn spawn(mut child: Child) -> Self {
        let pid = child.id();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exited) = oneshot::channel();

        tokio::spawn(async move {
            let mut killable = true;
            let exit = loop {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => BackendExit::Exited(status.code()),
                            Err(e) => {
                                warn!("Lost track of backend {pid:?}: {e}");
                                BackendExit::Lost
                            }
                        };
                    }
                    request = &mut kill_rx, if killable => match request {
                        Ok(()) => {
                            if let Err(e) = child.kill().await {
                                warn!("Failed to kill backend {pid:?}: {e}");
                            }
                            break BackendExit::Killed;
                        }
                        // Handle dropped: keep waiting, nobody can kill us any more.
                        Err(_) => killable = false,
                    },
                }
            };
            debug!("Backend {pid:?} gone: {exit:?}");
            let _ = exit_tx.send(exit);
        });

        Self::new(pid, kill_tx, exited)
    }

    /// Watch a process this router did not spawn (re-adopted after restart).
    ///
    /// Non-child processes cannot be waited on, so liveness is polled.
    pub fn adopt(pid: u32, poll_interval: Duration) -> Self {
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exited) = oneshot::channel();

        tokio::spawn(async move {
            let mut killable = true;
            let exit = loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {
                        if !pid_alive(pid) {
                            break BackendExit::Exited(None);
                        }
                    }
                    request = &mut kill_rx, if killable => match request {
                        Ok(()) => {
                            kill_pid(pid);
                            break BackendExit::Killed;
                        }
                        Err(_) => killable = false,
                    },
                }
            };
            debug!("Adopted backend {pid} gone: {exit:?}");
            let _ = exit_tx.send(exit);
        });

        Self::new(Some(pid), kill_tx, exited)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn into_parts(
        self,
    ) -> (Option<u32>, oneshot::Sender<()>, oneshot::Receiver<BackendExit>) {
        (self.pid, self.kill_tx, self.exited)
    }
}

/// Starts workspace backends.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<BackendChild, WorkspaceError>;

    /// Whether backends get a control socket for out-of-band commands.
    fn wants_control_socket(&self) -> bool {
        false
    }
}

/// Launches an external program, expanding `{socket}`, `{folder}`, `{key}`
/// and `{control}` in its argument templates.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `code-server --socket {socket} {folder}`
    pub fn code_server() -> Self {
        Self::new(
            "code-server",
            vec!["--socket".into(), "{socket}".into(), "{folder}".into()],
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Expand one argument template. Whole-token placeholders keep the raw
    /// path bytes; embedded placeholders go through lossy UTF-8.
    fn expand(template: &str, spec: &LaunchSpec<'_>) -> OsString {
        let control = spec.control_socket_path.unwrap_or(Path::new(""));
        match template {
            "{socket}" => return spec.socket_path.as_os_str().to_owned(),
            "{folder}" => return spec.folder.as_os_str().to_owned(),
            "{control}" => return control.as_os_str().to_owned(),
            _ => {}
        }
        template
            .replace("{socket}", &spec.socket_path.to_string_lossy())
            .replace("{folder}", &spec.folder.to_string_lossy())
            .replace("{control}", &control.to_string_lossy())
            .replace("{key}", spec.key.as_str())
            .into()
    }

    pub fn command_line(&self, spec: &LaunchSpec<'_>) -> Vec<OsString> {
        self.args.iter().map(|arg| Self::expand(arg, spec)).collect()
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> Result<BackendChild, WorkspaceError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.command_line(spec))
            .env("DEVHOST_SOCKET", spec.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Own process group: Ctrl+C on the router must not take backends
            // down, they are re-adopted on the next start.
            .process_group(0)
            .kill_on_drop(false);
        if let Some(control) = spec.control_socket_path {
            command.env("DEVHOST_CONTROL_SOCKET", control);
        }

        let child = command.spawn().map_err(|source| WorkspaceError::Launch {
            program: self.program.clone(),
            source,
        })?;
        Ok(BackendChild::spawn(child))
    }

    fn wants_control_socket(&self) -> bool {
        self.args.iter().any(|arg| arg.contains("{control}"))
    }
}
