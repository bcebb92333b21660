//! Workspace backends: one isolated editor-server process per folder.
//!
//! The registry owns every backend's lifecycle: spawning through a
//! [`Launcher`], probing its socket until it accepts connections, watching
//! for exit, tearing it down, persisting a snapshot after each mutation, and
//! re-adopting surviving backends when the router restarts.

pub mod control;
pub mod error;
pub mod launcher;
pub mod probe;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod state;

pub use error::{ControlError, StateError, WorkspaceError};
pub use launcher::{BackendChild, BackendExit, CommandLauncher, LaunchSpec, Launcher};
pub use probe::{ProbePolicy, Readiness};
pub use process::{Lifecycle, WorkspaceProcess, WorkspaceSummary};
pub use reconcile::{DiscardReason, ReconcileReport, sweep_orphan_sockets};
pub use control::send_open_file;
pub use registry::{MAX_SOCKET_PATH, RegistryConfig, WorkspaceRegistry};
pub use state::StateStore;
