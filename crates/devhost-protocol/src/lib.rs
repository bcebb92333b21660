//! devhost protocol types
//!
//! Shared vocabulary for the session router: how a workspace folder maps to
//! a key, how that key maps to backend socket files, what the persisted
//! registry snapshot looks like, and the payload of the editor "open file"
//! command. This crate is the single source of truth for those formats.

pub mod command;
pub mod error;
pub mod key;
pub mod snapshot;

pub use command::{OpenFileRequest, EditorOpenCommand};
pub use error::KeyError;
pub use key::{WorkspaceKey, SOCKET_PREFIX, SOCKET_SUFFIX, CONTROL_SOCKET_SUFFIX};
pub use snapshot::{PersistedSnapshot, WorkspaceDescriptor, SNAPSHOT_VERSION};

/// Name of the cookie that binds a browser session to a workspace key.
pub const SESSION_COOKIE: &str = "workspace-key";

/// Query parameter that selects a workspace explicitly.
pub const FOLDER_PARAM: &str = "folder";

/// Default file name of the persisted registry snapshot (inside the temp dir).
pub const STATE_FILE_NAME: &str = "devhost-state.json";
