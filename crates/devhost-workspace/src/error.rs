//! Error types for backend lifecycle, persisted state, and control commands.

use std::io;
use std::path::PathBuf;

use devhost_protocol::KeyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid workspace key: {0}")]
    Key(#[from] KeyError),

    #[error("socket path {path} is {len} bytes, over the {max}-byte unix socket limit")]
    SocketPathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("failed to launch backend `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare socket {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A leftover socket could not be removed; new backends would collide with it.
    #[error("cannot remove stale socket {path}: {source}")]
    StaleSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("cannot reach control socket {path}: {source}")]
    Dial {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("control request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build control request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("failed to encode control command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("backend rejected control command with status {status}: {body}")]
    Status { status: u16, body: String },
}
