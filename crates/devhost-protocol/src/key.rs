//! Workspace keys: the reversible identity of a workspace folder.
//!
//! A key is the URL-safe, unpadded base64 encoding of the folder's raw path
//! bytes. It is safe to embed in a file name and in a cookie value, and it
//! decodes back to exactly the path it was built from. Backend socket file
//! names are a pure function of the key, so a restarted router recomputes
//! the same socket path without consulting any stored state.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// File name prefix shared by every backend socket.
pub const SOCKET_PREFIX: &str = "code-server-";
/// File name suffix of the backend's HTTP socket.
pub const SOCKET_SUFFIX: &str = ".sock";
/// File name suffix of the backend's optional control socket.
pub const CONTROL_SOCKET_SUFFIX: &str = ".ctl.sock";

/// Identity of a workspace, derived deterministically from its folder path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspaceKey(String);

impl WorkspaceKey {
    /// Derive the key for a folder. Identical paths always yield identical keys.
    pub fn from_path(path: &Path) -> Result<Self, KeyError> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Validate a key received from the outside (cookie, snapshot, file name).
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        if raw.is_empty() {
            return Err(KeyError::Empty);
        }
        let decoded = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        if decoded.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(raw.to_string()))
    }

    /// Decode the folder path this key was built from.
    pub fn to_path(&self) -> PathBuf {
        // Keys are only constructed from valid encodings.
        let bytes = URL_SAFE_NO_PAD.decode(&self.0).unwrap_or_default();
        PathBuf::from(OsString::from_vec(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<dir>/code-server-<key>.sock`
    pub fn socket_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{SOCKET_PREFIX}{}{SOCKET_SUFFIX}", self.0))
    }

    /// `<dir>/code-server-<key>.ctl.sock`
    pub fn control_socket_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{SOCKET_PREFIX}{}{CONTROL_SOCKET_SUFFIX}", self.0))
    }

    /// Recover the key from a backend socket file name, if it is one.
    ///
    /// Control sockets are not matched; only the primary HTTP socket name is.
    pub fn from_socket_file_name(name: &str) -> Option<Self> {
        if name.ends_with(CONTROL_SOCKET_SUFFIX) {
            return None;
        }
        let inner = name.strip_prefix(SOCKET_PREFIX)?.strip_suffix(SOCKET_SUFFIX)?;
        Self::parse(inner).ok()
    }

    /// Recover the key from a control socket file name, if it is one.
    pub fn from_control_socket_file_name(name: &str) -> Option<Self> {
        let inner = name
            .strip_prefix(SOCKET_PREFIX)?
            .strip_suffix(CONTROL_SOCKET_SUFFIX)?;
        Self::parse(inner).ok()
    }

    /// Recover the key from either kind of backend socket path.
    pub fn from_any_socket_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Self::from_socket_file_name(name).or_else(|| Self::from_control_socket_file_name(name))
    }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WorkspaceKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WorkspaceKey> for String {
    fn from(key: WorkspaceKey) -> Self {
        key.0
    }
}
