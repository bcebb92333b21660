//! On-disk snapshot storage.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use devhost_protocol::PersistedSnapshot;
use tracing::debug;

use crate::error::StateError;

/// Reads and rewrites the registry snapshot file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<temp dir>/devhost-state.json`
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(devhost_protocol::STATE_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file is an empty snapshot.
    pub fn load(&self) -> Result<PersistedSnapshot, StateError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PersistedSnapshot::empty()),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&data).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the snapshot file wholesale.
    ///
    /// Written to a sibling temp file and renamed into place so readers never
    /// observe a partial document.
    pub fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;

        debug!(
            "Saved {} workspace(s) to {}",
            snapshot.workspaces.len(),
            self.path.display()
        );
        Ok(())
    }
}
