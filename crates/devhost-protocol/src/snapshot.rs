//! On-disk snapshot of the workspace registry.
//!
//! Written wholesale after every registry mutation and read once at
//! startup, where each descriptor is either re-admitted or discarded.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::WorkspaceKey;

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to find a running backend again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDescriptor {
    pub path: PathBuf,
    pub socket_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_socket_path: Option<PathBuf>,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workspaces: BTreeMap<WorkspaceKey, WorkspaceDescriptor>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl PersistedSnapshot {
    pub fn new(workspaces: BTreeMap<WorkspaceKey, WorkspaceDescriptor>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Some(Utc::now()),
            workspaces,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}

impl Default for PersistedSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
