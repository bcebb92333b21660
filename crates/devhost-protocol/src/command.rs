//! Open-file command: the only message the router sends to a backend
//! outside of proxied traffic.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Control-plane request body for `POST /api/open-file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFileRequest {
    pub file: PathBuf,
    #[serde(default = "first")]
    pub line: u32,
    #[serde(default = "first")]
    pub column: u32,
}

fn first() -> u32 {
    1
}

/// JSON payload posted to the editor's control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorOpenCommand {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "folderURIs")]
    pub folder_uris: Vec<String>,
    #[serde(rename = "fileURIs")]
    pub file_uris: Vec<String>,
    pub force_reuse_window: bool,
    pub goto_line_mode: bool,
}

impl EditorOpenCommand {
    /// Open `file` at `line:column`, reusing the current window.
    pub fn open_at(request: &OpenFileRequest) -> Self {
        Self {
            kind: "open".into(),
            folder_uris: Vec::new(),
            file_uris: vec![format!(
                "{}:{}:{}",
                request.file.display(),
                request.line,
                request.column
            )],
            force_reuse_window: true,
            goto_line_mode: true,
        }
    }
}
