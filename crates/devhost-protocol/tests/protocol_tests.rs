//! Protocol layer tests: workspace keys, snapshot format, open-file payload.

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    use devhost_protocol::*;
    use serde_json::json;

    // ─────────────────────────────────────────────────────────────────────
    // WorkspaceKey
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn key_decodes_to_original_path() {
        for raw in ["/home/u/proj", "/", "relative/dir", "/tmp/with space/ünïcode", "/a/b/"] {
            let path = Path::new(raw);
            let key = WorkspaceKey::from_path(path).unwrap();
            assert_eq!(key.to_path(), path, "roundtrip failed for {raw}");
        }
    }

    #[test]
    fn key_roundtrips_non_utf8_paths() {
        let path = Path::new(OsStr::from_bytes(b"/srv/\xff\xfe/data"));
        let key = WorkspaceKey::from_path(path).unwrap();
        assert_eq!(key.to_path(), path);
    }

    #[test]
    fn key_is_deterministic() {
        let a = WorkspaceKey::from_path(Path::new("/home/u/proj")).unwrap();
        let b = WorkspaceKey::from_path(&PathBuf::from("/home/u/proj")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.socket_path(Path::new("/tmp")), b.socket_path(Path::new("/tmp")));
    }

    #[test]
    fn distinct_paths_get_distinct_keys() {
        let a = WorkspaceKey::from_path(Path::new("/home/u/a")).unwrap();
        let b = WorkspaceKey::from_path(Path::new("/home/u/b")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_path_has_no_key() {
        assert_eq!(WorkspaceKey::from_path(Path::new("")), Err(KeyError::Empty));
        assert_eq!(WorkspaceKey::parse(""), Err(KeyError::Empty));
    }

    #[test]
    fn parse_rejects_invalid_encoding() {
        assert!(matches!(WorkspaceKey::parse("not base64!"), Err(KeyError::Encoding(_))));
        assert!(matches!(WorkspaceKey::parse("a/b"), Err(KeyError::Encoding(_))));
    }

    #[test]
    fn parse_accepts_what_from_path_produces() {
        let key = WorkspaceKey::from_path(Path::new("/home/u/proj")).unwrap();
        assert_eq!(WorkspaceKey::parse(key.as_str()).unwrap(), key);
    }

    #[test]
    fn socket_path_follows_naming_convention() {
        let key = WorkspaceKey::from_path(Path::new("/home/u/proj")).unwrap();
        let sock = key.socket_path(Path::new("/tmp"));
        assert_eq!(sock, PathBuf::from(format!("/tmp/code-server-{key}.sock")));
        let ctl = key.control_socket_path(Path::new("/tmp"));
        assert_eq!(ctl, PathBuf::from(format!("/tmp/code-server-{key}.ctl.sock")));
    }

    #[test]
    fn socket_file_name_parsing_ignores_unrelated_files() {
        assert!(WorkspaceKey::from_socket_file_name("devhost-state.json").is_none());
        assert!(WorkspaceKey::from_socket_file_name("code-server-.sock").is_none());
        assert!(WorkspaceKey::from_socket_file_name("code-server-!!.sock").is_none());
    }

    #[test]
    fn key_serializes_as_plain_string() {
        let key = WorkspaceKey::from_path(Path::new("/p")).unwrap();
        let value = serde_json::to_value(&key).unwrap();
        assert_eq!(value, json!(key.as_str()));
        assert!(serde_json::from_value::<WorkspaceKey>(json!("%%%")).is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // PersistedSnapshot
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn snapshot_uses_camel_case_fields() {
        let key = WorkspaceKey::from_path(Path::new("/home/u/proj")).unwrap();
        let mut snapshot = PersistedSnapshot::empty();
        snapshot.workspaces.insert(
            key.clone(),
            WorkspaceDescriptor {
                path: "/home/u/proj".into(),
                socket_path: key.socket_path(Path::new("/tmp")),
                control_socket_path: None,
                pid: Some(4242),
            },
        );

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["version"], 1);
        let entry = &value["workspaces"][key.as_str()];
        assert_eq!(entry["path"], "/home/u/proj");
        assert_eq!(entry["pid"], 4242);
        assert!(entry["socketPath"].as_str().unwrap().ends_with(".sock"));
        assert!(entry.get("controlSocketPath").is_none());

        let parsed: PersistedSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.workspaces, snapshot.workspaces);
    }

    #[test]
    fn snapshot_tolerates_missing_optional_fields() {
        let key = WorkspaceKey::from_path(Path::new("/x")).unwrap();
        let parsed: PersistedSnapshot = serde_json::from_value(json!({
            "workspaces": {
                key.as_str(): { "path": "/x", "socketPath": "/tmp/s.sock" }
            }
        }))
        .unwrap();
        assert_eq!(parsed.version, SNAPSHOT_VERSION);
        assert!(parsed.saved_at.is_none());
        assert_eq!(parsed.workspaces[&key].pid, None);
    }

    #[test]
    fn snapshot_rejects_invalid_keys() {
        let result: Result<PersistedSnapshot, _> = serde_json::from_value(json!({
            "workspaces": { "***": { "path": "/x", "socketPath": "/tmp/s.sock" } }
        }));
        assert!(result.is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Open-file command
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn open_command_payload_shape() {
        let request = OpenFileRequest {
            file: "/home/u/proj/src/main.rs".into(),
            line: 12,
            column: 4,
        };
        let value = serde_json::to_value(EditorOpenCommand::open_at(&request)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "open",
                "folderURIs": [],
                "fileURIs": ["/home/u/proj/src/main.rs:12:4"],
                "forceReuseWindow": true,
                "gotoLineMode": true,
            })
        );
    }

    #[test]
    fn open_request_defaults_line_and_column() {
        let request: OpenFileRequest =
            serde_json::from_value(json!({ "file": "/a/b.rs" })).unwrap();
        assert_eq!(request.line, 1);
        assert_eq!(request.column, 1);
    }
}
