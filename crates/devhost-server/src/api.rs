//! Control-plane routes served on non-editor hosts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use devhost_protocol::{OpenFileRequest, WorkspaceKey};
use devhost_workspace::{WorkspaceRegistry, send_open_file};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::app::ServerConfig;
use crate::proxy::strip_hop_by_hop;
use crate::router::workspace_folder;

#[derive(Clone)]
struct ApiState {
    registry: Arc<WorkspaceRegistry>,
    config: Arc<ServerConfig>,
    frontend: Client<HttpConnector, Body>,
}

#[derive(Debug, Deserialize)]
struct FolderQuery {
    folder: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AliasQuery {
    alias: String,
}

/// Build the control-plane router.
pub fn router(registry: Arc<WorkspaceRegistry>, config: Arc<ServerConfig>) -> Router {
    let state = ApiState {
        registry,
        config,
        frontend: Client::builder(TokioExecutor::new()).build_http(),
    };

    Router::new()
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/workspace", delete(delete_workspace))
        .route("/api/open-file", post(open_file))
        .route("/workspace", get(redirect_to_workspace))
        .fallback(frontend)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn workspace_paths(registry: &WorkspaceRegistry) -> Json<serde_json::Value> {
    let paths: Vec<PathBuf> = registry.list().await.into_iter().map(|s| s.path).collect();
    Json(json!({ "workspaces": paths }))
}

async fn list_workspaces(State(state): State<ApiState>) -> Json<serde_json::Value> {
    workspace_paths(&state.registry).await
}

async fn delete_workspace(
    State(state): State<ApiState>,
    Query(query): Query<FolderQuery>,
) -> Response {
    let Some(folder) = query.folder.filter(|f| !f.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing folder").into_response();
    };
    let Some(folder) = workspace_folder(Path::new(&folder)).await else {
        return (StatusCode::BAD_REQUEST, "folder must be an absolute path").into_response();
    };
    let Ok(key) = WorkspaceKey::from_path(&folder) else {
        return (StatusCode::BAD_REQUEST, "invalid folder").into_response();
    };

    if state.registry.delete(&key).await {
        info!("Deleted workspace {} via API", folder.display());
    }
    workspace_paths(&state.registry).await.into_response()
}

async fn open_file(State(state): State<ApiState>, Json(request): Json<OpenFileRequest>) -> Response {
    let Some(process) = state.registry.workspace_for_file(&request.file).await else {
        return (StatusCode::NOT_FOUND, "no workspace contains this file").into_response();
    };
    let Some(control) = process.control_socket_path() else {
        return (StatusCode::CONFLICT, "workspace has no control socket").into_response();
    };

    match send_open_file(control, &request).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("Open-file for {} failed: {e}", request.file.display());
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn redirect_to_workspace(
    State(state): State<ApiState>,
    Query(query): Query<AliasQuery>,
) -> Response {
    let folder = state.config.home_dir.join(&query.alias);
    let folder = folder.to_string_lossy();
    let Ok(encoded) = serde_urlencoded::to_string([("folder", folder.as_ref())]) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let target = format!("{}/?{encoded}", state.config.public_origin.trim_end_matches('/'));
    debug!("Redirecting alias {} to {target}", query.alias);
    Redirect::temporary(&target).into_response()
}

/// Anything else goes to the external frontend, when one is configured.
async fn frontend(State(state): State<ApiState>, mut request: Request) -> Response {
    let Some(base) = state.config.frontend_url.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("{}{path_and_query}", base.trim_end_matches('/'));
    let uri: Uri = match target.parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!("Invalid frontend URL {target}: {e}");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    strip_hop_by_hop(request.headers_mut());
    if let Some(authority) = uri.authority()
        && let Ok(host) = authority.as_str().parse()
    {
        request.headers_mut().insert(header::HOST, host);
    }
    *request.uri_mut() = uri;

    match state.frontend.request(request).await {
        Ok(response) => response.map(Body::new),
        Err(e) => {
            warn!("Frontend request to {target} failed: {e}");
            (StatusCode::BAD_GATEWAY, "frontend unavailable").into_response()
        }
    }
}
