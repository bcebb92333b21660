//! ProxyRouter: maps each request to a workspace and proxies it there.
//!
//! Resolution order: an explicit `?folder=` wins and (re)binds the session
//! cookie; otherwise the session cookie decides; with neither the request
//! is rejected with `400`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use devhost_protocol::{FOLDER_PARAM, SESSION_COOKIE, WorkspaceKey};
use devhost_workspace::WorkspaceRegistry;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::proxy::{ProxyOutcome, forward};

#[derive(Debug, Deserialize)]
struct FolderQuery {
    folder: Option<String>,
}

/// How the workspace for a request was determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// From `?folder=`; the session cookie is rewritten to this key.
    Explicit(WorkspaceKey),
    /// From the session cookie.
    Session(WorkspaceKey),
}

impl Resolution {
    pub fn key(&self) -> &WorkspaceKey {
        match self {
            Resolution::Explicit(key) | Resolution::Session(key) => key,
        }
    }
}

#[derive(Clone)]
pub struct ProxyRouter {
    registry: Arc<WorkspaceRegistry>,
    secure_cookies: bool,
}

impl ProxyRouter {
    pub fn new(registry: Arc<WorkspaceRegistry>, secure_cookies: bool) -> Self {
        Self {
            registry,
            secure_cookies,
        }
    }

    /// Every path goes through [`ProxyRouter::handle`].
    pub fn into_router(self) -> Router {
        Router::new().fallback(proxy_handler).with_state(self)
    }

    pub async fn handle(&self, jar: CookieJar, request: Request) -> Response {
        let resolution = match resolve(request.uri(), &jar).await {
            Ok(resolution) => resolution,
            Err(rejection) => return rejection.into_response(),
        };

        let response = self.proxy(resolution.key(), request).await;
        match resolution {
            Resolution::Explicit(key) => (jar.add(self.session_cookie(&key)), response).into_response(),
            Resolution::Session(_) => response,
        }
    }

    fn session_cookie(&self, key: &WorkspaceKey) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, key.to_string()))
            .path("/")
            .http_only(true)
            .secure(self.secure_cookies)
            .same_site(SameSite::Lax)
            .build()
    }

    /// Proxy to the workspace, respawning it once if its socket cannot be dialed.
    async fn proxy(&self, key: &WorkspaceKey, request: Request) -> Response {
        let process = match self.registry.get_or_create(key).await {
            Ok(process) => process,
            Err(e) => return unavailable(key, &e),
        };

        let (request, dial_error) = match forward(process.socket_path(), request).await {
            ProxyOutcome::Success(response) => {
                self.registry.mark_reachable(&process).await;
                return response;
            }
            ProxyOutcome::UpstreamError(e) => return bad_gateway(&e),
            ProxyOutcome::DialFailure { request, error } => (request, error),
        };

        warn!(
            "Backend for {} unreachable ({dial_error}); respawning",
            process.folder().display()
        );
        self.registry.invalidate(&process).await;
        let process = match self.registry.get_or_create(key).await {
            Ok(process) => process,
            Err(e) => return unavailable(key, &e),
        };

        match forward(process.socket_path(), request).await {
            ProxyOutcome::Success(response) => {
                self.registry.mark_reachable(&process).await;
                info!("Workspace {} recovered after respawn", process.folder().display());
                response
            }
            ProxyOutcome::DialFailure { error, .. } => bad_gateway(&error),
            ProxyOutcome::UpstreamError(e) => bad_gateway(&e),
        }
    }
}

async fn proxy_handler(State(router): State<ProxyRouter>, jar: CookieJar, request: Request) -> Response {
    router.handle(jar, request).await
}

/// Why a request could not be tied to a workspace.
#[derive(Debug)]
pub struct Rejection(&'static str);

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.0).into_response()
    }
}

/// Resolve the workspace for a request from its URI and cookies.
pub async fn resolve(uri: &Uri, jar: &CookieJar) -> Result<Resolution, Rejection> {
    let query = Query::<FolderQuery>::try_from_uri(uri)
        .map_err(|_| Rejection("malformed query string"))?;
    if let Some(folder) = query.0.folder.filter(|f| !f.is_empty()) {
        let folder = workspace_folder(Path::new(&folder))
            .await
            .ok_or(Rejection("folder must be an absolute path"))?;
        let key = WorkspaceKey::from_path(&folder).map_err(|_| Rejection("invalid folder"))?;
        debug!("Resolved workspace {} from ?{FOLDER_PARAM}", folder.display());
        return Ok(Resolution::Explicit(key));
    }

    match jar.get(SESSION_COOKIE) {
        Some(cookie) => WorkspaceKey::parse(cookie.value())
            .map(Resolution::Session)
            .map_err(|_| Rejection("invalid workspace session cookie")),
        None => Err(Rejection("no workspace selected: pass ?folder=<path>")),
    }
}

/// Canonical form of a client-supplied folder; the literal path when it
/// does not exist. Relative paths that do not exist are rejected.
pub async fn workspace_folder(folder: &Path) -> Option<PathBuf> {
    match tokio::fs::canonicalize(folder).await {
        Ok(canonical) => Some(canonical),
        Err(_) if folder.is_absolute() => Some(folder.to_path_buf()),
        Err(_) => None,
    }
}

fn unavailable(key: &WorkspaceKey, e: &dyn std::error::Error) -> Response {
    error!("Cannot start workspace {}: {e}", key.to_path().display());
    (StatusCode::SERVICE_UNAVAILABLE, format!("workspace unavailable: {e}")).into_response()
}

fn bad_gateway(e: &dyn std::error::Error) -> Response {
    warn!("Proxy failed: {e}");
    (StatusCode::BAD_GATEWAY, format!("backend error: {e}")).into_response()
}
