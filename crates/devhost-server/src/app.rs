//! Application assembly: host-based dispatch between the editor proxy and
//! the control plane, plus the shared middleware stack.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::http::header;
use axum::response::Response;
use devhost_workspace::WorkspaceRegistry;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::router::ProxyRouter;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Requests for this host (port ignored) go to the workspace proxy.
    /// `None` sends every request there.
    pub editor_host: Option<String>,
    /// Upstream for non-API paths on other hosts.
    pub frontend_url: Option<String>,
    /// Public origin of the editor host, used for alias redirects.
    pub public_origin: String,
    /// Mark the session cookie `Secure`.
    pub secure_cookies: bool,
    /// Base directory for `/workspace?alias=` redirects.
    pub home_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            editor_host: Some("dev.localhost".into()),
            frontend_url: None,
            public_origin: "https://dev.localhost:12345".into(),
            secure_cookies: true,
            home_dir: PathBuf::from("/"),
        }
    }
}

/// Build the full application router.
pub fn build_app(registry: Arc<WorkspaceRegistry>, config: ServerConfig) -> Router {
    let config = Arc::new(config);
    let editor = ProxyRouter::new(registry.clone(), config.secure_cookies).into_router();

    let app = match config.editor_host.clone() {
        None => editor,
        Some(editor_host) => {
            let control = api::router(registry, config.clone());
            Router::new().fallback(move |request: Request| {
                let editor = editor.clone();
                let control = control.clone();
                let to_editor = request_host(&request)
                    .is_some_and(|host| host.eq_ignore_ascii_case(&editor_host));
                async move {
                    let target = if to_editor { editor } else { control };
                    into_response(target.oneshot(request).await)
                }
            })
        }
    };

    app.layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

fn into_response(result: Result<Response, std::convert::Infallible>) -> Response {
    match result {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// The request's host without any port.
fn request_host(request: &Request) -> Option<&str> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().host())?;
    Some(strip_port(raw))
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return authority
            .find(']')
            .map(|end| &authority[..=end])
            .unwrap_or(authority);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ports() {
        assert_eq!(strip_port("dev.localhost:12345"), "dev.localhost");
        assert_eq!(strip_port("dev.localhost"), "dev.localhost");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("127.0.0.1:1"), "127.0.0.1");
    }
}
