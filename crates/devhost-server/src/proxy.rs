//! Reverse proxy over a backend's unix socket.
//!
//! [`forward`] reports its result as a [`ProxyOutcome`] so callers can tell
//! "the backend is not there" (retryable, the request comes back untouched)
//! apart from "the backend misbehaved" (not retryable).

use std::io;
use std::path::Path;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use devhost_transport::{ConnectionInfo, splice};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP handshake with backend failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("backend request failed: {0}")]
    Request(#[source] hyper::Error),
}

pub enum ProxyOutcome {
    Success(Response),
    /// The socket could not be dialed. The request was not sent and is
    /// handed back for a retry.
    DialFailure { request: Request, error: io::Error },
    UpstreamError(UpstreamError),
}

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Send `request` to the HTTP server listening on `socket_path`.
///
/// The original `Host` header is kept so the backend generates links for
/// the public origin. HTTP upgrades (WebSockets) are spliced through.
pub async fn forward(socket_path: &Path, mut request: Request) -> ProxyOutcome {
    let stream = match UnixStream::connect(socket_path).await {
        Ok(stream) => stream,
        Err(error) => return ProxyOutcome::DialFailure { request, error },
    };

    let upgrade = upgrade_protocol(request.headers());
    let client_upgrade = match upgrade {
        Some(_) => request.extensions_mut().remove::<OnUpgrade>(),
        None => None,
    };
    prepare_request(&mut request, upgrade);

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
        Ok(parts) => parts,
        Err(e) => return ProxyOutcome::UpstreamError(UpstreamError::Handshake(e)),
    };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Backend connection closed: {e}");
        }
    });

    let mut response = match sender.send_request(request).await {
        Ok(response) => response,
        Err(e) => return ProxyOutcome::UpstreamError(UpstreamError::Request(e)),
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, backend_upgrade) {
                    Ok((client, backend)) => {
                        splice(TokioIo::new(client), TokioIo::new(backend)).await;
                    }
                    Err(e) => warn!("Upgrade through proxy failed: {e}"),
                }
            });
        }
    } else {
        strip_hop_by_hop(response.headers_mut());
    }

    ProxyOutcome::Success(response.map(Body::new))
}

/// The requested protocol when the request asks for an upgrade.
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn prepare_request(request: &mut Request, upgrade: Option<HeaderValue>) {
    let origin_form = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("/"));
    *request.uri_mut() = origin_form;

    let info = request.extensions().get::<ConnectionInfo>().copied();
    let headers = request.headers_mut();
    strip_hop_by_hop(headers);

    if let Some(protocol) = upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }

    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST.clone(), host);
    }
    if let Some(info) = info {
        let peer = info.peer.ip().to_string();
        let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {peer}"),
            None => peer,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
        let proto = if info.secure { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static(proto));
    }
}

/// Remove connection-scoped headers, including any named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in [
        &header::CONNECTION,
        &KEEP_ALIVE,
        &PROXY_CONNECTION,
        &header::PROXY_AUTHORIZATION,
        &header::TE,
        &header::TRAILER,
        &header::TRANSFER_ENCODING,
        &header::UPGRADE,
    ] {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_connection_scoped_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::HOST, HeaderValue::from_static("dev.localhost"));
        headers.insert(header::COOKIE, HeaderValue::from_static("a=b"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(header::HOST));
        assert!(headers.contains_key(header::COOKIE));
    }

    #[test]
    fn rewrites_to_origin_form_and_keeps_host() {
        let mut request = Request::builder()
            .uri("http://dev.localhost:12345/static/app.js?v=2")
            .header(header::HOST, "dev.localhost:12345")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectionInfo {
            peer: "10.0.0.7:5555".parse().unwrap(),
            secure: true,
        });

        prepare_request(&mut request, None);

        assert_eq!(request.uri(), "/static/app.js?v=2");
        let headers = request.headers();
        assert_eq!(headers[header::HOST], "dev.localhost:12345");
        assert_eq!(headers["x-forwarded-host"], "dev.localhost:12345");
        assert_eq!(headers["x-forwarded-for"], "10.0.0.7");
        assert_eq!(headers["x-forwarded-proto"], "https");
    }

    #[test]
    fn upgrade_headers_survive_preparation() {
        let mut request = Request::builder()
            .uri("/socket")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        let upgrade = upgrade_protocol(request.headers());
        assert_eq!(upgrade.as_ref().unwrap(), "websocket");

        prepare_request(&mut request, upgrade);
        assert_eq!(request.headers()[header::CONNECTION], "upgrade");
        assert_eq!(request.headers()[header::UPGRADE], "websocket");
    }
}
