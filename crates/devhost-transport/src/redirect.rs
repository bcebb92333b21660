//! Plain-HTTP to HTTPS redirect.

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, StatusCode, header};
use tracing::debug;

/// `307` to the same host, path and query over https.
pub fn to_https<B>(req: &Request<B>) -> Response<Body> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()));
    let Some(host) = host else {
        return status(StatusCode::BAD_REQUEST);
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("https://{host}{path_and_query}");
    debug!("Redirecting to {target}");

    match HeaderValue::from_str(&target) {
        Ok(location) => Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap_or_else(|_| status(StatusCode::INTERNAL_SERVER_ERROR)),
        Err(_) => status(StatusCode::BAD_REQUEST),
    }
}

pub(crate) fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}
