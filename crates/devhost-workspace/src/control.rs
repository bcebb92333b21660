//! Client for a backend's control socket.

use std::path::Path;

use bytes::Bytes;
use devhost_protocol::{EditorOpenCommand, OpenFileRequest};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::error::ControlError;

/// Ask the editor behind `control_socket` to open a file at a position.
pub async fn send_open_file(
    control_socket: &Path,
    request: &OpenFileRequest,
) -> Result<(), ControlError> {
    let body = serde_json::to_vec(&EditorOpenCommand::open_at(request))?;

    let stream = UnixStream::connect(control_socket)
        .await
        .map_err(|source| ControlError::Dial {
            path: control_socket.to_path_buf(),
            source,
        })?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Control connection error: {e}");
        }
    });

    let req = Request::post("/")
        .header(HOST, "localhost")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))?;
    let response = sender.send_request(req).await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.into_body().collect().await?.to_bytes();
        return Err(ControlError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    debug!(
        "Opened {}:{}:{} via {}",
        request.file.display(),
        request.line,
        request.column,
        control_socket.display()
    );
    Ok(())
}
