//! CONNECT tunnels and raw connection splicing.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use futures_util::FutureExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::redirect::status;

/// Answer a CONNECT request by splicing the client connection to `target`.
///
/// The target is dialed before replying so a refused dial becomes a `503`
/// instead of a tunnel that closes immediately.
pub async fn handle_connect(mut req: Request<Body>, target: &str) -> Response<Body> {
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        warn!("CONNECT without an upgradable connection");
        return status(StatusCode::INTERNAL_SERVER_ERROR);
    };

    let upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("CONNECT {}: cannot reach {target}: {e}", req.uri());
            let mut response = Response::new(Body::from(e.to_string()));
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return response;
        }
    };

    let id = Uuid::new_v4();
    info!("Tunnel {id}: CONNECT {} via {target}", req.uri());
    spawn_tunnel(id, async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let (up, down) = splice(TokioIo::new(upgraded), upstream).await;
                debug!("Tunnel {id} closed ({up} bytes up, {down} bytes down)");
            }
            Err(e) => warn!("Tunnel {id}: upgrade failed: {e}"),
        }
    });

    status(StatusCode::OK)
}

/// Run a tunnel on its own task. A panic ends only that tunnel; dropping
/// its streams closes both sides.
fn spawn_tunnel<F>(id: Uuid, tunnel: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(tunnel).catch_unwind().await {
            error!("Tunnel {id} panicked: {}", panic_message(&panic));
        }
    })
}

/// Copy bytes both ways until either side finishes, then shut both down.
///
/// Returns the bytes copied `a → b` and `b → a`.
pub async fn splice<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
    let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);
    let copied = tokio::select! {
        n = a_to_b => (n.unwrap_or(0), 0),
        n = b_to_a => (0, n.unwrap_or(0)),
    };

    // One direction finishing closes the whole tunnel.
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    copied
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
