//! Single-port transport server.
//!
//! One TCP listener carries HTTPS, plain HTTP and CONNECT tunnels. Each
//! accepted connection is sniffed: TLS client hellos are terminated and fed
//! to the application router, plain HTTP gets an HTTPS redirect, and CONNECT
//! requests on either path are tunnelled to the configured target.

use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsAcceptor;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::redirect;
use crate::sniff::{Protocol, sniff};
use crate::tls::load_rustls_config;
use crate::tunnel::handle_connect;

/// Certificate and key, both PEM.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Where CONNECT tunnels lead.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TunnelTarget {
    /// Back into this listener, so TLS is terminated once, here.
    #[default]
    Loopback,
    /// A fixed `host:port`.
    Fixed(String),
}

impl FromStr for TunnelTarget {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "loopback" => TunnelTarget::Loopback,
            other => TunnelTarget::Fixed(other.to_string()),
        })
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelTarget::Loopback => f.write_str("loopback"),
            TunnelTarget::Fixed(addr) => f.write_str(addr),
        }
    }
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hostname to bind to
    pub hostname: String,
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// TLS material; `None` serves the application over plain HTTP
    pub tls: Option<TlsConfig>,
    pub tunnel_target: TunnelTarget,
    /// How long a new connection may stay silent before it is dropped
    pub sniff_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".into(),
            port: 12345,
            tls: None,
            tunnel_target: TunnelTarget::Loopback,
            sniff_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-connection facts, inserted into every request's extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    /// Whether the request arrived over TLS.
    pub secure: bool,
}

struct Shared {
    app: Router,
    tls: Option<RustlsAcceptor>,
    tunnel_addr: String,
    sniff_timeout: Duration,
}

pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Accept loop handle
    handle: Option<JoinHandle<()>>,
    /// Actual bound port
    port: u16,
    tls: bool,
}

impl TransportServer {
    /// Bind the listener and start accepting connections for `app`.
    pub async fn start(config: TransportConfig, app: Router) -> Result<Self, TransportError> {
        let tls = match &config.tls {
            Some(tls) => Some(RustlsAcceptor::new(load_rustls_config(
                &tls.cert_path,
                &tls.key_path,
            )?)),
            None => None,
        };

        let addr = format!("{}:{}", config.hostname, config.port);
        let listener = TcpListener::bind((config.hostname.as_str(), config.port))
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;

        let tunnel_addr = match &config.tunnel_target {
            TunnelTarget::Loopback => {
                let ip = if local.ip().is_unspecified() {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                } else {
                    local.ip()
                };
                SocketAddr::new(ip, local.port()).to_string()
            }
            TunnelTarget::Fixed(addr) => addr.clone(),
        };

        let is_tls = tls.is_some();
        let scheme = if is_tls { "https" } else { "http" };
        info!(
            "Listening on {scheme}://{}:{} (CONNECT → {tunnel_addr})",
            config.hostname,
            local.port()
        );

        let shared = Arc::new(Shared {
            app,
            tls,
            tunnel_addr,
            sniff_timeout: config.sniff_timeout,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: local.port(),
            tls: is_tls,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Stop accepting connections. Connections already in flight finish on
    /// their own.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Transport server stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(shared.clone(), stream, peer));
                }
                Err(e) => {
                    warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let protocol = match sniff(&stream, shared.sniff_timeout).await {
        Ok(Some(protocol)) => protocol,
        Ok(None) => {
            debug!("{peer} closed before sending anything");
            return;
        }
        Err(e) => {
            debug!("Dropping {peer}: {e}");
            return;
        }
    };

    match (protocol, &shared.tls) {
        (Protocol::Tls, Some(acceptor)) => match acceptor.accept(stream, ()).await {
            Ok((tls_stream, ())) => serve_http(shared.clone(), tls_stream, peer, true).await,
            Err(e) => debug!("TLS handshake with {peer} failed: {e}"),
        },
        (Protocol::Tls, None) => warn!("TLS client {peer} on a plaintext listener; dropping"),
        (Protocol::Http, _) => serve_http(shared.clone(), stream, peer, false).await,
    }
}

async fn serve_http<I>(shared: Arc<Shared>, io: I, peer: SocketAddr, secure: bool)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let info = ConnectionInfo { peer, secure };
    let service = service_fn(move |req: Request<Incoming>| {
        let shared = shared.clone();
        async move { Ok::<_, Infallible>(dispatch(&shared, info, req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!("Connection from {peer} ended: {e}");
    }
}

async fn dispatch(shared: &Shared, info: ConnectionInfo, req: Request<Incoming>) -> Response<Body> {
    let mut req = req.map(Body::new);
    req.extensions_mut().insert(info);

    if req.method() == Method::CONNECT {
        return handle_connect(req, &shared.tunnel_addr).await;
    }
    // With TLS configured, the plain path only redirects.
    if !info.secure && shared.tls.is_some() {
        return redirect::to_https(&req);
    }
    match shared.app.clone().oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}
