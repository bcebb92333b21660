//! devhost transport layer
//!
//! Owns the single listening port. The transport handles:
//! - Protocol sniffing (TLS vs plain HTTP) on each new connection
//! - TLS termination with ALPN pinned to HTTP/1.1
//! - Plain HTTP → HTTPS redirects
//! - CONNECT tunnels, to a fixed address or back into this listener
//!
//! The transport is decoupled from the application via a plain axum `Router`.

pub mod error;
pub mod redirect;
pub mod server;
pub mod sniff;
pub mod tls;
pub mod tunnel;

pub use error::TransportError;
pub use server::{ConnectionInfo, TlsConfig, TransportConfig, TransportServer, TunnelTarget};
pub use sniff::{Protocol, classify};
pub use tunnel::splice;
