//! devhost server: the HTTP application behind the transport.
//!
//! Requests for the editor host are resolved to a workspace (explicit
//! `?folder=` or session cookie) and reverse-proxied to that workspace's
//! backend socket, with one transparent respawn when the socket cannot be
//! dialed. Other hosts get the control-plane API.

pub mod api;
pub mod app;
pub mod proxy;
pub mod router;

pub use app::{ServerConfig, build_app};
pub use proxy::{ProxyOutcome, UpstreamError, forward};
pub use router::{ProxyRouter, Rejection, Resolution, resolve};
