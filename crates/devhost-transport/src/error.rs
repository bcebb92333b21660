//! Transport errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read TLS material from {path}: {reason}")]
    TlsMaterial { path: PathBuf, reason: String },

    #[error("invalid TLS configuration: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
