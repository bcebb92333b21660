//! TLS server configuration.

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use crate::error::TransportError;

/// Build a rustls server config from PEM files.
///
/// Only `http/1.1` is offered over ALPN: CONNECT tunnels and upgrade
/// forwarding take over the raw connection, which HTTP/2 does not allow.
pub fn load_rustls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, TransportError> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| TransportError::TlsMaterial {
            path: cert_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TransportError::TlsMaterial {
            path: cert_path.to_path_buf(),
            reason: "no certificates found".into(),
        });
    }
    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| TransportError::TlsMaterial {
        path: key_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!("Loaded TLS certificate from {}", cert_path.display());
    Ok(RustlsConfig::from_config(Arc::new(config)))
}
