//! TLS material for the MJPEG HTTP endpoint.
//!
//! RTSP itself is never TLS; only the HTTP server may be. The
//! certificate file is PEM holding the chain and the private key.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{Result, ServerError};

/// Load a `rustls::ServerConfig` from one PEM file containing the
/// certificate chain and private key.
///
/// `password` is accepted for config compatibility with encrypted
/// stores; PEM keys are expected unencrypted, so a set password only
/// warns.
pub fn load_server_config(
    cert_path: &Path,
    password: Option<&str>,
) -> Result<Arc<rustls::ServerConfig>> {
    if password.is_some_and(|p| !p.is_empty()) {
        tracing::warn!("certificate password set but PEM keys are read unencrypted");
    }

    let mut reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }

    let mut reader = BufReader::new(File::open(cert_path)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::Tls(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| {
            ServerError::Tls(format!("no private key in {}", cert_path.display()))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("TLS config error: {e}")))?;

    tracing::info!(path = %cert_path.display(), "TLS certificate loaded");
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_io_error() {
        let err = load_server_config(Path::new("/nonexistent/cert.pem"), None).unwrap_err();
        assert!(matches!(err, ServerError::Io(_)));
    }

    #[test]
    fn empty_pem_rejected() {
        let dir = std::env::temp_dir().join("camstream-tls-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.pem");
        std::fs::write(&path, "").unwrap();
        let err = load_server_config(&path, None).unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
    }
}
