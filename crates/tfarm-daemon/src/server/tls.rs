//! Mutual-TLS server configuration. Clients must present a certificate
//! chaining to the daemon's own CA; anything else is rejected at the
//! handshake.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;

/// PEM files backing the API listener, as laid out by the cert store.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCerts(PathBuf),

    #[error("No private key found in {0}")]
    NoKey(PathBuf),

    #[error("Failed to build client verifier: {0}")]
    ClientVerifier(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Build the rustls server config: our server leaf plus a client verifier
/// rooted at the daemon CA.
pub fn server_config(files: &TlsFiles) -> Result<rustls::ServerConfig, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&files.ca_cert)? {
        roots.add(cert)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsError::ClientVerifier(e.to_string()))?;

    let certs = load_certs(&files.server_cert)?;
    let key = load_key(&files.server_key)?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(config)
}

fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.clone(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts(path.clone()));
    }
    Ok(certs)
}

fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        path: path.clone(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| TlsError::Read {
            path: path.clone(),
            source,
        })?
        .ok_or_else(|| TlsError::NoKey(path.clone()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tfarm_crypto::store::CertStore;

    fn install_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn builds_mtls_config_from_cert_store_output() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let store = CertStore::new(dir.path());
        store.bootstrap().unwrap();

        let files = TlsFiles {
            ca_cert: store.ca_cert_path(),
            server_cert: store.server_cert_path(),
            server_key: store.server_key_path(),
        };
        server_config(&files).unwrap();
    }

    #[test]
    fn missing_files_are_read_errors() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let files = TlsFiles {
            ca_cert: dir.path().join("ca.crt"),
            server_cert: dir.path().join("server.crt"),
            server_key: dir.path().join("server.key"),
        };
        assert!(matches!(server_config(&files), Err(TlsError::Read { .. })));
    }

    #[test]
    fn garbage_pem_yields_no_certs() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let ca = dir.path().join("ca.crt");
        std::fs::write(&ca, "not pem at all").unwrap();
        let files = TlsFiles {
            ca_cert: ca,
            server_cert: dir.path().join("server.crt"),
            server_key: dir.path().join("server.key"),
        };
        assert!(matches!(server_config(&files), Err(TlsError::NoCerts(_))));
    }
}
