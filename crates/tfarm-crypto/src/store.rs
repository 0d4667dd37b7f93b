//! PEM file round-trips for the daemon's `tls/` directory.
//!
//! Every path that loads or saves certificate material goes through
//! [`CertStore`] so the API server and the issuance commands do not scatter
//! raw file I/O.
//!
//! Layout under the store directory:
//!
//! ```text
//! ca.crt  ca.key  server.crt  server.key  client.json
//! clients/<name>/client.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Serialize};

use crate::certs::{
    self, CertError, FIRST_CLIENT_SERIAL, LeafPair, generate_root, issue_client_cert,
    issue_server_cert,
};

/// Subject names bound into the server leaf. The API only listens on
/// loopback.
const SERVER_SUBJECT_NAMES: &[&str] = &["localhost", "127.0.0.1"];

/// A portable client credential bundle: root, leaf cert and leaf key,
/// base64url-encoded so it can travel as a single JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientBundle {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

impl ClientBundle {
    fn encode(ca_pem: &str, leaf: &LeafPair) -> Self {
        Self {
            ca: URL_SAFE.encode(ca_pem),
            cert: URL_SAFE.encode(&leaf.cert_pem),
            key: URL_SAFE.encode(&leaf.key_pem),
        }
    }

    /// Decode back to PEM strings: `(ca, cert, key)`.
    pub fn decode(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), CertStoreError> {
        Ok((
            URL_SAFE.decode(&self.ca)?,
            URL_SAFE.decode(&self.cert)?,
            URL_SAFE.decode(&self.key)?,
        ))
    }
}

/// Certificate store errors.
#[derive(Debug, thiserror::Error)]
pub enum CertStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error("Client bundle error: {0}")]
    Bundle(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Root material not found in {0}; bootstrap the store first")]
    RootMissing(PathBuf),
}

/// Durable holder of the daemon's root of trust and issued leaves.
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join("ca.crt")
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.dir.join("ca.key")
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.dir.join("server.crt")
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.dir.join("server.key")
    }

    pub fn admin_bundle_path(&self) -> PathBuf {
        self.dir.join("client.json")
    }

    pub fn client_bundle_path(&self, name: &str) -> PathBuf {
        self.dir.join("clients").join(name).join("client.json")
    }

    /// Whether a root of trust already exists on disk.
    pub fn is_bootstrapped(&self) -> bool {
        self.ca_cert_path().exists() && self.ca_key_path().exists()
    }

    /// Generate root, server leaf and the admin client bundle if the store is
    /// empty. Idempotent: an existing root is never overwritten.
    pub fn bootstrap(&self) -> Result<(), CertStoreError> {
        if self.is_bootstrapped() {
            return Ok(());
        }
        self.generate_all()
    }

    /// Unconditionally regenerate the full store. Existing client bundles
    /// under `clients/` are orphaned by this and must be reissued.
    pub fn generate_all(&self) -> Result<(), CertStoreError> {
        fs::create_dir_all(&self.dir)?;

        let ca = generate_root()?;
        fs::write(self.ca_cert_path(), &ca.ca_cert_pem)?;
        fs::write(self.ca_key_path(), ca.key_pem())?;

        let server = issue_server_cert(&ca, SERVER_SUBJECT_NAMES)?;
        fs::write(self.server_cert_path(), &server.cert_pem)?;
        fs::write(self.server_key_path(), &server.key_pem)?;

        let issuer = certs::load_issuer(&ca.ca_cert_pem, &ca.key_pem())?;
        let admin = issue_client_cert(&issuer, "tfarmd client", FIRST_CLIENT_SERIAL)?;
        let bundle = ClientBundle::encode(&ca.ca_cert_pem, &admin);
        fs::write(self.admin_bundle_path(), serde_json::to_vec(&bundle)?)?;

        Ok(())
    }

    /// Issue a named client bundle signed by the persisted root.
    ///
    /// Returns the path the bundle was written to.
    pub fn issue_client(&self, name: &str) -> Result<PathBuf, CertStoreError> {
        if !self.is_bootstrapped() {
            return Err(CertStoreError::RootMissing(self.dir.clone()));
        }

        let ca_cert_pem = fs::read_to_string(self.ca_cert_path())?;
        let ca_key_pem = fs::read_to_string(self.ca_key_path())?;
        let issuer = certs::load_issuer(&ca_cert_pem, &ca_key_pem)?;

        let serial = FIRST_CLIENT_SERIAL + 1 + self.issued_client_count()?;
        let leaf = issue_client_cert(&issuer, name, serial)?;

        let bundle_path = self.client_bundle_path(name);
        if let Some(parent) = bundle_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bundle = ClientBundle::encode(&ca_cert_pem, &leaf);
        fs::write(&bundle_path, serde_json::to_vec(&bundle)?)?;

        Ok(bundle_path)
    }

    /// Load a previously written client bundle.
    pub fn load_client_bundle(&self, path: &Path) -> Result<ClientBundle, CertStoreError> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn issued_client_count(&self) -> Result<u64, CertStoreError> {
        let clients_dir = self.dir.join("clients");
        if !clients_dir.exists() {
            return Ok(0);
        }
        Ok(fs::read_dir(clients_dir)?.count() as u64)
    }
}
