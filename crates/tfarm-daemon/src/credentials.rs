//! Durable provisioning-credential store.
//!
//! `credentials.json` in the daemon's working directory is the sole source of
//! truth for "is configured": the supervisor blocks on it before its first
//! start, and the API's route gate reads the flag it drives.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

const CREDENTIALS_FILE: &str = "credentials.json";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identity credentials provisioned by an operator.
///
/// The TLS fields carry optional upstream-mTLS material (base64-encoded PEM)
/// and travel together or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tls_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tls_key: Option<String>,
}

impl Credentials {
    /// Validate a configure request body.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(CredentialError::MissingField(
                "client_id and client_secret are required",
            ));
        }
        let tls_fields = [
            &self.client_ca_cert,
            &self.client_tls_cert,
            &self.client_tls_key,
        ];
        let present = tls_fields.iter().filter(|f| f.is_some()).count();
        if present != 0 && present != tls_fields.len() {
            return Err(CredentialError::MissingField(
                "client_ca_cert, client_tls_cert and client_tls_key must be provided together",
            ));
        }
        Ok(())
    }

    pub fn has_tls_material(&self) -> bool {
        self.client_ca_cert.is_some()
    }
}

/// Credential store errors.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse credentials.json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    MissingField(&'static str),
}

/// On-disk credential holder with a blocking "wait until present" operation.
pub struct CredentialStore {
    work_dir: PathBuf,
    configured: RwLock<bool>,
    // Serializes concurrent waiters so only one drives the configured-flag
    // transition.
    wait_lock: Mutex<()>,
    poll_interval: Duration,
}

impl CredentialStore {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self::with_poll_interval(work_dir, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(work_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            work_dir: work_dir.into(),
            configured: RwLock::new(false),
            wait_lock: Mutex::new(()),
            poll_interval,
        }
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.work_dir.join(CREDENTIALS_FILE)
    }

    /// Non-blocking read of the configured flag.
    pub fn is_configured(&self) -> bool {
        *self
            .configured
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_configured(&self, value: bool) {
        *self
            .configured
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Block until `credentials.json` exists, then parse and return it.
    ///
    /// Only "not found" is retried; any other filesystem error propagates.
    /// The configured flag flips to `true` only after a successful parse, so
    /// a corrupt file never opens the API gate.
    pub async fn wait_for_credentials(&self) -> Result<Credentials, CredentialError> {
        let _guard = self.wait_lock.lock().await;
        let path = self.credentials_path();

        if let Err(e) = tokio::fs::metadata(&path).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
            self.set_configured(false);
            info!(path = %path.display(), "waiting for credentials to be created");
            loop {
                match tokio::fs::metadata(&path).await {
                    Ok(_) => break,
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            info!("credentials created");
        }

        let creds = self.load(&path).await?;
        self.set_configured(true);
        Ok(creds)
    }

    async fn load(&self, path: &Path) -> Result<Credentials, CredentialError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Atomically replace the credentials file.
    ///
    /// Does not flip the configured flag; only the next
    /// [`Self::wait_for_credentials`] observes the new value.
    pub async fn write(&self, creds: &Credentials) -> Result<(), CredentialError> {
        let tmp = self.work_dir.join(format!("{CREDENTIALS_FILE}.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec(creds)?).await?;
        tokio::fs::rename(&tmp, self.credentials_path()).await?;
        Ok(())
    }
}
