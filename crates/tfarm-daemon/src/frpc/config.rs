//! The managed process's configuration file.
//!
//! `frpc.ini` is rendered from a fixed template and re-parsed whenever the
//! daemon needs the admin endpoint or has to re-sign. The parser accepts any
//! INI-shaped input and ignores sections it does not know; only a missing
//! `[common]` section is fatal.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tfarm_crypto::signature::hmac_signature;

use crate::credentials::Credentials;

pub const CONFIG_FILE: &str = "frpc.ini";
/// Directory for the optional upstream-mTLS material referenced by the
/// template.
pub const UPSTREAM_TLS_DIR: &str = "tls/frps";

/// Reserved metadata keys written by [`FrpcConfig::sign`].
pub const META_CLIENT_ID: &str = "client_id";
pub const META_CLIENT_SIGNATURE: &str = "client_signature";

/// frpc configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frpc config: {0}")]
    Malformed(String),

    #[error("Failed to decode client secret: {0}")]
    SecretDecode(#[from] base64::DecodeError),
}

/// The `[common]` section of `frpc.ini`, plus the free-form metadata map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrpcConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub token: String,
    pub admin_addr: String,
    pub admin_port: u16,
    pub admin_user: String,
    pub admin_pwd: String,
    pub log_level: String,
    /// Free-form metadata; `client_id` and `client_signature` are reserved
    /// and overwritten by [`Self::sign`].
    pub metas: BTreeMap<String, String>,
}

impl FrpcConfig {
    pub fn path(work_dir: &Path) -> PathBuf {
        work_dir.join(CONFIG_FILE)
    }

    /// Render the full config document from the fixed template.
    pub fn render(&self) -> String {
        let mut out = format!(
            r#"[common]
server_addr = {server_addr}
server_port = {server_port}
authentication_method = token
token = "{token}"
authenticate_new_work_conns = true
authenticate_heartbeats = true
admin_addr = {admin_addr}
admin_port = {admin_port}
admin_user = {admin_user}
admin_pwd = {admin_pwd}
includes = ./conf.d/*.ini
log_level = {log_level}
tls_enable = true
tls_cert_file = ./{tls_dir}/client.crt
tls_key_file = ./{tls_dir}/client.key
tls_trusted_ca_file = ./{tls_dir}/ca.crt
"#,
            server_addr = self.server_addr,
            server_port = self.server_port,
            token = self.token,
            admin_addr = self.admin_addr,
            admin_port = self.admin_port,
            admin_user = self.admin_user,
            admin_pwd = self.admin_pwd,
            log_level = self.log_level,
            tls_dir = UPSTREAM_TLS_DIR,
        );
        for (key, value) in &self.metas {
            // Infallible: writing to a String cannot fail.
            let _ = writeln!(out, "meta_{key} = \"{value}\"");
        }
        out
    }

    /// Parse a config document. Unknown keys and sections are ignored; a
    /// missing `[common]` section is an error.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let mut in_common = false;
        let mut saw_common = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_common = section == "common";
                saw_common |= in_common;
                continue;
            }
            if !in_common {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"').to_string();
            match key {
                "server_addr" => cfg.server_addr = value,
                "server_port" => cfg.server_port = parse_port(key, &value)?,
                "token" => cfg.token = value,
                "admin_addr" => cfg.admin_addr = value,
                "admin_port" => cfg.admin_port = parse_port(key, &value)?,
                "admin_user" => cfg.admin_user = value,
                "admin_pwd" => cfg.admin_pwd = value,
                "log_level" => cfg.log_level = value,
                _ => {
                    if let Some(meta) = key.strip_prefix("meta_") {
                        cfg.metas.insert(meta.to_string(), value);
                    }
                }
            }
        }

        if !saw_common {
            return Err(ConfigError::Malformed(
                "missing [common] section".to_string(),
            ));
        }
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        Ok(fs::write(path, self.render())?)
    }

    /// Inject the identity signature derived from `creds`.
    ///
    /// Overwrites any prior `client_id`/`client_signature` values; a stale
    /// signature after a credential change would be silently rejected by the
    /// upstream. Idempotent for identical credentials.
    pub fn sign(&mut self, creds: &Credentials) -> Result<(), ConfigError> {
        let secret = STANDARD.decode(&creds.client_secret)?;
        self.metas
            .insert(META_CLIENT_ID.to_string(), creds.client_id.clone());
        self.metas.insert(
            META_CLIENT_SIGNATURE.to_string(),
            hmac_signature(&secret, creds.client_id.as_bytes()),
        );
        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Malformed(format!("invalid {key}: {value}")))
}

/// Load, sign and rewrite `frpc.ini` in `work_dir`.
pub fn sign_config_file(work_dir: &Path, creds: &Credentials) -> Result<(), ConfigError> {
    let path = FrpcConfig::path(work_dir);
    let mut cfg = FrpcConfig::load(&path)?;
    cfg.sign(creds)?;
    cfg.save(&path)
}

/// Write the optional upstream-mTLS material (base64-encoded PEM in the
/// credentials) into `tls/frps/`, where the rendered template points frpc.
pub fn write_upstream_tls_files(work_dir: &Path, creds: &Credentials) -> Result<(), ConfigError> {
    let (Some(ca), Some(cert), Some(key)) = (
        creds.client_ca_cert.as_deref(),
        creds.client_tls_cert.as_deref(),
        creds.client_tls_key.as_deref(),
    ) else {
        return Ok(());
    };

    let dir = work_dir.join(UPSTREAM_TLS_DIR);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("ca.crt"), STANDARD.decode(ca)?)?;
    fs::write(dir.join("client.crt"), STANDARD.decode(cert)?)?;
    fs::write(dir.join("client.key"), STANDARD.decode(key)?)?;
    Ok(())
}
