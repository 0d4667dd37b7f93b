//! Tunnel fragments under `conf.d/`, one file per tunnel, applied with a
//! write/verify/reload transaction so a bad fragment never survives.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frpc::supervisor::{FrpcSupervisor, SupervisorError};

/// Directory of tunnel fragments, relative to the work dir. Matched by the
/// `includes` line of the main config.
pub const FRAGMENTS_DIR: &str = "conf.d";

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel already exists: {0}")]
    Conflict(String),

    #[error("tunnel does not exist: {0}")]
    NotFound(String),

    #[error("invalid tunnel type: {0}")]
    InvalidType(String),

    #[error("invalid tunnel name: {0}")]
    InvalidName(String),

    #[error("remote_port is required for tcp tunnels")]
    MissingRemotePort,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frpc(#[from] SupervisorError),
}

/// Body of a tunnel creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelRequest {
    pub name: String,
    pub r#type: String,
    pub local_ip: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelType {
    Http,
    Https,
    Tcp,
}

impl TunnelType {
    fn parse(raw: &str) -> Result<Self, TunnelError> {
        match raw {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "tcp" => Ok(Self::Tcp),
            other => Err(TunnelError::InvalidType(other.to_string())),
        }
    }
}

pub fn fragment_path(work_dir: &Path, name: &str) -> PathBuf {
    work_dir.join(FRAGMENTS_DIR).join(format!("{name}.ini"))
}

/// Tunnel names become file names, so they must not be able to escape the
/// fragments directory.
fn validate_name(name: &str) -> Result<(), TunnelError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok && name != "." && name != ".." {
        Ok(())
    } else {
        Err(TunnelError::InvalidName(name.to_string()))
    }
}

fn render_fragment(request: &TunnelRequest, kind: TunnelType, proxy_id: &Uuid) -> Result<String, TunnelError> {
    let fragment = match kind {
        TunnelType::Http | TunnelType::Https => format!(
            r#"[{name}]
type = {kind}
local_ip = {local_ip}
local_port = {local_port}
subdomain = TBD
meta_proxy_id = {proxy_id}
"#,
            name = request.name,
            kind = request.r#type,
            local_ip = request.local_ip,
            local_port = request.local_port,
        ),
        TunnelType::Tcp => {
            let remote_port = request.remote_port.ok_or(TunnelError::MissingRemotePort)?;
            format!(
                r#"[{name}]
type = tcp
local_ip = {local_ip}
local_port = {local_port}
remote_port = {remote_port}
meta_proxy_id = {proxy_id}
"#,
                name = request.name,
                local_ip = request.local_ip,
                local_port = request.local_port,
            )
        }
    };
    Ok(fragment)
}

/// Run `verify` then `reload` against the current on-disk config.
async fn apply(supervisor: &FrpcSupervisor) -> Result<(), SupervisorError> {
    supervisor.output("verify").await?;
    supervisor.output("reload").await?;
    Ok(())
}

/// Create a tunnel fragment and apply it. The fragment is removed again when
/// verify or reload rejects the new config, so a failed create leaves the
/// directory exactly as it was.
pub async fn create(
    supervisor: &FrpcSupervisor,
    request: &TunnelRequest,
) -> Result<(), TunnelError> {
    validate_name(&request.name)?;
    let kind = TunnelType::parse(&request.r#type)?;

    let path = fragment_path(supervisor.work_dir(), &request.name);
    if path.exists() {
        return Err(TunnelError::Conflict(request.name.clone()));
    }

    let proxy_id = Uuid::new_v4();
    let fragment = render_fragment(request, kind, &proxy_id)?;
    std::fs::write(&path, fragment)?;
    info!(name = %request.name, %proxy_id, "wrote tunnel fragment");

    if let Err(err) = apply(supervisor).await {
        warn!(name = %request.name, error = %err, "rolling back tunnel fragment");
        if let Err(remove_err) = std::fs::remove_file(&path) {
            warn!(name = %request.name, error = %remove_err, "failed to remove tunnel fragment");
        }
        return Err(err.into());
    }
    Ok(())
}

/// Delete a tunnel fragment and apply the removal. The original bytes are
/// written back when reload rejects the shrunken config; a verify failure at
/// this point means the remaining config is broken independently of this
/// tunnel, so the fragment stays deleted.
pub async fn delete(supervisor: &FrpcSupervisor, name: &str) -> Result<(), TunnelError> {
    validate_name(name)?;

    let path = fragment_path(supervisor.work_dir(), name);
    if !path.exists() {
        return Err(TunnelError::NotFound(name.to_string()));
    }

    let original = std::fs::read(&path)?;
    std::fs::remove_file(&path)?;
    info!(name, "removed tunnel fragment");

    supervisor.output("verify").await.map_err(TunnelError::Frpc)?;

    if let Err(err) = supervisor.output("reload").await {
        warn!(name, error = %err, "restoring tunnel fragment");
        if let Err(write_err) = std::fs::write(&path, &original) {
            warn!(name, error = %write_err, "failed to restore tunnel fragment");
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn write_stub(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("frpc");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(dir: &TempDir, script: &str) -> FrpcSupervisor {
        std::fs::create_dir_all(dir.path().join(FRAGMENTS_DIR)).unwrap();
        let bin = write_stub(dir.path(), script);
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        FrpcSupervisor::new(bin, dir.path(), fatal_tx)
    }

    const ALWAYS_OK: &str = "#!/bin/sh\nexit 0\n";
    const RELOAD_FAILS: &str = "#!/bin/sh\nif [ \"$1\" = reload ]; then exit 1; fi\nexit 0\n";
    const VERIFY_FAILS: &str = "#!/bin/sh\nif [ \"$1\" = verify ]; then exit 1; fi\nexit 0\n";

    fn tcp_request(name: &str) -> TunnelRequest {
        TunnelRequest {
            name: name.to_string(),
            r#type: "tcp".to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 22,
            remote_port: Some(2222),
        }
    }

    #[tokio::test]
    async fn create_writes_tcp_fragment() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);

        create(&sup, &tcp_request("ssh")).await.unwrap();

        let written = std::fs::read_to_string(fragment_path(dir.path(), "ssh")).unwrap();
        assert!(written.starts_with("[ssh]\n"));
        assert!(written.contains("type = tcp"));
        assert!(written.contains("local_ip = 127.0.0.1"));
        assert!(written.contains("local_port = 22"));
        assert!(written.contains("remote_port = 2222"));
        assert!(written.contains("meta_proxy_id = "));
    }

    #[tokio::test]
    async fn create_writes_http_fragment_with_subdomain() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);

        let request = TunnelRequest {
            name: "web".to_string(),
            r#type: "http".to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 8080,
            remote_port: None,
        };
        create(&sup, &request).await.unwrap();

        let written = std::fs::read_to_string(fragment_path(dir.path(), "web")).unwrap();
        assert!(written.contains("type = http"));
        assert!(written.contains("subdomain = TBD"));
        assert!(!written.contains("remote_port"));
    }

    #[tokio::test]
    async fn create_duplicate_is_conflict() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);

        create(&sup, &tcp_request("ssh")).await.unwrap();
        let before = std::fs::read(fragment_path(dir.path(), "ssh")).unwrap();

        assert!(matches!(
            create(&sup, &tcp_request("ssh")).await,
            Err(TunnelError::Conflict(name)) if name == "ssh"
        ));
        // Existing fragment untouched, proxy id included.
        let after = std::fs::read(fragment_path(dir.path(), "ssh")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn create_rejects_unknown_type_and_bad_name() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);

        let mut request = tcp_request("ssh");
        request.r#type = "udp".to_string();
        assert!(matches!(
            create(&sup, &request).await,
            Err(TunnelError::InvalidType(t)) if t == "udp"
        ));

        let mut request = tcp_request("../escape");
        request.name = "../escape".to_string();
        assert!(matches!(
            create(&sup, &request).await,
            Err(TunnelError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn tcp_without_remote_port_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);

        let mut request = tcp_request("ssh");
        request.remote_port = None;
        assert!(matches!(
            create(&sup, &request).await,
            Err(TunnelError::MissingRemotePort)
        ));
        assert!(!fragment_path(dir.path(), "ssh").exists());
    }

    #[tokio::test]
    async fn create_rolls_back_on_verify_failure() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, VERIFY_FAILS);

        assert!(create(&sup, &tcp_request("ssh")).await.is_err());
        assert!(!fragment_path(dir.path(), "ssh").exists());
    }

    #[tokio::test]
    async fn create_rolls_back_on_reload_failure() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, RELOAD_FAILS);

        assert!(create(&sup, &tcp_request("ssh")).await.is_err());
        assert!(!fragment_path(dir.path(), "ssh").exists());
    }

    #[tokio::test]
    async fn delete_removes_fragment() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);

        create(&sup, &tcp_request("ssh")).await.unwrap();
        delete(&sup, "ssh").await.unwrap();
        assert!(!fragment_path(dir.path(), "ssh").exists());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);

        assert!(matches!(
            delete(&sup, "ghost").await,
            Err(TunnelError::NotFound(name)) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn delete_restores_fragment_on_reload_failure() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);
        create(&sup, &tcp_request("ssh")).await.unwrap();
        let original = std::fs::read(fragment_path(dir.path(), "ssh")).unwrap();

        // Swap the stub for one whose reload fails.
        write_stub(dir.path(), RELOAD_FAILS);
        assert!(delete(&sup, "ssh").await.is_err());

        let restored = std::fs::read(fragment_path(dir.path(), "ssh")).unwrap();
        assert_eq!(original, restored);
    }

    #[tokio::test]
    async fn delete_leaves_fragment_removed_on_verify_failure() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, ALWAYS_OK);
        create(&sup, &tcp_request("ssh")).await.unwrap();

        write_stub(dir.path(), VERIFY_FAILS);
        assert!(delete(&sup, "ssh").await.is_err());
        assert!(!fragment_path(dir.path(), "ssh").exists());
    }
}
