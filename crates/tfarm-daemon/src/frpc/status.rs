//! Proxy status, fetched from the frpc admin endpoint and rendered as a
//! fixed-width table.

use std::path::Path;

use serde::Deserialize;

use crate::frpc::config::{ConfigError, FrpcConfig};

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("frpc admin endpoint is not configured")]
    AdminDisabled,

    #[error("Failed to query frpc admin endpoint: {0}")]
    Http(#[from] reqwest::Error),

    #[error("frpc admin endpoint returned {0}")]
    Unexpected(reqwest::StatusCode),
}

/// Response shape of frpc's `GET /api/status`, one list per proxy type.
#[derive(Debug, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub tcp: Vec<ProxyStatus>,
    #[serde(default)]
    pub udp: Vec<ProxyStatus>,
    #[serde(default)]
    pub http: Vec<ProxyStatus>,
    #[serde(default)]
    pub https: Vec<ProxyStatus>,
    #[serde(default)]
    pub stcp: Vec<ProxyStatus>,
    #[serde(default)]
    pub xtcp: Vec<ProxyStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProxyStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub local_addr: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default, rename = "err")]
    pub error: String,
}

/// Read the admin address out of the config file, query `/api/status` and
/// render the result. The admin API uses basic auth with empty credentials.
pub async fn fetch_status(work_dir: &Path) -> Result<String, StatusError> {
    let cfg = FrpcConfig::load(&FrpcConfig::path(work_dir))?;
    if cfg.admin_port == 0 || cfg.admin_addr.is_empty() {
        return Err(StatusError::AdminDisabled);
    }

    let url = format!("http://{}:{}/api/status", cfg.admin_addr, cfg.admin_port);
    let response = reqwest::Client::new()
        .get(&url)
        .basic_auth(&cfg.admin_user, Some(&cfg.admin_pwd))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(StatusError::Unexpected(response.status()));
    }

    let status: StatusResponse = response.json().await?;
    Ok(render_table(&status))
}

/// Render proxies grouped by type, in a fixed group order, with columns sized
/// to their widest cell. HTTP and HTTPS remote addresses get a scheme prefix
/// so they paste straight into a browser.
pub fn render_table(status: &StatusResponse) -> String {
    const HEADER: [&str; 7] = [
        "Name",
        "Type",
        "Status",
        "LocalAddr",
        "Plugin",
        "RemoteAddr",
        "Error",
    ];

    let groups: [(&str, &[ProxyStatus]); 6] = [
        ("tcp", &status.tcp),
        ("udp", &status.udp),
        ("http", &status.http),
        ("https", &status.https),
        ("stcp", &status.stcp),
        ("xtcp", &status.xtcp),
    ];

    let mut rows: Vec<[String; 7]> = Vec::new();
    for (kind, proxies) in groups {
        for proxy in proxies {
            let remote = match kind {
                "http" | "https" if !proxy.remote_addr.is_empty() => {
                    format!("{kind}://{}", proxy.remote_addr)
                }
                _ => proxy.remote_addr.clone(),
            };
            rows.push([
                proxy.name.clone(),
                kind.to_string(),
                proxy.status.clone(),
                proxy.local_addr.clone(),
                proxy.plugin.clone(),
                remote,
                proxy.error.clone(),
            ]);
        }
    }

    let mut widths: [usize; 7] = HEADER.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    render_row(&mut out, &HEADER.map(String::from), &widths);
    for row in &rows {
        render_row(&mut out, row, &widths);
    }
    out
}

fn render_row(out: &mut String, row: &[String; 7], widths: &[usize; 7]) {
    for (i, (cell, width)) in row.iter().zip(widths.iter()).enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        out.extend(std::iter::repeat_n(' ', width - cell.len()));
    }
    // Trailing padding would show up as whitespace noise in terminals.
    while out.ends_with(' ') {
        out.pop();
    }
    out.push('\n');
}
