//! Mutually-authenticated HTTPS API server.

pub mod handlers;
pub mod response;
pub mod routes;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::mpsc;
use tracing::info;

pub use routes::{AppState, router};
pub use tls::{TlsError, TlsFiles};

/// The API listener: an axum router served over rustls with client
/// certificates required.
pub struct ApiServer {
    addr: SocketAddr,
    config: Arc<rustls::ServerConfig>,
    router: Router,
}

impl ApiServer {
    /// Load the TLS material and bind parameters. Listens on all interfaces;
    /// client certificate verification is the access control.
    pub fn new(router: Router, port: u16, tls_files: &TlsFiles) -> Result<Self, TlsError> {
        let config = tls::server_config(tls_files)?;
        Ok(Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            config: Arc::new(config),
            router,
        })
    }

    /// Spawn the serve future. The listener runs until the process exits; an
    /// error here means the daemon cannot accept commands any more, which the
    /// control loop treats as fatal.
    pub fn start(self, err_tx: mpsc::UnboundedSender<std::io::Error>) {
        tokio::spawn(async move {
            info!(addr = %self.addr, "api server listening");
            let rustls_config = RustlsConfig::from_config(self.config);
            if let Err(e) = axum_server::bind_rustls(self.addr, rustls_config)
                .serve(self.router.into_make_service())
                .await
            {
                let _ = err_tx.send(e);
            }
        });
    }
}
