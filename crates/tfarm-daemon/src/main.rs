//! tfarmd
//!
//! Supervises a managed frpc subprocess, runs a private CA for its own
//! mutually-authenticated REST API, and applies tunnel changes as
//! verify-then-reload transactions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};

use tfarm_crypto::store::CertStore;
use tfarm_daemon::credentials::CredentialStore;
use tfarm_daemon::frpc::FrpcSupervisor;
use tfarm_daemon::frpc::config::FrpcConfig;
use tfarm_daemon::frpc::tunnels::FRAGMENTS_DIR;
use tfarm_daemon::server::{ApiServer, AppState, TlsFiles, router};
use tfarm_daemon::tracing_init;

#[derive(Parser, Debug)]
#[command(name = "tfarmd")]
#[command(version, about = "tfarm daemon - managed frpc tunnel supervisor")]
struct Cli {
    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "TFARMD_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TFARMD_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start(StartArgs),
    /// Manage TLS certificates
    Certs {
        #[command(subcommand)]
        command: CertsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CertsCommand {
    /// Regenerate the CA, server and admin client certificates
    Regenerate {
        /// Working directory holding the tls/ tree
        #[arg(long, default_value = ".", env = "TFARMD_WORK_DIR")]
        work_dir: PathBuf,
    },
    /// Issue a named client certificate bundle
    Client {
        /// Common name of the client
        name: String,

        /// Working directory holding the tls/ tree
        #[arg(long, default_value = ".", env = "TFARMD_WORK_DIR")]
        work_dir: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Port the API server listens on
    #[arg(long, short = 'p', default_value_t = 8443, env = "TFARMD_PORT")]
    port: u16,

    /// Path to the frpc binary (a bare name is resolved via PATH)
    #[arg(long, default_value = "frpc", env = "TFARMD_FRPC_BIN_PATH")]
    frpc_bin: PathBuf,

    /// Working directory for frpc.ini, conf.d/, tls/ and credentials
    #[arg(long, default_value = ".", env = "TFARMD_WORK_DIR")]
    work_dir: PathBuf,

    /// Address of the frpc admin interface
    #[arg(long, default_value = "127.0.0.1", env = "TFARMD_FRPC_ADMIN_ADDR")]
    frpc_admin_addr: String,

    /// Port of the frpc admin interface
    #[arg(long, default_value_t = 7400, env = "TFARMD_FRPC_ADMIN_PORT")]
    frpc_admin_port: u16,

    /// frpc log level
    #[arg(long, default_value = "info", env = "TFARMD_FRPC_LOG_LEVEL")]
    frpc_log_level: String,

    /// frps server address
    #[arg(long, env = "TFARMD_FRPS_SERVER_ADDR")]
    frps_server_addr: String,

    /// frps server port
    #[arg(long, default_value_t = 7000, env = "TFARMD_FRPS_SERVER_PORT")]
    frps_server_port: u16,

    /// frps authentication token
    #[arg(long, default_value = "", env = "TFARMD_FRPS_TOKEN")]
    frps_token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = format!(
        "tfarm_daemon={level},tfarmd={level},tfarm_crypto={level}",
        level = cli.log_level
    );
    tracing_init::init_tracing(&log_filter, cli.log_json);

    match cli.command {
        Command::Start(args) => start(args).await,
        Command::Certs { command } => match command {
            CertsCommand::Regenerate { work_dir } => certs_regenerate(&work_dir),
            CertsCommand::Client { name, work_dir } => certs_client(&name, &work_dir),
        },
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting tfarmd");

    // A bare binary name is resolved via PATH at spawn time; an explicit
    // path must exist up front so misconfiguration fails fast.
    if args.frpc_bin.components().count() > 1 && !args.frpc_bin.exists() {
        bail!("frpc binary not found at {}", args.frpc_bin.display());
    }
    if !args.work_dir.is_dir() {
        bail!("work directory not found at {}", args.work_dir.display());
    }

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cert_store = CertStore::new(args.work_dir.join("tls"));
    cert_store
        .bootstrap()
        .context("failed to bootstrap certificates")?;

    // The [common] section is owned by the flags; metas are re-derived from
    // credentials on every sign, so overwriting here loses nothing.
    let config = FrpcConfig {
        server_addr: args.frps_server_addr,
        server_port: args.frps_server_port,
        token: args.frps_token,
        admin_addr: args.frpc_admin_addr,
        admin_port: args.frpc_admin_port,
        admin_user: String::new(),
        admin_pwd: String::new(),
        log_level: args.frpc_log_level,
        metas: std::collections::BTreeMap::new(),
    };
    config
        .save(&FrpcConfig::path(&args.work_dir))
        .context("failed to write frpc config")?;
    std::fs::create_dir_all(args.work_dir.join(FRAGMENTS_DIR))
        .context("failed to create fragments directory")?;

    let credentials = Arc::new(CredentialStore::new(&args.work_dir));
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let supervisor = Arc::new(FrpcSupervisor::new(
        &args.frpc_bin,
        &args.work_dir,
        fatal_tx,
    ));

    let state = AppState {
        supervisor: Arc::clone(&supervisor),
        credentials: Arc::clone(&credentials),
    };
    let tls_files = TlsFiles {
        ca_cert: cert_store.ca_cert_path(),
        server_cert: cert_store.server_cert_path(),
        server_key: cert_store.server_key_path(),
    };
    let server =
        ApiServer::new(router(state), args.port, &tls_files).context("failed to set up API server")?;
    let (server_err_tx, mut server_err_rx) = mpsc::unbounded_channel();
    server.start(server_err_tx);

    supervisor.start_loop(Arc::clone(&credentials));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        err = server_err_rx.recv() => {
            if let Some(err) = err {
                error!(error = %err, "api server exited");
                bail!("api server exited: {err}");
            }
            bail!("api server exited");
        }
        err = fatal_rx.recv() => {
            if let Some(err) = err {
                error!(error = %err, "frpc supervision failed");
                bail!("frpc supervision failed: {err}");
            }
            bail!("frpc supervision failed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl+c shutdown signal");
        }
        _ = sigterm_future => {
            info!("received SIGTERM shutdown signal");
        }
    }

    supervisor.stop().await.context("failed to stop frpc")?;
    info!("tfarmd stopped");
    Ok(())
}

fn certs_regenerate(work_dir: &std::path::Path) -> anyhow::Result<()> {
    let store = CertStore::new(work_dir.join("tls"));
    store
        .generate_all()
        .context("failed to generate certificates")?;
    println!("Certificates written to:");
    println!("   {}", store.dir().display());
    Ok(())
}

fn certs_client(name: &str, work_dir: &std::path::Path) -> anyhow::Result<()> {
    let store = CertStore::new(work_dir.join("tls"));
    let path = store
        .issue_client(name)
        .context("failed to issue client certificate")?;
    println!("Client certificate bundle written to:");
    println!("   {}", path.display());
    Ok(())
}
