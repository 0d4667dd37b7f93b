//! frpc process lifecycle supervisor.
//!
//! Owns the managed child process: start, graceful stop with a bounded
//! timeout, restart-with-reconfigure, and the auto-restart loop that is the
//! daemon's availability guarantee. All state transitions go through this
//! type; nothing else touches the child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::credentials::{CredentialError, CredentialStore};
use crate::frpc::config::{self, CONFIG_FILE, ConfigError};
use crate::frpc::status::{self, StatusError};

#[cfg(unix)]
use libc::{SIGINT, SIGKILL};
#[cfg(not(unix))]
const SIGINT: i32 = 2;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Grace window between SIGINT and SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff before the supervision loop relaunches a crashed child.
const RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("frpc already running")]
    AlreadyRunning,

    #[error("Failed to spawn frpc: {0}")]
    Spawn(String),

    #[error("frpc exited unexpectedly: {0}")]
    UnexpectedExit(String),

    #[error("frpc {subcommand} failed: {detail}")]
    Subcommand { subcommand: String, detail: String },

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Live-process tag. "Is a process live" is a match on this variant, never a
/// null check.
#[derive(Debug, Clone, Copy)]
enum ProcessSlot {
    Absent,
    Running { pid: u32 },
}

/// Supervisor for the managed frpc process.
pub struct FrpcSupervisor {
    bin_path: PathBuf,
    work_dir: PathBuf,
    slot: std::sync::Mutex<ProcessSlot>,
    /// Suppresses crash reporting while an intentional restart is stopping
    /// the child.
    restarting: AtomicBool,
    /// Exit notifications consumed by [`Self::stop`].
    exit_tx: mpsc::Sender<()>,
    exit_rx: Mutex<mpsc::Receiver<()>>,
    /// Unexpected-exit and spawn errors, consumed by the supervision loop.
    err_tx: mpsc::UnboundedSender<SupervisorError>,
    err_rx: Mutex<mpsc::UnboundedReceiver<SupervisorError>>,
    /// Unrecoverable loop errors, observed by the daemon's control loop.
    fatal_tx: mpsc::UnboundedSender<SupervisorError>,
}

impl FrpcSupervisor {
    /// Create a supervisor. Errors the supervision loop cannot recover from
    /// are forwarded to `fatal_tx`; the daemon's control loop decides what to
    /// do with them.
    pub fn new(
        bin_path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        fatal_tx: mpsc::UnboundedSender<SupervisorError>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        Self {
            bin_path: bin_path.into(),
            work_dir: work_dir.into(),
            slot: std::sync::Mutex::new(ProcessSlot::Absent),
            restarting: AtomicBool::new(false),
            exit_tx,
            exit_rx: Mutex::new(exit_rx),
            err_tx,
            err_rx: Mutex::new(err_rx),
            fatal_tx,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Whether a live child handle exists right now.
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_slot(), ProcessSlot::Running { .. })
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, ProcessSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch the managed binary and the task that waits on it.
    ///
    /// Fails with [`SupervisorError::AlreadyRunning`] when a live handle
    /// exists; concurrent starts never queue.
    pub fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        info!("starting frpc");

        let mut slot = self.lock_slot();
        if let ProcessSlot::Running { pid } = *slot {
            debug!(pid, "start refused, frpc already running");
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut child = Command::new(&self.bin_path)
            .arg("-c")
            .arg(CONFIG_FILE)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("child exited before startup".to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_log_drain(stdout, "frpc stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_drain(stderr, "frpc stderr");
        }

        *slot = ProcessSlot::Running { pid };
        drop(slot);

        self.spawn_monitor(child);
        info!(pid, "frpc started");
        Ok(())
    }

    /// Start asynchronously; a spawn failure is reported on the error channel
    /// instead of the caller, like an unexpected exit.
    pub fn start_and_wait(self: &Arc<Self>) {
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = sup.start() {
                let _ = sup.err_tx.send(e);
            }
        });
    }

    /// Waits for the child to exit; clears the slot and routes the exit to
    /// the right channel depending on whether a restart is in flight.
    fn spawn_monitor(self: &Arc<Self>, mut child: Child) {
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            let result = child.wait().await;
            *sup.lock_slot() = ProcessSlot::Absent;

            // Snapshot the flag before signalling: the exit notification
            // unblocks stop(), after which restart() clears the flag.
            let restarting = sup.restarting.load(Ordering::SeqCst);
            let _ = sup.exit_tx.try_send(());

            if restarting {
                // Expected exit during an intentional restart.
                return;
            }
            let detail = match result {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            let _ = sup.err_tx.send(SupervisorError::UnexpectedExit(detail));
        });
    }

    /// Gracefully stop the child: SIGINT, then SIGKILL after the grace
    /// window. A stop with no live process is a no-op with a warning.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        info!("stopping frpc");

        let pid = match *self.lock_slot() {
            ProcessSlot::Running { pid } => pid,
            ProcessSlot::Absent => {
                warn!("frpc not running, nothing to stop");
                return Ok(());
            }
        };

        let mut exit_rx = self.exit_rx.lock().await;
        // Discard notifications from earlier exits.
        while exit_rx.try_recv().is_ok() {}

        if !send_signal(pid, SIGINT)? {
            info!(pid, "frpc already exited");
            return Ok(());
        }

        match tokio::time::timeout(STOP_TIMEOUT, exit_rx.recv()).await {
            Ok(_) => info!("frpc exited gracefully"),
            Err(_) => {
                warn!(
                    "frpc did not exit gracefully after {}s, killing",
                    STOP_TIMEOUT.as_secs()
                );
                if send_signal(pid, SIGKILL)? {
                    let _ = exit_rx.recv().await;
                }
                info!("frpc killed");
            }
        }
        Ok(())
    }

    /// Stop, reload credentials, re-sign the config, start again.
    ///
    /// Stop completes before signing and signing completes before the new
    /// start; a failure in either phase leaves the process stopped.
    pub async fn restart(self: &Arc<Self>, store: &CredentialStore) -> Result<(), SupervisorError> {
        info!("restarting frpc");

        self.restarting.store(true, Ordering::SeqCst);
        let stopped = self.stop().await;
        self.restarting.store(false, Ordering::SeqCst);
        stopped?;

        let creds = store.wait_for_credentials().await?;
        config::sign_config_file(&self.work_dir, &creds)?;

        self.start_and_wait();
        Ok(())
    }

    /// Background supervision loop: wait for credentials, sign, start, and
    /// relaunch with a fixed backoff whenever the child dies unexpectedly.
    /// Never terminates on its own; credential or signing failures are
    /// forwarded to the fatal channel.
    pub fn start_loop(self: &Arc<Self>, store: Arc<CredentialStore>) {
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let creds = match store.wait_for_credentials().await {
                    Ok(creds) => creds,
                    Err(e) => {
                        let _ = sup.fatal_tx.send(e.into());
                        return;
                    }
                };
                if let Err(e) = config::sign_config_file(&sup.work_dir, &creds) {
                    let _ = sup.fatal_tx.send(e.into());
                    return;
                }

                sup.start_and_wait();

                loop {
                    let err = sup.err_rx.lock().await.recv().await;
                    match err {
                        // A restart() can race this loop's start; the loser
                        // reports AlreadyRunning. The child is healthy, so
                        // keep watching instead of entering crash backoff.
                        Some(SupervisorError::AlreadyRunning) => {
                            debug!("start raced a live frpc, keeping the running child");
                        }
                        Some(err) => {
                            error!(error = %err, "frpc exited");
                            info!("restarting frpc in {}s", RESTART_BACKOFF.as_secs());
                            tokio::time::sleep(RESTART_BACKOFF).await;
                            break;
                        }
                        // Channel closed: supervisor is being torn down.
                        None => return,
                    }
                }
            }
        });
    }

    /// Invoke the managed binary in one-shot mode (`verify`, `reload`)
    /// against the existing config file and return captured stdout.
    pub async fn output(&self, subcommand: &str) -> Result<Vec<u8>, SupervisorError> {
        let output = Command::new(&self.bin_path)
            .arg(subcommand)
            .arg("-c")
            .arg(CONFIG_FILE)
            .current_dir(&self.work_dir)
            .output()
            .await
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

        if !output.status.success() {
            return Err(SupervisorError::Subcommand {
                subcommand: subcommand.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Poll the child's admin endpoint and render the proxy-status table.
    pub async fn status(&self) -> Result<String, StatusError> {
        status::fetch_status(&self.work_dir).await
    }
}

/// Drain a child stream line by line into the daemon log.
fn spawn_log_drain(stream: impl AsyncRead + Unpin + Send + 'static, prefix: &'static str) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("{prefix}: {line}");
        }
        debug!("{prefix} drain finished");
    });
}

/// Send a signal to the child. Returns `Ok(false)` when the process is
/// already gone.
#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<bool, SupervisorError> {
    // SAFETY: pid is a valid process ID obtained from our own Child handle.
    // kill(2) is safe to call on any owned subprocess.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, signal) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err.into())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) -> Result<bool, SupervisorError> {
    Ok(false)
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::frpc::config::FrpcConfig;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write an executable stub standing in for the frpc binary.
    fn write_stub(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("frpc");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const LONG_RUNNING: &str = "#!/bin/sh\ntrap 'exit 0' INT TERM\nwhile true; do sleep 0.05; done\n";

    fn supervisor(bin: &Path, work_dir: &Path) -> Arc<FrpcSupervisor> {
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        Arc::new(FrpcSupervisor::new(bin, work_dir, fatal_tx))
    }

    #[tokio::test]
    async fn start_then_graceful_stop() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), LONG_RUNNING);
        let sup = supervisor(&bin, dir.path());

        sup.start().unwrap();
        assert!(sup.is_running());

        sup.stop().await.unwrap();
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn concurrent_start_fails_instead_of_queueing() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), LONG_RUNNING);
        let sup = supervisor(&bin, dir.path());

        sup.start().unwrap();
        assert!(matches!(
            sup.start(),
            Err(SupervisorError::AlreadyRunning)
        ));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_on_stopped_supervisor_is_noop() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), LONG_RUNNING);
        let sup = supervisor(&bin, dir.path());

        assert!(!sup.is_running());
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(Path::new("/nonexistent/frpc"), dir.path());
        assert!(matches!(sup.start(), Err(SupervisorError::Spawn(_))));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn unexpected_exit_reaches_error_channel() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), "#!/bin/sh\nexit 1\n");
        let sup = supervisor(&bin, dir.path());

        sup.start_and_wait();
        let err = sup.err_rx.lock().await.recv().await.unwrap();
        assert!(matches!(err, SupervisorError::UnexpectedExit(_)));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn restart_failure_leaves_supervisor_stopped() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), LONG_RUNNING);
        let sup = supervisor(&bin, dir.path());

        let store = CredentialStore::new(dir.path());
        store
            .write(&Credentials {
                client_id: "client-1".to_string(),
                client_secret: "c2VjcmV0".to_string(),
                client_ca_cert: None,
                client_tls_cert: None,
                client_tls_key: None,
            })
            .await
            .unwrap();

        sup.start().unwrap();
        // No frpc.ini in the workdir: the signing phase must fail and the
        // child must stay stopped.
        assert!(sup.restart(&store).await.is_err());
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn restart_resigns_and_relaunches() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), LONG_RUNNING);
        let sup = supervisor(&bin, dir.path());

        let store = CredentialStore::new(dir.path());
        store
            .write(&Credentials {
                client_id: "client-1".to_string(),
                client_secret: "c2VjcmV0".to_string(),
                client_ca_cert: None,
                client_tls_cert: None,
                client_tls_key: None,
            })
            .await
            .unwrap();
        FrpcConfig::default()
            .save(&FrpcConfig::path(dir.path()))
            .unwrap();

        sup.start().unwrap();
        sup.restart(&store).await.unwrap();

        // The new child comes up asynchronously.
        for _ in 0..50 {
            if sup.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(sup.is_running());

        let cfg = FrpcConfig::load(&FrpcConfig::path(dir.path())).unwrap();
        assert_eq!(cfg.metas["client_id"], "client-1");
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn configure_restart_race_keeps_child_running() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), LONG_RUNNING);
        let sup = supervisor(&bin, dir.path());

        let store = Arc::new(CredentialStore::new(dir.path()));
        store
            .write(&Credentials {
                client_id: "client-1".to_string(),
                client_secret: "c2VjcmV0".to_string(),
                client_ca_cert: None,
                client_tls_cert: None,
                client_tls_key: None,
            })
            .await
            .unwrap();
        FrpcConfig::default()
            .save(&FrpcConfig::path(dir.path()))
            .unwrap();

        // First configure: restart() stops nothing and spawns a start while
        // the supervision loop, unblocked by the new credentials, spawns its
        // own. The loser's AlreadyRunning must not push the loop into its
        // crash backoff.
        sup.restart(&store).await.unwrap();
        sup.start_loop(Arc::clone(&store));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sup.is_running());
        // The loop is parked on the error channel, not cycling restarts.
        assert!(sup.err_rx.try_lock().is_err());

        // Tear down while the loop sits in its backoff, so no child leaks.
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_restarts_emit_no_spurious_exit_errors() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), LONG_RUNNING);
        let sup = supervisor(&bin, dir.path());

        let store = CredentialStore::new(dir.path());
        store
            .write(&Credentials {
                client_id: "client-1".to_string(),
                client_secret: "c2VjcmV0".to_string(),
                client_ca_cert: None,
                client_tls_cert: None,
                client_tls_key: None,
            })
            .await
            .unwrap();
        FrpcConfig::default()
            .save(&FrpcConfig::path(dir.path()))
            .unwrap();

        sup.start().unwrap();
        for _ in 0..10 {
            sup.restart(&store).await.unwrap();
            for _ in 0..100 {
                if sup.is_running() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(sup.is_running());
        }

        // Every exit above was intentional; none may surface as a crash.
        assert!(sup.err_rx.lock().await.try_recv().is_err());
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_kills_child_ignoring_sigint() {
        let dir = TempDir::new().unwrap();
        // Ignores INT entirely; only SIGKILL can take it down.
        let bin = write_stub(dir.path(), "#!/bin/sh\ntrap '' INT\nwhile true; do sleep 0.05; done\n");
        let sup = supervisor(&bin, dir.path());

        sup.start().unwrap();
        sup.stop().await.unwrap();
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn output_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), "#!/bin/sh\necho \"ok: $1\"\n");
        let sup = supervisor(&bin, dir.path());

        let out = sup.output("verify").await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "ok: verify\n");
    }

    #[tokio::test]
    async fn output_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let bin = write_stub(dir.path(), "#!/bin/sh\necho 'bad config' >&2\nexit 1\n");
        let sup = supervisor(&bin, dir.path());

        match sup.output("verify").await {
            Err(SupervisorError::Subcommand { subcommand, detail }) => {
                assert_eq!(subcommand, "verify");
                assert_eq!(detail, "bad config");
            }
            other => panic!("expected subcommand error, got {other:?}"),
        }
    }
}
