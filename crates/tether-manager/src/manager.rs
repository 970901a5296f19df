//! The session facade: one Session API for the rest of the server,
//! regardless of whether a supervisor daemon is present.
//!
//! Mode is chosen once at startup: connect to the supervisor socket and
//! handshake (remote), replace an incompatible daemon, launch one when
//! none is running, or fall back to an embedded backend when launching is
//! disabled. Reconciliation runs immediately after.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::client::{ControlClient, RemoteStream};
use crate::local::LocalBackend;
use crate::reconcile::{self, ReconcileReport};
use crate::store::{unix_now, SessionRow, SessionStatus, SessionStore};
use tether_core::protocol::{EofReason, GetOk, SessionEntry, StartArgs, DEFAULT_TAIL_BYTES};
use tether_core::text::{last_lines, strip_ansi};
use tether_core::{paths, TetherError, TetherResult};
use tether_supervisor::daemon;
use tether_supervisor::session::StartSpec;
use tether_supervisor::Subscription;

/// How long to wait for a freshly launched daemon's socket, and for a
/// stale daemon's socket to close.
const LAUNCH_WAIT: Duration = Duration::from_secs(10);

/// Which backend the facade is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Talking to a supervisor daemon over the control socket.
    Remote,
    /// Embedded registry; sessions die with this process.
    Local,
}

/// Whether the facade may launch a supervisor daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// Launch one when none is reachable (preferred in deployments).
    Auto,
    /// Never launch; fall back to local mode.
    Never,
}

/// Facade configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub launch: LaunchPolicy,
    /// Executable to launch as the daemon; defaults to the current one,
    /// which must call [`daemon::run_daemon`] when
    /// [`daemon::is_daemon_process`] is true.
    pub supervisor_exe: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            socket_path: paths::socket_path(),
            pid_file: paths::pid_file_path(),
            launch: LaunchPolicy::Auto,
            supervisor_exe: None,
        }
    }
}

/// Hook fired once per re-adopted session to rewrite workspace-side
/// artifacts the agent expects (contents are the caller's business).
pub type ArtifactHook = Arc<dyn Fn(&SessionRow) -> std::io::Result<()> + Send + Sync>;

pub(crate) enum Backend {
    Remote(ControlClient),
    Local(LocalBackend),
}

impl Backend {
    pub(crate) async fn list(&self) -> TetherResult<Vec<SessionEntry>> {
        match self {
            Backend::Remote(client) => client.list().await,
            Backend::Local(local) => Ok(local.list().await),
        }
    }

    pub(crate) async fn get(&self, id: &str) -> TetherResult<GetOk> {
        match self {
            Backend::Remote(client) => client.get(id).await,
            Backend::Local(local) => local.get(id).await,
        }
    }
}

/// The server-side session manager.
pub struct SessionManager {
    backend: Backend,
    mode: Mode,
    store: Arc<dyn SessionStore>,
    hook: Option<ArtifactHook>,
}

impl SessionManager {
    /// Select a mode, reconcile, and return the ready facade.
    pub async fn connect(
        config: ManagerConfig,
        store: Arc<dyn SessionStore>,
        hook: Option<ArtifactHook>,
    ) -> TetherResult<Self> {
        let (backend, mode) = select_backend(&config).await?;
        if mode == Mode::Local {
            warn!("no supervisor; sessions will not survive a server restart");
        }
        let manager = Self {
            backend,
            mode,
            store,
            hook,
        };
        let report = manager.reconcile().await?;
        for id in &report.readopted {
            manager.spawn_exit_monitor(id.clone());
        }
        info!(mode = ?manager.mode, "session manager ready");
        Ok(manager)
    }

    /// Build a local-mode facade directly (tests, embedded use).
    pub fn local(store: Arc<dyn SessionStore>, hook: Option<ArtifactHook>) -> Self {
        Self {
            backend: Backend::Local(LocalBackend::new()),
            mode: Mode::Local,
            store,
            hook,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Run reconciliation against the current backend.
    pub async fn reconcile(&self) -> TetherResult<ReconcileReport> {
        reconcile::run(&self.backend, &self.store, self.hook.as_ref()).await
    }

    /// Start a session and write through to the durable row.
    pub async fn start(
        &self,
        id: &str,
        argv: Vec<String>,
        workspace: PathBuf,
        env: HashMap<String, String>,
        rows: u16,
        cols: u16,
    ) -> TetherResult<u32> {
        let row = SessionRow {
            id: id.to_string(),
            workspace: workspace.clone(),
            status: SessionStatus::Starting,
            pid: None,
            repo: None,
            stop_reason: None,
            created_at: unix_now(),
        };
        self.store.upsert(&row)?;

        let started = match &self.backend {
            Backend::Remote(client) => {
                client
                    .start(StartArgs {
                        id: id.to_string(),
                        argv,
                        cwd: workspace,
                        env,
                        rows,
                        cols,
                    })
                    .await
            }
            Backend::Local(local) => local
                .start(StartSpec {
                    id: id.to_string(),
                    argv,
                    cwd: workspace,
                    env,
                    rows,
                    cols,
                })
                .await
                .map(|session| session.pid()),
        };

        let pid = match started {
            Ok(pid) => pid,
            Err(e) => {
                self.store.set_status(id, SessionStatus::Error)?;
                return Err(e);
            }
        };
        self.store.set_pid(id, pid)?;
        self.store.set_status(id, SessionStatus::Running)?;
        self.spawn_exit_monitor(id.to_string());
        Ok(pid)
    }

    pub async fn write(&self, id: &str, bytes: &[u8]) -> TetherResult<usize> {
        match &self.backend {
            Backend::Remote(client) => client.write(id, bytes).await,
            Backend::Local(local) => local.write(id, bytes).await,
        }
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> TetherResult<()> {
        match &self.backend {
            Backend::Remote(client) => client.resize(id, rows, cols).await,
            Backend::Local(local) => local.resize(id, rows, cols).await,
        }
    }

    pub async fn stop(&self, id: &str) -> TetherResult<()> {
        match &self.backend {
            Backend::Remote(client) => client.stop(id).await,
            Backend::Local(local) => local.stop(id).await,
        }
    }

    pub async fn list(&self) -> TetherResult<Vec<SessionEntry>> {
        self.backend.list().await
    }

    /// Live sessions joined with their durable rows (absent for orphans).
    pub async fn overview(&self) -> TetherResult<Vec<(SessionEntry, Option<SessionRow>)>> {
        let entries = self.backend.list().await?;
        let mut joined = Vec::with_capacity(entries.len());
        for entry in entries {
            let row = self.store.get(&entry.id)?;
            joined.push((entry, row));
        }
        Ok(joined)
    }

    pub async fn get(&self, id: &str) -> TetherResult<GetOk> {
        self.backend.get(id).await
    }

    /// Replay snapshot, bounded by the ring cap.
    pub async fn replay(&self, id: &str) -> TetherResult<Vec<u8>> {
        match &self.backend {
            Backend::Remote(client) => client.tail(id, DEFAULT_TAIL_BYTES).await,
            Backend::Local(local) => local.replay(id).await,
        }
    }

    /// The last `max` bytes of the session's output.
    pub async fn tail(&self, id: &str, max: usize) -> TetherResult<Vec<u8>> {
        match &self.backend {
            Backend::Remote(client) => client.tail(id, max).await,
            Backend::Local(local) => local.tail(id, max).await,
        }
    }

    /// The last `n` non-blank lines of output, ANSI escapes stripped.
    pub async fn tail_lines(&self, id: &str, n: usize) -> TetherResult<Vec<String>> {
        let bytes = self.tail(id, DEFAULT_TAIL_BYTES).await?;
        let text = strip_ansi(&String::from_utf8_lossy(&bytes));
        Ok(last_lines(&text, n))
    }

    /// Follow a session's output. On an ended or unknown session the
    /// returned stream is already closed.
    pub async fn subscribe(&self, id: &str) -> TetherResult<OutputStream> {
        match &self.backend {
            Backend::Remote(client) => match client.subscribe(id).await {
                Ok(stream) => Ok(OutputStream {
                    inner: StreamInner::Remote(stream),
                }),
                Err(e) => Err(e),
            },
            Backend::Local(local) => match local.subscribe(id).await {
                Ok((rx, subscription)) => Ok(OutputStream {
                    inner: StreamInner::Local {
                        rx,
                        _subscription: subscription,
                    },
                }),
                Err(TetherError::NotFound(_)) => Ok(OutputStream {
                    inner: StreamInner::Closed,
                }),
                Err(e) => Err(e),
            },
        }
    }

    /// Watch for the session's end and mark its row stopped.
    fn spawn_exit_monitor(&self, id: String) {
        let store = self.store.clone();
        match &self.backend {
            Backend::Local(local) => {
                let supervisor = local.supervisor();
                tokio::spawn(async move {
                    let Some(session) = supervisor.get(&id).await else {
                        let _ = store.mark_stopped(&id, "exited");
                        return;
                    };
                    let summary = session.done().await;
                    let reason = if summary.signalled { "signalled" } else { "exited" };
                    if let Err(e) = store.mark_stopped(&id, reason) {
                        warn!(id = %id, error = %e, "could not record session exit");
                    }
                });
            }
            Backend::Remote(client) => {
                let client = client.clone();
                tokio::spawn(async move {
                    let mut stream = match client.subscribe(&id).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            // Leave the row alone; the next reconciliation
                            // settles it.
                            warn!(id = %id, error = %e, "exit monitor could not subscribe");
                            return;
                        }
                    };
                    while stream.recv().await.is_some() {}
                    // Only a session-exit eof means the child is gone. A
                    // supervisor shutdown or a plain disconnect ends the
                    // stream while the child lives on; reconciliation
                    // settles those rows.
                    let reason = match stream.eof_reason() {
                        Some(EofReason::Exited) => "exited",
                        Some(EofReason::Signalled) => "signalled",
                        Some(EofReason::SupervisorShutdown) | None => {
                            info!(id = %id, "subscribe stream ended without session exit");
                            return;
                        }
                    };
                    if let Err(e) = store.mark_stopped(&id, reason) {
                        warn!(id = %id, error = %e, "could not record session exit");
                    }
                });
            }
        }
    }
}

async fn select_backend(config: &ManagerConfig) -> TetherResult<(Backend, Mode)> {
    match ControlClient::connect(&config.socket_path).await {
        Ok(client) => {
            info!("connected to running supervisor");
            return Ok((Backend::Remote(client), Mode::Remote));
        }
        Err(TetherError::IncompatibleBuild { build }) => {
            warn!(stale_build = %build, "supervisor build mismatch; replacing daemon");
            if let Some(pf) = daemon::read_pid_file(&config.pid_file) {
                daemon::request_shutdown(pf.pid)?;
            }
            if !daemon::wait_socket_closed(&config.socket_path, LAUNCH_WAIT).await {
                return Err(TetherError::Unavailable(
                    "stale supervisor did not release its socket".into(),
                ));
            }
            let client = launch_and_connect(config).await?;
            Ok((Backend::Remote(client), Mode::Remote))
        }
        Err(_) => match config.launch {
            LaunchPolicy::Auto => {
                let client = launch_and_connect(config).await?;
                Ok((Backend::Remote(client), Mode::Remote))
            }
            LaunchPolicy::Never => Ok((Backend::Local(LocalBackend::new()), Mode::Local)),
        },
    }
}

async fn launch_and_connect(config: &ManagerConfig) -> TetherResult<ControlClient> {
    let exe = match &config.supervisor_exe {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };
    let pid = daemon::spawn_detached(&exe)?;
    info!(pid, exe = %exe.display(), "launched supervisor daemon");
    if !daemon::wait_socket_ready(&config.socket_path, LAUNCH_WAIT).await {
        return Err(TetherError::Unavailable(
            "launched supervisor did not open its socket".into(),
        ));
    }
    ControlClient::connect(&config.socket_path).await
}

/// A unified output stream over either backend.
pub struct OutputStream {
    inner: StreamInner,
}

enum StreamInner {
    Local {
        rx: mpsc::Receiver<Vec<u8>>,
        _subscription: Subscription,
    },
    Remote(RemoteStream),
    Closed,
}

impl OutputStream {
    /// Next output payload; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        match &mut self.inner {
            StreamInner::Local { rx, .. } => rx.recv().await,
            StreamInner::Remote(stream) => stream.recv().await,
            StreamInner::Closed => None,
        }
    }
}
