//! Daemon lifecycle: pid-file, liveness, detached launch, graceful exit.
//!
//! The supervisor is launched by re-executing the current binary with a
//! marker variable in its environment, in a new session with stdio
//! redirected to a log file. No service manager is assumed. The pid-file
//! carries the pid and the build fingerprint so a newer server can detect
//! an incompatible daemon without connecting.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::control::ControlServer;
use crate::registry::Supervisor;
use tether_core::{build_fingerprint, paths, TetherError, TetherResult};

/// Environment marker: set on the child process that should run as the
/// supervisor daemon.
pub const DAEMON_ENV: &str = "TETHER_SUPERVISOR";

/// Parsed pid-file contents: decimal pid, then build fingerprint.
#[derive(Debug, Clone)]
pub struct PidFile {
    pub pid: u32,
    pub build: String,
}

/// Parse a pid-file. `None` when missing or malformed.
pub fn read_pid_file(path: &Path) -> Option<PidFile> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    let pid = lines.next()?.trim().parse().ok()?;
    let build = lines.next()?.trim().to_string();
    if build.is_empty() {
        return None;
    }
    Some(PidFile { pid, build })
}

/// Write the pid-file via temp-file-plus-rename so readers never observe a
/// partial file.
pub fn write_pid_file(path: &Path, pid: u32, build: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, format!("{pid}\n{build}\n"))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Whether the given pid names a live process we may signal.
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// The supervisor referenced by the pid-file, if it is actually running.
pub fn running_supervisor(pid_path: &Path) -> Option<PidFile> {
    let pf = read_pid_file(pid_path)?;
    pid_alive(pf.pid).then_some(pf)
}

/// Whether this process was launched as the daemon.
pub fn is_daemon_process() -> bool {
    std::env::var_os(DAEMON_ENV).is_some()
}

/// Fork a detached supervisor from the given executable: new session, new
/// process group, stdio to the daemon log. Returns the child pid without
/// waiting for it.
pub fn spawn_detached(exe: &Path) -> std::io::Result<u32> {
    let log_path = paths::log_file_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let log_err = log.try_clone()?;

    let mut cmd = std::process::Command::new(exe);
    cmd.env(DAEMON_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .current_dir("/");
    // Safety: setsid is async-signal-safe and the closure touches nothing
    // else before exec.
    unsafe {
        cmd.pre_exec(|| {
            if nix::libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = cmd.spawn()?;
    Ok(child.id())
}

/// Ask a supervisor to exit gracefully. Its sessions keep running.
pub fn request_shutdown(pid: u32) -> TetherResult<()> {
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| TetherError::Internal(format!("signal supervisor {pid}: {e}")))
}

/// Poll until nothing accepts on the socket path, or the deadline passes.
pub async fn wait_socket_closed(path: &Path, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        match tokio::net::UnixStream::connect(path).await {
            Ok(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            Err(_) => return true,
        }
    }
    false
}

/// Poll until the socket path accepts a connection, or the deadline passes.
pub async fn wait_socket_ready(path: &Path, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Daemon entry point: claim the pid-file, serve the control socket, and
/// on SIGTERM/SIGINT close the control plane while leaving every session's
/// child process running.
pub async fn run_daemon() -> TetherResult<()> {
    run_daemon_at(&paths::pid_file_path(), paths::socket_path()).await
}

/// As [`run_daemon`], with explicit paths (used by tests).
pub async fn run_daemon_at(pid_path: &Path, socket_path: PathBuf) -> TetherResult<()> {
    if let Some(existing) = running_supervisor(pid_path) {
        if existing.pid != std::process::id() {
            return Err(TetherError::Internal(format!(
                "supervisor already running (pid {})",
                existing.pid
            )));
        }
    }
    let build = build_fingerprint();
    let pid = std::process::id();
    write_pid_file(pid_path, pid, build)?;
    info!(pid, build, "supervisor started");

    let supervisor = Arc::new(Supervisor::new());
    let server = ControlServer::new(supervisor, socket_path);
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!("shutdown signal received; sessions are left running");
        let _ = shutdown.send(());
    });

    let result = server.run().await;
    if let Err(e) = std::fs::remove_file(pid_path) {
        warn!(error = %e, "could not remove pid-file");
    }
    info!("supervisor stopped");
    result
}
