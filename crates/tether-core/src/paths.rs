//! Well-known filesystem locations for the supervisor's on-disk footprint:
//! the control socket, the pid-file, and the daemon log.

use std::path::PathBuf;

/// Per-user state directory (`~/.tether`, `/tmp/.tether` without a home).
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".tether")
}

/// Control socket path.
pub fn socket_path() -> PathBuf {
    state_dir().join("supervisor.sock")
}

/// Pid-file path.
pub fn pid_file_path() -> PathBuf {
    state_dir().join("supervisor.pid")
}

/// Daemon log path (the launcher redirects the daemon's stdio here).
pub fn log_file_path() -> PathBuf {
    state_dir().join("supervisor.log")
}
