//! tetherd — the session supervisor daemon.
//!
//! Launched detached by the server (or by hand). Takes no arguments: the
//! socket, pid-file, and log live at well-known paths in the per-user
//! state directory. SIGTERM closes the control plane without touching any
//! session's child process.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = tether_core::build_fingerprint(),
        "starting tetherd"
    );

    if let Err(e) = tether_supervisor::daemon::run_daemon().await {
        error!(error = %e, "supervisor failed");
        std::process::exit(1);
    }
}
