//! Startup reconciliation: align durable session rows with the
//! supervisor's live registry.
//!
//! Runs once after mode selection. Rows whose session survived the restart
//! are re-adopted (pid refreshed, workspace artifacts re-emitted); rows
//! whose session is gone are marked stopped with reason `supervisor-lost`;
//! live sessions without a row are orphans and are left running.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::manager::{ArtifactHook, Backend};
use crate::store::{SessionStatus, SessionStore};
use tether_core::TetherResult;

/// Reason recorded on rows whose session did not survive.
pub const REASON_SUPERVISOR_LOST: &str = "supervisor-lost";

/// What reconciliation did.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    /// Rows whose session is still live; pid refreshed, hook fired.
    pub readopted: Vec<String>,
    /// Rows marked stopped with reason `supervisor-lost`.
    pub lost: Vec<String>,
    /// Live session ids with no durable row; left running.
    pub orphans: Vec<String>,
}

pub(crate) async fn run(
    backend: &Backend,
    store: &Arc<dyn SessionStore>,
    hook: Option<&ArtifactHook>,
) -> TetherResult<ReconcileReport> {
    let rows = store.active()?;
    let live = backend.list().await?;
    let live_ids: HashSet<&str> = live.iter().map(|e| e.id.as_str()).collect();

    let mut report = ReconcileReport::default();

    for row in rows {
        if live_ids.contains(row.id.as_str()) {
            let detail = backend.get(&row.id).await?;
            store.set_pid(&row.id, detail.pid)?;
            store.set_status(&row.id, SessionStatus::Running)?;
            if let Some(hook) = hook {
                if let Err(e) = (hook.as_ref())(&row) {
                    warn!(id = %row.id, error = %e, "artifact re-emit failed");
                }
            }
            info!(id = %row.id, pid = detail.pid, "re-adopted session");
            report.readopted.push(row.id);
        } else {
            store.mark_stopped(&row.id, REASON_SUPERVISOR_LOST)?;
            info!(id = %row.id, "session lost with supervisor");
            report.lost.push(row.id);
        }
    }

    // Never kill a session this server does not own.
    for entry in &live {
        if store.get(&entry.id)?.is_none() {
            warn!(id = %entry.id, pid = entry.pid, "orphan session without durable row; leaving running");
            report.orphans.push(entry.id.clone());
        }
    }

    info!(
        readopted = report.readopted.len(),
        lost = report.lost.len(),
        orphans = report.orphans.len(),
        "reconciliation complete"
    );
    Ok(report)
}
