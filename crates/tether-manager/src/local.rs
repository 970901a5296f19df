//! Embedded backend: the supervisor's session registry hosted in-process.
//!
//! Used when launching a daemon is disabled (developer workstations,
//! tests). Semantics match remote mode except that sessions do not survive
//! a server restart.

use std::sync::Arc;
use tokio::sync::mpsc;

use tether_core::protocol::{GetOk, SessionEntry};
use tether_core::{TetherError, TetherResult};
use tether_supervisor::{Session, StartSpec, Subscription, Supervisor};

/// In-process session backend.
#[derive(Default)]
pub struct LocalBackend {
    supervisor: Arc<Supervisor>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    pub async fn start(&self, spec: StartSpec) -> TetherResult<Arc<Session>> {
        self.supervisor.start(spec).await
    }

    pub async fn write(&self, id: &str, bytes: &[u8]) -> TetherResult<usize> {
        self.supervisor.write(id, bytes).await
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> TetherResult<()> {
        self.supervisor.resize(id, rows, cols).await
    }

    pub async fn stop(&self, id: &str) -> TetherResult<()> {
        self.supervisor.stop(id).await
    }

    pub async fn list(&self) -> Vec<SessionEntry> {
        self.supervisor.list().await
    }

    pub async fn get(&self, id: &str) -> TetherResult<GetOk> {
        let session = self
            .supervisor
            .get(id)
            .await
            .ok_or_else(|| TetherError::NotFound(id.to_string()))?;
        Ok(GetOk {
            pid: session.pid(),
            started_at: session.started_at(),
            alive: !session.is_stopped(),
        })
    }

    pub async fn tail(&self, id: &str, max: usize) -> TetherResult<Vec<u8>> {
        self.supervisor.tail(id, max).await
    }

    pub async fn replay(&self, id: &str) -> TetherResult<Vec<u8>> {
        self.supervisor.replay(id).await
    }

    pub async fn subscribe(
        &self,
        id: &str,
    ) -> TetherResult<(mpsc::Receiver<Vec<u8>>, Subscription)> {
        let (rx, subscription, _session) = self.supervisor.subscribe(id).await?;
        Ok((rx, subscription))
    }
}
