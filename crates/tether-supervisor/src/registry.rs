//! The session registry: the only authoritative view of live children.
//!
//! Sessions are inserted by Start and removed by a per-session reap
//! watcher when the exit signal fires. Everything else the durable layer
//! believes about liveness is a soft cache reconciled against this map.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::session::{Session, StartSpec, Subscription};
use tether_core::protocol::{validate_session_id, SessionEntry};
use tether_core::{TetherError, TetherResult};

/// Registry of live sessions, keyed by caller-chosen identifier.
#[derive(Default)]
pub struct Supervisor {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    /// Ids reserved by in-flight Start calls, so the registry lock is not
    /// held across the blocking pty/exec work.
    starting: Mutex<HashSet<String>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch a session. The id must be unique among live sessions; the
    /// call returns after the child is running and the reader has posted
    /// its first read.
    pub async fn start(&self, spec: StartSpec) -> TetherResult<Arc<Session>> {
        if !validate_session_id(&spec.id) {
            return Err(TetherError::StartFailed(format!(
                "invalid session id: {:?}",
                spec.id
            )));
        }
        let id = spec.id.clone();
        {
            let sessions = self.sessions.read().await;
            let mut starting = self
                .starting
                .lock()
                .map_err(|_| TetherError::Internal("start reservation lock poisoned".into()))?;
            if sessions.contains_key(&id) || !starting.insert(id.clone()) {
                return Err(TetherError::IdInUse(id));
            }
        }

        // Pty allocation and exec are blocking syscalls; run them off the
        // async workers with no registry lock held.
        let spawned = tokio::task::spawn_blocking(move || Session::spawn(spec))
            .await
            .map_err(|e| TetherError::Internal(format!("join error: {e}")));
        let (session, ready) = match spawned {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) | Err(e) => {
                self.release_reservation(&id);
                return Err(e);
            }
        };

        self.sessions
            .write()
            .await
            .insert(id.clone(), session.clone());
        self.release_reservation(&id);

        // Reap watcher: drop the registry entry when the child is gone.
        let map = self.sessions.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.done().await;
            map.write().await.remove(watched.id());
            info!(id = %watched.id(), "session removed from registry");
        });

        let _ = ready.await;
        Ok(session)
    }

    fn release_reservation(&self, id: &str) {
        if let Ok(mut starting) = self.starting.lock() {
            starting.remove(id);
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<SessionEntry> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<SessionEntry> = sessions
            .values()
            .map(|s| SessionEntry {
                id: s.id().to_string(),
                pid: s.pid(),
                started_at: s.started_at(),
                alive: !s.is_stopped(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub async fn write(&self, id: &str, bytes: &[u8]) -> TetherResult<usize> {
        let session = self.require(id).await?;
        session.write(bytes).await
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> TetherResult<()> {
        let session = self.require(id).await?;
        session.resize(rows, cols)
    }

    /// Request termination. Repeated calls on a live session are no-ops;
    /// an id absent from the registry is `NotFound`.
    pub async fn stop(&self, id: &str) -> TetherResult<()> {
        let session = self.require(id).await?;
        session.stop();
        Ok(())
    }

    pub async fn tail(&self, id: &str, max: usize) -> TetherResult<Vec<u8>> {
        let session = self.require(id).await?;
        Ok(session.tail(max))
    }

    pub async fn replay(&self, id: &str) -> TetherResult<Vec<u8>> {
        let session = self.require(id).await?;
        Ok(session.replay())
    }

    pub async fn subscribe(
        &self,
        id: &str,
    ) -> TetherResult<(mpsc::Receiver<Vec<u8>>, Subscription, Arc<Session>)> {
        let session = self.require(id).await?;
        let (rx, subscription) = session.subscribe();
        Ok((rx, subscription, session))
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn require(&self, id: &str) -> TetherResult<Arc<Session>> {
        self.get(id)
            .await
            .ok_or_else(|| TetherError::NotFound(id.to_string()))
    }
}
