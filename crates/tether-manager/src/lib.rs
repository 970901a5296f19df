//! tether-manager: the server-side session facade.
//!
//! Presents one Session API to the rest of the server whether a supervisor
//! daemon is reachable (remote mode) or the sessions are embedded in this
//! process (local mode). On startup it reconciles durable session rows
//! against the supervisor's live registry.

pub mod client;
pub mod local;
pub mod manager;
pub mod reconcile;
pub mod store;

pub use client::ControlClient;
pub use local::LocalBackend;
pub use manager::{
    ArtifactHook, LaunchPolicy, ManagerConfig, Mode, OutputStream, SessionManager,
};
pub use reconcile::ReconcileReport;
pub use store::{MemoryStore, SessionRow, SessionStatus, SessionStore, SqliteStore};
