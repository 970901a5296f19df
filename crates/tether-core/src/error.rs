use crate::protocol::ErrorKind;
use thiserror::Error;

/// Errors produced by the tether session runtime.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("start failed: {0}")]
    StartFailed(String),

    #[error("session id already in use: {0}")]
    IdInUse(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session closed")]
    Closed,

    #[error("incompatible supervisor build: {build}")]
    IncompatibleBuild { build: String },

    #[error("supervisor unavailable: {0}")]
    Unavailable(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TetherError {
    /// The wire-level error kind this error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TetherError::StartFailed(_) => ErrorKind::StartFailed,
            TetherError::IdInUse(_) => ErrorKind::IdInUse,
            TetherError::NotFound(_) => ErrorKind::NotFound,
            TetherError::Closed => ErrorKind::Closed,
            TetherError::IncompatibleBuild { .. } => ErrorKind::IncompatibleBuild,
            TetherError::Unavailable(_) => ErrorKind::SupervisorUnavailable,
            TetherError::Codec(_)
            | TetherError::Store(_)
            | TetherError::Io(_)
            | TetherError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Reconstruct an error from a wire error kind and optional message.
    pub fn from_wire(kind: ErrorKind, msg: Option<String>, build: Option<String>) -> Self {
        let msg = msg.unwrap_or_default();
        match kind {
            ErrorKind::StartFailed => TetherError::StartFailed(msg),
            ErrorKind::IdInUse => TetherError::IdInUse(msg),
            ErrorKind::NotFound => TetherError::NotFound(msg),
            ErrorKind::Closed => TetherError::Closed,
            ErrorKind::IncompatibleBuild => TetherError::IncompatibleBuild {
                build: build.unwrap_or_default(),
            },
            ErrorKind::SupervisorUnavailable => TetherError::Unavailable(msg),
            ErrorKind::UnknownOp => TetherError::Internal("unknown op".into()),
            ErrorKind::Internal => TetherError::Internal(msg),
        }
    }
}

pub type TetherResult<T> = Result<T, TetherError>;
