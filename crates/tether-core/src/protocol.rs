//! Control protocol message types.
//!
//! One JSON object per frame. Requests carry a per-connection monotonically
//! increasing correlation id which every reply and stream frame echoes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{TetherError, TetherResult};

/// Protocol version carried in the Hello frame. Bumped on breaking changes
/// that the build fingerprint alone should not gate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default byte budget for a Tail request.
pub const DEFAULT_TAIL_BYTES: usize = 100 * 1024;

/// Which side of the control socket sent a Hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Daemon,
}

/// Handshake payload: first frame in each direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub role: Role,
    pub build: String,
    pub proto: u32,
}

/// Wire wrapper producing `{"hello":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloFrame {
    pub hello: Hello,
}

impl HelloFrame {
    pub fn new(role: Role, build: impl Into<String>) -> Self {
        Self {
            hello: Hello {
                role,
                build: build.into(),
                proto: PROTOCOL_VERSION,
            },
        }
    }
}

/// A control request: correlation id plus operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Op,
}

/// Control operations, tagged as `{"op":"...","args":{...}}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Op {
    Start(StartArgs),
    Write(WriteArgs),
    Resize(ResizeArgs),
    Stop(SessionRef),
    List,
    Get(SessionRef),
    Tail(TailArgs),
    Subscribe(SessionRef),
    Unsubscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartArgs {
    pub id: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteArgs {
    pub id: String,
    /// Base64-encoded bytes.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeArgs {
    pub id: String,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailArgs {
    pub id: String,
    #[serde(default = "default_tail_max")]
    pub max: usize,
}

fn default_tail_max() -> usize {
    DEFAULT_TAIL_BYTES
}

/// A control reply or stream frame.
///
/// The correlation id is absent only on the handshake rejection frame,
/// which is emitted before any request has been read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub body: ReplyBody,
}

/// Reply bodies: `{"ok":...}`, `{"error":{...}}`, or `{"stream":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyBody {
    Ok(serde_json::Value),
    Error(WireError),
    Stream(StreamFrame),
}

/// Wire-level error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StartFailed,
    IdInUse,
    NotFound,
    Closed,
    IncompatibleBuild,
    SupervisorUnavailable,
    UnknownOp,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// The daemon's build fingerprint, present on `incompatible_build`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

/// One frame of a Subscribe stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eof: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EofReason>,
}

/// Why a Subscribe stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EofReason {
    Exited,
    Signalled,
    SupervisorShutdown,
}

// Typed `ok` payloads. The generic reply carries them as a JSON value; the
// endpoints serialize and deserialize against these shapes.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedOk {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrittenOk {
    pub n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: String,
    pub pid: u32,
    /// Unix seconds.
    pub started_at: u64,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOk {
    pub pid: u32,
    pub started_at: u64,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailOk {
    /// Base64-encoded bytes.
    pub data: String,
}

impl Reply {
    /// Build an `ok` reply from a typed payload.
    pub fn ok<T: Serialize>(id: u64, payload: &T) -> TetherResult<Self> {
        let value =
            serde_json::to_value(payload).map_err(|e| TetherError::Codec(e.to_string()))?;
        Ok(Self {
            id: Some(id),
            body: ReplyBody::Ok(value),
        })
    }

    /// Build an error reply for a request.
    pub fn error(id: u64, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            body: ReplyBody::Error(WireError {
                kind,
                msg: Some(msg.into()),
                build: None,
            }),
        }
    }

    /// Build the handshake rejection frame (no correlation id yet).
    pub fn incompatible_build(build: impl Into<String>) -> Self {
        Self {
            id: None,
            body: ReplyBody::Error(WireError {
                kind: ErrorKind::IncompatibleBuild,
                msg: None,
                build: Some(build.into()),
            }),
        }
    }

    /// Build a stream frame carrying the given payload.
    pub fn stream_data(id: u64, seq: u64, data: &[u8]) -> Self {
        Self {
            id: Some(id),
            body: ReplyBody::Stream(StreamFrame {
                seq,
                data: Some(b64_encode(data)),
                eof: None,
                reason: None,
            }),
        }
    }

    /// Build the terminal stream frame.
    pub fn stream_eof(id: u64, seq: u64, reason: EofReason) -> Self {
        Self {
            id: Some(id),
            body: ReplyBody::Stream(StreamFrame {
                seq,
                data: None,
                eof: Some(true),
                reason: Some(reason),
            }),
        }
    }
}

/// Base64-encode bytes for a `data` field.
pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode a `data` field.
pub fn b64_decode(data: &str) -> TetherResult<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| TetherError::Codec(format!("invalid base64: {e}")))
}

/// Whether `id` is a valid session identifier: 1-64 bytes of
/// `[A-Za-z0-9._-]`.
pub fn validate_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}
