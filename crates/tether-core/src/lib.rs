//! tether-core: Shared protocol library for the tether session runtime.
//!
//! Provides the error taxonomy, length-prefixed JSON framing, control
//! protocol message types, build fingerprinting, well-known filesystem
//! paths, and terminal text helpers.

pub mod codec;
pub mod error;
pub mod fingerprint;
pub mod paths;
pub mod protocol;
pub mod text;

// Re-export commonly used items at crate root.
pub use codec::{frame_encode, read_frame, write_frame, MAX_FRAME_LEN};
pub use error::{TetherError, TetherResult};
pub use fingerprint::build_fingerprint;
pub use protocol::{validate_session_id, ErrorKind, PROTOCOL_VERSION};
