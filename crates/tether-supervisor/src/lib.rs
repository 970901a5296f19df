//! tether-supervisor: the host-level daemon that owns agent terminal
//! sessions and outlives the server.
//!
//! A [`session::Session`] couples one child process to a pseudo-terminal,
//! a bounded replay ring, and a fan-out subscriber set. The
//! [`registry::Supervisor`] is the authoritative map of live sessions; the
//! [`control::ControlServer`] exposes it over a Unix-domain socket, and
//! [`daemon`] handles pid-file bookkeeping and detached launch.

pub mod control;
pub mod daemon;
pub mod registry;
pub mod replay;
pub mod session;

pub use registry::Supervisor;
pub use session::{ExitSummary, Session, StartSpec, Subscription};
