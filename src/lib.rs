#![forbid(unsafe_code)]

//! Client engine for the V8 remote debugging protocol.
//!
//! - [`transport`]: framed duplex connection with handshake and shutdown.
//! - [`dispatch`]: sequence numbers, response correlation, async results.
//! - [`protocol`]: declarative JSON schemas and lazily decoded objects.
//! - [`session`]: the debug session state machine.

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::DebuggerConfig;
pub use errors::{AppError, Result};
pub use session::{DebugEventListener, DebugSession};
