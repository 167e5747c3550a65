//! Byte-stream transport to the remote debugger.
//!
//! - `message`: [`Message`] model and the `Content-Length` framing codec.
//! - `handshake`: greeting exchange run before framed traffic.
//! - `shutdown`: fire-once shutdown relay shared by the connection tasks.
//! - `connection`: reader, dispatch and writer tasks plus the public
//!   [`Connection`] handle.

pub mod connection;
pub mod handshake;
pub mod message;
pub mod shutdown;

pub use connection::{Connection, ConnectionOptions, NetListener};
pub use handshake::{Handshake, RemoteInfo};
pub use message::{Message, MessageCodec};
pub use shutdown::{ShutdownMode, ShutdownSignal};
