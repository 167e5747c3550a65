//! Error types shared across the debugger client.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of the debugger client.
///
/// Transport errors end the connection. Every other variant is local to
/// the call that returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// I/O failure, malformed frame, or handshake failure.
    Transport(String),
    /// Decode failure: missing or ill-typed field, unresolved discriminant.
    Protocol(String),
    /// The remote answered `success:false` to a request.
    RemoteCommand(String),
    /// Use of an invalidated context, double attach, non-attached connection.
    State(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O failure outside of the connection.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::RemoteCommand(msg) => write!(f, "remote command failed: {msg}"),
            Self::State(msg) => write!(f, "state: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}
