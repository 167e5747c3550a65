//! Debugger client configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Which greeting the remote expects before message exchange starts.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeKind {
    /// Browser-style literal line greeting in both directions.
    #[default]
    Chrome,
    /// Standalone V8: one framed message carrying version headers.
    StandaloneV8,
}

/// Session-level request options.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Request script source text together with script descriptors.
    #[serde(default = "default_true")]
    pub include_source: bool,
    /// Ask the remote to inline referenced handles in responses.
    #[serde(default = "default_true")]
    pub inline_refs: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            include_source: true,
            inline_refs: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    9222
}

fn default_lameduck_millis() -> u64 {
    1000
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

/// Top-level configuration parsed from `debugger.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DebuggerConfig {
    /// Remote debugger host name or address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Remote debugger TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Greeting variant performed before framed traffic.
    #[serde(default)]
    pub handshake: HandshakeKind,
    /// Graceful shutdown wait before the connection is torn down hard.
    #[serde(default = "default_lameduck_millis")]
    pub lameduck_millis: u64,
    /// Largest inbound frame payload accepted.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Reject JSON properties that no schema declares.
    #[serde(default)]
    pub strict_parsing: bool,
    /// Session request options.
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            handshake: HandshakeKind::default(),
            lameduck_millis: default_lameduck_millis(),
            max_frame_bytes: default_max_frame_bytes(),
            strict_parsing: false,
            session: SessionConfig::default(),
        }
    }
}

impl DebuggerConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read, or
    /// `AppError::Config` if it contains invalid TOML or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Io(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// `host:port` pair suitable for a TCP connect.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Lameduck delay as a [`Duration`].
    #[must_use]
    pub fn lameduck_delay(&self) -> Duration {
        Duration::from_millis(self.lameduck_millis)
    }

    /// Check value ranges. Run after every load and after CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(AppError::Config("port must be greater than zero".into()));
        }

        if self.host.trim().is_empty() {
            return Err(AppError::Config("host must not be empty".into()));
        }

        if self.max_frame_bytes == 0 {
            return Err(AppError::Config(
                "max_frame_bytes must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
