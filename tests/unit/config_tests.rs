//! Unit tests for `DebuggerConfig` parsing, defaults and validation.

use std::time::Duration;

use v8_remote_debug::config::{DebuggerConfig, HandshakeKind};
use v8_remote_debug::AppError;

fn sample_toml() -> &'static str {
    r#"
host = "devbox.local"
port = 5858
handshake = "standalone_v8"
lameduck_millis = 250
max_frame_bytes = 65536
strict_parsing = true

[session]
include_source = false
inline_refs = true
"#
}

#[test]
fn parses_full_configuration() {
    let config = DebuggerConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.host, "devbox.local");
    assert_eq!(config.port, 5858);
    assert_eq!(config.handshake, HandshakeKind::StandaloneV8);
    assert_eq!(config.lameduck_delay(), Duration::from_millis(250));
    assert_eq!(config.max_frame_bytes, 65536);
    assert!(config.strict_parsing);
    assert!(!config.session.include_source);
    assert!(config.session.inline_refs);
    assert_eq!(config.address(), "devbox.local:5858");
}

#[test]
fn empty_document_uses_defaults() {
    let config = DebuggerConfig::from_toml_str("").expect("defaults are valid");

    assert_eq!(config, DebuggerConfig::default());
    assert_eq!(config.address(), "127.0.0.1:9222");
    assert_eq!(config.handshake, HandshakeKind::Chrome);
    assert!(config.session.include_source, "source is requested by default");
    assert!(!config.strict_parsing, "parsing is lenient by default");
}

#[test]
fn zero_port_is_rejected() {
    let err = DebuggerConfig::from_toml_str("port = 0").expect_err("port 0 must fail");
    assert!(
        matches!(err, AppError::Config(ref msg) if msg.contains("port")),
        "unexpected error: {err}"
    );
}

#[test]
fn blank_host_is_rejected() {
    let err = DebuggerConfig::from_toml_str("host = '   '").expect_err("blank host must fail");
    assert!(matches!(err, AppError::Config(_)), "unexpected error: {err}");
}

#[test]
fn zero_frame_limit_is_rejected() {
    let err = DebuggerConfig::from_toml_str("max_frame_bytes = 0").expect_err("limit 0 must fail");
    assert!(
        matches!(err, AppError::Config(ref msg) if msg.contains("max_frame_bytes")),
        "unexpected error: {err}"
    );
}

#[test]
fn unknown_handshake_is_a_config_error() {
    let err = DebuggerConfig::from_toml_str("handshake = 'telnet'").expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)), "unexpected error: {err}");
}

#[test]
fn loads_from_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("debugger.toml");
    std::fs::write(&path, sample_toml()).expect("write config");

    let config = DebuggerConfig::load_from_path(&path).expect("load config");
    assert_eq!(config.port, 5858);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = DebuggerConfig::load_from_path(dir.path().join("absent.toml"))
        .expect_err("missing file must fail");
    assert!(
        matches!(err, AppError::Io(ref msg) if msg.contains("absent.toml")),
        "unexpected error: {err}"
    );
}
