//! Unit tests for `AppError` display format and conversions.

use v8_remote_debug::AppError;

#[test]
fn display_prefixes_the_category() {
    let cases = [
        (AppError::Transport("eof".into()), "transport: eof"),
        (AppError::Protocol("bad".into()), "protocol: bad"),
        (
            AppError::RemoteCommand("No frames".into()),
            "remote command failed: No frames",
        ),
        (AppError::State("closed".into()), "state: closed"),
        (AppError::Config("port".into()), "config: port"),
        (AppError::Io("disk".into()), "io: disk"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn io_errors_become_transport_errors() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err = AppError::from(io);
    assert!(
        matches!(err, AppError::Transport(ref msg) if msg.contains("pipe closed")),
        "unexpected error: {err}"
    );
}

#[test]
fn json_errors_become_protocol_errors() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid json");
    let err = AppError::from(json_err);
    assert!(
        matches!(err, AppError::Protocol(ref msg) if msg.starts_with("invalid json")),
        "unexpected error: {err}"
    );
}

#[test]
fn errors_are_cloneable_for_shared_results() {
    let err = AppError::Transport("Connection closed".into());
    assert_eq!(err.clone(), err);
}
