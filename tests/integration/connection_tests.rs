//! Integration tests for the connection: handshakes, inbound ordering,
//! outbound framing and shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use v8_remote_debug::transport::message::CodecMode;
use v8_remote_debug::transport::{
    Connection, ConnectionOptions, Handshake, Message, NetListener, RemoteInfo,
};
use v8_remote_debug::AppError;

use super::test_helpers::{test_options, FakeRemote, STEP_TIMEOUT};

#[derive(Debug)]
enum NetEvent {
    Message(Message),
    Eos,
    Closed,
}

struct ChannelListener {
    events: mpsc::UnboundedSender<NetEvent>,
}

impl NetListener for ChannelListener {
    fn message_received(&self, message: Message) {
        let _ = self.events.send(NetEvent::Message(message));
    }

    fn eos_received(&self) {
        let _ = self.events.send(NetEvent::Eos);
    }

    fn connection_closed(&self) {
        let _ = self.events.send(NetEvent::Closed);
    }
}

fn listening(options: ConnectionOptions) -> (Connection, mpsc::UnboundedReceiver<NetEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    let connection = Connection::new(options);
    connection
        .set_listener(Arc::new(ChannelListener { events }))
        .expect("first listener");
    (connection, rx)
}

async fn next(events: &mut mpsc::UnboundedReceiver<NetEvent>) -> NetEvent {
    tokio::time::timeout(STEP_TIMEOUT, events.recv())
        .await
        .expect("connection event in time")
        .expect("listener alive")
}

async fn next_inbound(events: &mut mpsc::UnboundedReceiver<NetEvent>) -> NetEvent {
    loop {
        match next(events).await {
            NetEvent::Closed => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn chrome_handshake_then_messages_arrive_in_order() {
    let (connection, mut events) = listening(test_options());
    let (client, server) = tokio::io::duplex(16 * 1024);
    connection.start(client).expect("starts");
    let mut remote = FakeRemote::chrome(server).await;

    for n in 1..=3 {
        remote.send_json(&json!({ "n": n })).await;
    }
    for n in 1..=3 {
        match next(&mut events).await {
            NetEvent::Message(message) => {
                let value: serde_json::Value =
                    serde_json::from_str(message.content()).expect("JSON");
                assert_eq!(value["n"], n);
            }
            other => panic!("expected message {n}, got {other:?}"),
        }
    }
    assert!(connection.is_attached());
    assert!(connection.remote_info().is_none(), "chrome announces nothing");
}

#[tokio::test]
async fn outbound_messages_keep_headers_and_order() {
    let (connection, _events) = listening(test_options());
    let (client, server) = tokio::io::duplex(16 * 1024);
    connection.start(client).expect("starts");
    let mut remote = FakeRemote::chrome(server).await;

    connection
        .send(Message::with_content("first").header_set("Tool", "V8Debugger"))
        .expect("queued");
    connection
        .send(Message::with_content("second").header_set("Destination", "7"))
        .expect("queued");

    let first = remote.next_message().await.expect("first frame");
    assert_eq!(first.content(), "first");
    assert_eq!(first.tool(), Some("V8Debugger"));
    let second = remote.next_message().await.expect("second frame");
    assert_eq!(second.content(), "second");
    assert_eq!(second.destination(), Some("7"));
}

#[tokio::test]
async fn standalone_handshake_records_remote_versions() {
    let options = ConnectionOptions {
        handshake: Handshake::StandaloneV8,
        ..test_options()
    };
    let (connection, mut events) = listening(options);
    let (client, server) = tokio::io::duplex(16 * 1024);
    connection.start(client).expect("starts");

    let mut remote = FakeRemote::raw(server, CodecMode::Frames);
    remote
        .send_message(
            Message::with_content("")
                .header_set("Type", "connect")
                .header_set("Protocol-Version", "1")
                .header_set("V8-Version", "3.1.8")
                .header_set("Embedding-Host", "node"),
        )
        .await;
    remote.send_json(&json!({ "after": "handshake" })).await;

    assert!(matches!(next(&mut events).await, NetEvent::Message(_)));
    assert_eq!(
        connection.remote_info(),
        Some(RemoteInfo {
            protocol_version: "1".into(),
            v8_version: "3.1.8".into(),
            embedding_host: Some("node".into()),
        })
    );
}

#[tokio::test]
async fn remote_close_delivers_end_of_stream_last() {
    let (connection, mut events) = listening(test_options());
    let (client, server) = tokio::io::duplex(16 * 1024);
    connection.start(client).expect("starts");
    let mut remote = FakeRemote::chrome(server).await;

    remote.send_json(&json!({ "last": true })).await;
    drop(remote);

    assert!(matches!(next_inbound(&mut events).await, NetEvent::Message(_)));
    assert!(matches!(next_inbound(&mut events).await, NetEvent::Eos));
    tokio::time::timeout(STEP_TIMEOUT, connection.closed())
        .await
        .expect("connection stops");

    let err = connection
        .send(Message::with_content("late"))
        .expect_err("closed connection refuses sends");
    assert!(matches!(err, AppError::State(_)), "unexpected error: {err:?}");
}

#[tokio::test]
async fn wrong_greeting_fails_the_connection() {
    let (connection, mut events) = listening(test_options());
    let (client, server) = tokio::io::duplex(16 * 1024);
    connection.start(client).expect("starts");

    let mut remote = FakeRemote::raw(server, CodecMode::Lines);
    remote.write_line("HTTP/1.1 400 Bad Request").await;

    assert!(matches!(next_inbound(&mut events).await, NetEvent::Eos));
    tokio::time::timeout(STEP_TIMEOUT, connection.closed())
        .await
        .expect("connection stops");
    assert!(!connection.is_attached());
}

#[tokio::test]
async fn close_drains_queued_writes() {
    let (connection, mut events) = listening(test_options());
    let (client, server) = tokio::io::duplex(16 * 1024);
    connection.start(client).expect("starts");
    let mut remote = FakeRemote::chrome(server).await;
    remote.send_json(&json!({ "ready": true })).await;
    assert!(matches!(next(&mut events).await, NetEvent::Message(_)), "handshake done");

    connection
        .send(Message::with_content("queued before close"))
        .expect("queued");
    connection.close();

    let message = remote.next_message().await.expect("queued frame delivered");
    assert_eq!(message.content(), "queued before close");
    assert!(matches!(next(&mut events).await, NetEvent::Closed));
    tokio::time::timeout(STEP_TIMEOUT, connection.closed())
        .await
        .expect("connection stops");
}

#[tokio::test]
async fn listener_can_only_be_set_once() {
    let (connection, _events) = listening(test_options());
    let (events, _rx) = mpsc::unbounded_channel();
    let err = connection
        .set_listener(Arc::new(ChannelListener { events }))
        .expect_err("second listener");
    assert!(matches!(err, AppError::State(message) if message == "Cannot change NetListener"));
}

#[tokio::test]
async fn detached_connection_refuses_work() {
    let connection = Connection::new(test_options());
    let (client, _server) = tokio::io::duplex(1024);

    assert!(matches!(
        connection.send(Message::with_content("x")),
        Err(AppError::State(_))
    ));
    assert!(matches!(
        connection.run_in_dispatch(|| {}),
        Err(AppError::State(_))
    ));
    assert!(matches!(connection.start(client), Err(AppError::State(_))), "no listener");
}

#[tokio::test]
async fn dispatch_tasks_run_after_queued_messages() {
    let (connection, mut events) = listening(test_options());
    let (client, server) = tokio::io::duplex(16 * 1024);
    connection.start(client).expect("starts");
    let mut remote = FakeRemote::chrome(server).await;

    remote.send_json(&json!({ "n": 1 })).await;
    assert!(matches!(next(&mut events).await, NetEvent::Message(_)));

    let (tx, rx) = tokio::sync::oneshot::channel();
    connection
        .run_in_dispatch(move || {
            let _ = tx.send("ran");
        })
        .expect("task queued");
    let ran = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("task in time")
        .expect("task ran");
    assert_eq!(ran, "ran");
}
