//! Shared helpers for connection and session integration tests.
//!
//! [`FakeRemote`] plays the debugger side of an in-memory duplex stream:
//! it answers the Chrome greeting, reads framed JSON requests and writes
//! framed responses and events. [`RecordingListener`] forwards session
//! callbacks to a channel so tests can await them in order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use v8_remote_debug::config::DebuggerConfig;
use v8_remote_debug::session::{DebugContext, Script};
use v8_remote_debug::transport::handshake::CHROME_GREETING;
use v8_remote_debug::transport::message::{CodecMode, WireItem, DEFAULT_MAX_FRAME_BYTES};
use v8_remote_debug::transport::{Connection, ConnectionOptions, Message, MessageCodec};
use v8_remote_debug::{DebugEventListener, DebugSession};

/// Upper bound for any single wait in a test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection options with a short lameduck delay.
pub fn test_options() -> ConnectionOptions {
    ConnectionOptions {
        lameduck_delay: Duration::from_millis(100),
        ..ConnectionOptions::default()
    }
}

/// The debugger end of a duplex stream.
pub struct FakeRemote {
    input: FramedRead<ReadHalf<DuplexStream>, MessageCodec>,
    output: FramedWrite<WriteHalf<DuplexStream>, MessageCodec>,
    seq: u64,
}

impl FakeRemote {
    /// Wrap `stream` without performing any greeting.
    pub fn raw(stream: DuplexStream, mode: CodecMode) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            input: FramedRead::new(read_half, MessageCodec::new(mode, DEFAULT_MAX_FRAME_BYTES)),
            output: FramedWrite::new(write_half, MessageCodec::default()),
            seq: 100,
        }
    }

    /// Accept the Chrome greeting from the client and answer it.
    pub async fn chrome(stream: DuplexStream) -> Self {
        let mut remote = Self::raw(stream, CodecMode::Lines);
        let greeting = tokio::time::timeout(STEP_TIMEOUT, remote.input.next())
            .await
            .expect("greeting in time")
            .expect("stream open")
            .expect("valid greeting line");
        assert_eq!(greeting, WireItem::Line(CHROME_GREETING.to_owned()));

        remote.write_line(CHROME_GREETING).await;
        remote.input.decoder_mut().enter_frames();
        remote
    }

    /// Next framed message from the client, or `None` at end of stream.
    pub async fn next_message(&mut self) -> Option<Message> {
        match tokio::time::timeout(STEP_TIMEOUT, self.input.next())
            .await
            .expect("client message in time")
        {
            Some(Ok(WireItem::Frame(message))) => Some(message),
            Some(Ok(WireItem::Line(line))) => panic!("unexpected line from client: {line}"),
            Some(Err(err)) => panic!("client sent a malformed frame: {err}"),
            None => None,
        }
    }

    /// Next request from the client, decoded.
    pub async fn next_request(&mut self) -> Value {
        let message = self.next_message().await.expect("client request");
        serde_json::from_str(message.content()).expect("request is JSON")
    }

    /// Next request, which must be `command`.
    pub async fn expect_command(&mut self, command: &str) -> Value {
        let request = self.next_request().await;
        assert_eq!(request["type"], "request");
        assert_eq!(request["command"], command, "unexpected request: {request}");
        request
    }

    /// Write one frame.
    pub async fn send_message(&mut self, message: Message) {
        self.output.send(message).await.expect("frame written");
    }

    /// Write one frame carrying `content`.
    pub async fn send_json(&mut self, content: &Value) {
        self.send_message(Message::with_content(content.to_string()))
            .await;
    }

    /// Write a raw text line, outside of any frame.
    pub async fn write_line(&mut self, line: &str) {
        let writer = self.output.get_mut();
        writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("line written");
        writer.flush().await.expect("line flushed");
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Answer `request` successfully.
    pub async fn respond(&mut self, request: &Value, body: Value, refs: Value) {
        let seq = self.next_seq();
        self.send_json(&json!({
            "seq": seq,
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": true,
            "running": false,
            "body": body,
            "refs": refs,
        }))
        .await;
    }

    /// Answer `request` with a failure.
    pub async fn fail(&mut self, request: &Value, message: &str, details: Option<Value>) {
        let seq = self.next_seq();
        let mut response = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": false,
            "message": message,
        });
        if let Some(details) = details {
            response["error_details"] = details;
        }
        self.send_json(&response).await;
    }

    /// Push an event.
    pub async fn event(&mut self, name: &str, body: Value, refs: Value) {
        let seq = self.next_seq();
        self.send_json(&json!({
            "seq": seq,
            "type": "event",
            "event": name,
            "body": body,
            "refs": refs,
        }))
        .await;
    }
}

/// Session callbacks, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    Suspended(DebugContext),
    Resumed,
    Disconnected,
    ScriptLoaded(i64),
    ScriptCollected(i64),
    ContentChanged(i64),
}

/// Listener forwarding every callback to a channel.
pub struct RecordingListener {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl RecordingListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), rx)
    }
}

impl DebugEventListener for RecordingListener {
    fn suspended(&self, context: DebugContext) {
        let _ = self.events.send(SessionEvent::Suspended(context));
    }

    fn resumed(&self) {
        let _ = self.events.send(SessionEvent::Resumed);
    }

    fn disconnected(&self) {
        let _ = self.events.send(SessionEvent::Disconnected);
    }

    fn script_loaded(&self, script: &Script) {
        let _ = self.events.send(SessionEvent::ScriptLoaded(script.id()));
    }

    fn script_collected(&self, script_id: i64) {
        let _ = self.events.send(SessionEvent::ScriptCollected(script_id));
    }

    fn script_content_changed(&self, script: &Script) {
        let _ = self.events.send(SessionEvent::ContentChanged(script.id()));
    }
}

/// Next recorded session event.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(STEP_TIMEOUT, events.recv())
        .await
        .expect("session event in time")
        .expect("listener alive")
}

/// Script descriptor as the remote reports it.
pub fn script_json(handle: i64, id: i64, name: &str, source: &str) -> Value {
    json!({
        "handle": handle,
        "type": "script",
        "id": id,
        "name": name,
        "lineOffset": 0,
        "columnOffset": 0,
        "lineCount": source.lines().count(),
        "source": source,
        "sourceLength": source.len(),
        "scriptType": 2,
    })
}

/// Attached session plus its remote and event stream. The remote has
/// already answered the initial `scripts` request with `scripts`.
pub struct Harness {
    pub session: DebugSession,
    pub remote: FakeRemote,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Attach a fresh session over an in-memory stream.
pub async fn attached_session(scripts: Value) -> Harness {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (listener, events) = RecordingListener::new();
    let session = DebugSession::new(
        Connection::new(test_options()),
        &DebuggerConfig::default(),
        listener,
    )
    .expect("session builds");

    let remote = async move {
        let mut remote = FakeRemote::chrome(server).await;
        let request = remote.expect_command("scripts").await;
        assert_eq!(request["arguments"]["includeSource"], true);
        remote.respond(&request, scripts, json!([])).await;
        remote
    };
    let (attached, remote) = tokio::join!(session.attach_stream(client), remote);
    attached.expect("session attaches");

    Harness {
        session,
        remote,
        events,
    }
}
