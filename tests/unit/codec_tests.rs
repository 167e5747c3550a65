//! Unit tests for the `Content-Length` framing codec.
//!
//! Covers:
//! - frame decoding with headers, partial delivery and batching
//! - encoding computes `Content-Length` from the UTF-8 byte length
//! - encoded frames decode back to equal messages, empty content included
//! - line mode for the greeting and the switch to frame mode
//! - malformed frames: missing or invalid length, oversize payloads

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use v8_remote_debug::transport::message::{CodecMode, WireItem, DEFAULT_MAX_FRAME_BYTES};
use v8_remote_debug::transport::{Message, MessageCodec};
use v8_remote_debug::AppError;

fn decode_frame(codec: &mut MessageCodec, buf: &mut BytesMut) -> Option<Message> {
    match codec.decode(buf).expect("decode must succeed") {
        Some(WireItem::Frame(message)) => Some(message),
        Some(WireItem::Line(line)) => panic!("unexpected line {line:?}"),
        None => None,
    }
}

// ── Frames ──────────────────────────────────────────────────────────────────

#[test]
fn frame_with_headers_is_decoded() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::from("Tool:V8Debugger\r\nDestination:2\r\nContent-Length:2\r\n\r\n{}");

    let message = decode_frame(&mut codec, &mut buf).expect("one complete frame");

    assert_eq!(message.content(), "{}");
    assert_eq!(message.tool(), Some("V8Debugger"));
    assert_eq!(message.destination(), Some("2"));
    assert!(
        message.header("Content-Length").is_none(),
        "the length header must not be exposed"
    );
    assert!(buf.is_empty(), "the frame must be fully consumed");
}

#[test]
fn header_values_are_kept_verbatim() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::from("Tool: padded \nContent-Length: 1\n\nx");

    let message = decode_frame(&mut codec, &mut buf).expect("frame with bare newlines");

    assert_eq!(message.tool(), Some(" padded "), "values are not trimmed");
    assert_eq!(message.content(), "x");
}

#[test]
fn partial_frame_waits_for_more_bytes() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::from("Content-Length:10\r\n\r\n01234");

    assert!(decode_frame(&mut codec, &mut buf).is_none(), "payload is incomplete");

    buf.extend_from_slice(b"56789");
    let message = decode_frame(&mut codec, &mut buf).expect("payload now complete");
    assert_eq!(message.content(), "0123456789");
}

#[test]
fn batched_frames_are_decoded_in_order() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::from("Content-Length:1\r\n\r\naContent-Length:1\r\n\r\nb");

    let first = decode_frame(&mut codec, &mut buf).expect("first frame");
    let second = decode_frame(&mut codec, &mut buf).expect("second frame");

    assert_eq!(first.content(), "a");
    assert_eq!(second.content(), "b");
    assert!(decode_frame(&mut codec, &mut buf).is_none());
}

#[test]
fn content_length_counts_utf8_bytes() {
    let mut codec = MessageCodec::default();
    let mut out = BytesMut::new();
    codec
        .encode(Message::with_content("héllo"), &mut out)
        .expect("encode must succeed");

    assert_eq!(&out[..], "Content-Length:6\r\n\r\nhéllo".as_bytes());

    let message = decode_frame(&mut codec, &mut out).expect("round trip");
    assert_eq!(message.content(), "héllo");
}

#[test]
fn encoded_headers_precede_the_length() {
    let mut codec = MessageCodec::default();
    let mut out = BytesMut::new();
    codec
        .encode(
            Message::with_content("{}").header_set("Tool", "DevToolsService"),
            &mut out,
        )
        .expect("encode must succeed");

    assert_eq!(&out[..], b"Tool:DevToolsService\r\nContent-Length:2\r\n\r\n{}");
}

#[test]
fn encoded_frames_decode_to_the_same_messages() {
    let mut codec = MessageCodec::default();
    let messages = vec![
        Message::with_content(r#"{"seq":1,"text":"héllo ✓"}"#)
            .header_set("Tool", "V8Debugger")
            .header_set("Destination", "2")
            .header_set("Embedding-Host", "node"),
        Message::with_content("").header_set("Tool", "DevToolsService"),
        Message::with_content("{}"),
    ];

    let mut buf = BytesMut::new();
    for message in messages.clone() {
        codec.encode(message, &mut buf).expect("encode must succeed");
    }
    let mut decoded = Vec::new();
    while let Some(message) = decode_frame(&mut codec, &mut buf) {
        decoded.push(message);
    }

    assert_eq!(decoded, messages, "every header, content and the order survive");
    assert_eq!(decoded[0].headers().len(), 3);
    assert!(buf.is_empty());
}

#[test]
fn empty_content_is_framed_with_zero_length() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    codec
        .encode(Message::with_content(""), &mut buf)
        .expect("encode must succeed");
    assert_eq!(&buf[..], b"Content-Length:0\r\n\r\n");

    let message = decode_frame(&mut codec, &mut buf).expect("empty frame is complete");
    assert_eq!(message.content(), "");
    assert!(message.headers().is_empty());
}

// ── Malformed frames ────────────────────────────────────────────────────────

#[test]
fn missing_content_length_is_fatal() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::from("Tool:V8Debugger\r\n\r\n{}");

    let err = codec.decode(&mut buf).expect_err("missing length must fail");
    assert!(
        matches!(err, AppError::Transport(ref msg) if msg.contains("missing Content-Length")),
        "unexpected error: {err}"
    );
}

#[test]
fn non_numeric_content_length_is_fatal() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::from("Content-Length:ten\r\n\r\n0123456789");

    let err = codec.decode(&mut buf).expect_err("bad length must fail");
    assert!(matches!(err, AppError::Transport(_)), "unexpected error: {err}");
}

#[test]
fn header_line_without_colon_is_fatal() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::from("garbage\r\nContent-Length:0\r\n\r\n");

    assert!(codec.decode(&mut buf).is_err(), "header without colon must fail");
}

#[test]
fn oversize_payload_is_rejected() {
    let mut codec = MessageCodec::frames(8);
    let mut buf = BytesMut::from("Content-Length:9\r\n\r\n");

    let err = codec.decode(&mut buf).expect_err("oversize must fail");
    assert!(
        matches!(err, AppError::Transport(ref msg) if msg.contains("exceeds limit")),
        "unexpected error: {err}"
    );
}

// ── Lines ───────────────────────────────────────────────────────────────────

#[test]
fn line_mode_then_frames_keeps_buffered_bytes() {
    let mut codec = MessageCodec::new(CodecMode::Lines, DEFAULT_MAX_FRAME_BYTES);
    let mut buf = BytesMut::from("ChromeDevToolsHandshake\r\nContent-Length:2\r\n\r\n{}");

    let line = codec.decode(&mut buf).expect("decode line");
    assert_eq!(line, Some(WireItem::Line("ChromeDevToolsHandshake".into())));

    codec.enter_frames();
    assert_eq!(codec.mode(), CodecMode::Frames);
    let message = decode_frame(&mut codec, &mut buf).expect("frame after greeting");
    assert_eq!(message.content(), "{}");
}

#[test]
fn truncated_frame_at_eof_is_discarded() {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::from("Content-Length:10\r\n\r\n012");

    let item = codec.decode_eof(&mut buf).expect("eof inside a frame is not an error");
    assert!(item.is_none());
    assert!(buf.is_empty(), "partial data is dropped");
}
