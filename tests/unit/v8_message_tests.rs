//! Unit tests for the V8 message vocabulary: inbound decoding, handle
//! casts and request construction.

use serde_json::json;

use v8_remote_debug::protocol::v8::{
    build_parser, BreakpointTarget, Incoming, StepAction, V8Request,
};
use v8_remote_debug::protocol::ProtocolParser;
use v8_remote_debug::AppError;

fn parser() -> ProtocolParser {
    build_parser(false).expect("V8 schemas are consistent")
}

fn response(json: &str) -> v8_remote_debug::protocol::v8::CommandResponse {
    match Incoming::parse(&parser(), json).expect("valid message") {
        Incoming::Response(response) => response,
        Incoming::Event(_) => panic!("expected a response"),
    }
}

// ── Inbound ─────────────────────────────────────────────────────────────────

#[test]
fn success_response_exposes_body_and_refs() {
    let response = response(
        r#"{"seq":3,"type":"response","request_seq":1,"command":"version",
            "success":true,"running":true,"body":{"V8Version":"3.1.8"},
            "refs":[{"handle":5,"type":"number","value":1,"text":"1"}]}"#,
    );

    assert_eq!(response.request_seq().expect("seq"), 1);
    assert_eq!(response.command().as_deref(), Some("version"));
    assert_eq!(response.running(), Some(true));

    let success = response.into_result().expect("success");
    let body = success.body_as("VersionBody").expect("version body");
    assert_eq!(body.string("V8Version").expect("version"), "3.1.8");

    let refs = success.refs().expect("refs");
    assert_eq!(refs.len(), 1);
    let value = refs[0].as_value().expect("number is a value handle");
    assert_eq!(value.handle().expect("handle"), 5);
    assert_eq!(value.value(), json!(1));
    assert_eq!(value.text().as_deref(), Some("1"));
}

#[test]
fn failed_response_maps_to_remote_command_error() {
    let response = response(
        r#"{"seq":4,"type":"response","request_seq":2,"command":"evaluate",
            "success":false,"message":"ReferenceError: y is not defined"}"#,
    );

    assert!(response.success().is_none());
    let failure = response.failure().expect("failure view");
    assert!(failure.error_details().is_none());

    let err = response.into_result().expect_err("remote failure");
    assert!(
        matches!(&err, AppError::RemoteCommand(message) if message == "ReferenceError: y is not defined"),
        "unexpected error: {err:?}"
    );
}

#[test]
fn failure_details_decode_as_compile_error() {
    let response = response(
        r#"{"seq":5,"type":"response","request_seq":3,"command":"changelive",
            "success":false,"message":"LiveEdit Failure",
            "error_details":{"type":"liveedit_compile_error","syntaxErrorMessage":"Unexpected token",
              "position":{"start":{"line":1,"column":4,"position":12},
                          "end":{"line":1,"column":5,"position":13}}}}"#,
    );

    let details = response
        .failure()
        .expect("failure")
        .details_as("CompileErrorDetails")
        .expect("details decode");
    assert_eq!(details.string("type").expect("type"), "liveedit_compile_error");
    let start = details
        .data("position")
        .and_then(|range| range.data("start"))
        .expect("start");
    assert_eq!(start.long("position").expect("position"), 12);
}

#[test]
fn event_is_routed_by_type() {
    let incoming = Incoming::parse(
        &parser(),
        r#"{"seq":9,"type":"event","event":"break",
            "body":{"sourceLine":4,"sourceColumn":2,"breakpoints":[7]}}"#,
    )
    .expect("valid event");

    let Incoming::Event(event) = incoming else {
        panic!("expected an event");
    };
    assert_eq!(event.event().expect("name"), "break");
    let body = event.body_as("BreakEventBody").expect("break body");
    assert_eq!(body.long_list("breakpoints").expect("ids"), vec![7]);
    assert!(event.refs().expect("no refs").is_empty());
}

#[test]
fn unknown_message_type_is_rejected() {
    let err = Incoming::parse(&parser(), r#"{"seq":1,"type":"request","command":"x"}"#)
        .expect_err("requests are never inbound");
    assert!(matches!(err, AppError::Protocol(_)), "unexpected error: {err:?}");
}

#[test]
fn invalid_json_is_a_protocol_error() {
    let err = Incoming::parse(&parser(), "{").expect_err("truncated JSON");
    assert!(matches!(err, AppError::Protocol(_)), "unexpected error: {err:?}");
}

#[test]
fn script_handles_cast_by_type() {
    let response = response(
        r#"{"seq":1,"type":"response","request_seq":1,"success":true,"body":null,
            "refs":[{"handle":8,"type":"script","id":42,"name":"app.js",
                     "lineOffset":2,"source":"var a = 1;"},
                    {"handle":9,"type":"object","className":"Object"}]}"#,
    );
    let refs = response.into_result().expect("success").refs().expect("refs");

    assert!(refs[0].is_script());
    let script = refs[0].as_script().expect("script handle");
    assert_eq!(script.id().expect("id"), 42);
    assert_eq!(script.name().as_deref(), Some("app.js"));
    assert_eq!(script.line_offset(), 2);
    assert_eq!(script.column_offset(), 0);
    assert_eq!(script.source().expect("source").as_deref(), Some("var a = 1;"));
    assert!(refs[0].as_value().is_err(), "a script is not a value");

    assert!(!refs[1].is_script());
    assert!(refs[1].as_script().is_err());
    let object = refs[1].as_value().expect("object handle");
    assert_eq!(object.class_name().as_deref(), Some("Object"));
    assert!(object.value().is_null());
}

#[test]
fn strict_parser_rejects_undeclared_properties() {
    let strict = build_parser(true).expect("strict V8 parser");
    let err = Incoming::parse(
        &strict,
        r#"{"seq":1,"type":"event","event":"break","surprise":true}"#,
    )
    .expect_err("undeclared property");
    assert!(err.to_string().contains("'surprise'"), "unexpected error: {err}");
}

// ── Outbound ────────────────────────────────────────────────────────────────

#[test]
fn request_envelope_serializes_type_and_arguments() {
    let mut request = V8Request::clear_breakpoint(7);
    request.seq = 12;
    let encoded: serde_json::Value =
        serde_json::from_str(&request.to_json().expect("encodes")).expect("valid JSON");

    assert_eq!(
        encoded,
        json!({ "seq": 12, "type": "request", "command": "clearbreakpoint",
                "arguments": { "breakpoint": 7 } })
    );
}

#[test]
fn request_without_arguments_omits_them() {
    let encoded: serde_json::Value =
        serde_json::from_str(&V8Request::version().to_json().expect("encodes")).expect("JSON");
    assert!(encoded.get("arguments").is_none());
}

#[test]
fn plain_continue_has_no_step_arguments() {
    let request = V8Request::continue_vm(StepAction::Continue, 1);
    assert!(request.arguments().is_empty());

    let step_in = V8Request::continue_vm(StepAction::In, 1);
    assert_eq!(step_in.arguments().get("stepaction"), Some(&json!("in")));
    assert!(step_in.arguments().get("stepcount").is_none());
}

#[test]
fn set_breakpoint_uses_target_kind() {
    let request = V8Request::set_breakpoint(
        &BreakpointTarget::ScriptId(3),
        Some(10),
        None,
        true,
        Some("x > 1"),
        None,
    );
    let args = request.arguments();
    assert_eq!(request.command, "setbreakpoint");
    assert_eq!(args.get("type"), Some(&json!("scriptId")));
    assert_eq!(args.get("target"), Some(&json!(3)));
    assert_eq!(args.get("line"), Some(&json!(10)));
    assert_eq!(args.get("condition"), Some(&json!("x > 1")));
    assert!(args.get("column").is_none());
    assert!(args.get("ignoreCount").is_none());
}

#[test]
fn global_evaluate_is_flagged() {
    let request = V8Request::evaluate("1+1", None, true);
    let args = request.arguments();
    assert_eq!(args.get("global"), Some(&json!(true)));
    assert_eq!(args.get("inlineRefs"), Some(&json!(true)));
    assert!(args.get("frame").is_none());

    let in_frame = V8Request::evaluate("x", Some(2), false);
    assert_eq!(in_frame.arguments().get("frame"), Some(&json!(2)));
    assert_eq!(in_frame.arguments().get("global"), Some(&json!(false)));
    assert!(in_frame.arguments().get("inlineRefs").is_none());
}

#[test]
fn change_live_carries_preview_flag() {
    let request = V8Request::change_live(5, "var b;", true);
    assert_eq!(request.command, "changelive");
    assert_eq!(request.arguments().get("preview_only"), Some(&json!(true)));
    assert_eq!(request.arguments().get("new_source"), Some(&json!("var b;")));
}

#[test]
fn frame_and_source_requests_name_their_frame() {
    let frame = V8Request::frame(3, true);
    assert_eq!(frame.command, "frame");
    assert_eq!(frame.arguments().get("number"), Some(&json!(3)));
    assert_eq!(frame.arguments().get("inlineRefs"), Some(&json!(true)));

    let source = V8Request::source(Some(0), Some(10), None);
    assert_eq!(source.command, "source");
    assert_eq!(source.arguments().get("frame"), Some(&json!(0)));
    assert_eq!(source.arguments().get("fromLine"), Some(&json!(10)));
    assert!(source.arguments().get("toLine").is_none());

    assert!(V8Request::source(None, None, None).arguments().is_empty());
}
