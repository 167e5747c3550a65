//! Schema declarations for the V8 debugger protocol.

use serde_json::{json, Value};

use crate::protocol::schema::{Condition, FieldDecl, FieldKind, SchemaDecl};
use crate::protocol::{ObjectData, ProtocolParser};
use crate::Result;

/// Wire spellings of LiveEdit function statuses.
pub const FUNCTION_STATUSES: &[&str] = &["unchanged", "source changed", "changed", "damaged"];

fn long(name: &'static str) -> FieldDecl {
    FieldDecl::new(name, FieldKind::Long)
}

fn string(name: &'static str) -> FieldDecl {
    FieldDecl::new(name, FieldKind::String)
}

fn boolean(name: &'static str) -> FieldDecl {
    FieldDecl::new(name, FieldKind::Boolean)
}

fn json_any(name: &'static str) -> FieldDecl {
    FieldDecl::new(name, FieldKind::Json).optional().nullable()
}

fn schema(name: &'static str, target: &'static str) -> FieldDecl {
    FieldDecl::new(name, FieldKind::Schema(target))
}

fn list_of(name: &'static str, target: &'static str) -> FieldDecl {
    FieldDecl::new(name, FieldKind::list(FieldKind::Schema(target)))
}

fn maybe(field: FieldDecl) -> FieldDecl {
    field.optional().nullable()
}

/// Every schema of the V8 vocabulary.
#[must_use]
pub fn declarations() -> Vec<SchemaDecl> {
    let mut decls = messages();
    decls.extend(handles());
    decls.extend(frames());
    decls.extend(bodies());
    decls.extend(live_edit());
    decls
}

fn messages() -> Vec<SchemaDecl> {
    vec![
        SchemaDecl::new("IncomingMessage")
            .field(maybe(long("seq")))
            .field(string("type"))
            .auto_subtype("CommandResponse", Condition::FieldEquals("type", json!("response")))
            .auto_subtype("EventNotification", Condition::FieldEquals("type", json!("event"))),
        SchemaDecl::new("CommandResponse")
            .field(long("request_seq"))
            .field(maybe(string("command")))
            .field(boolean("success"))
            .field(maybe(boolean("running")))
            .auto_subtype("SuccessCommandResponse", Condition::FieldEquals("success", Value::Bool(true)))
            .auto_subtype("FailedCommandResponse", Condition::FieldEquals("success", Value::Bool(false))),
        SchemaDecl::new("SuccessCommandResponse")
            .field(json_any("body"))
            .field(maybe(list_of("refs", "SomeHandle")).lazy()),
        SchemaDecl::new("FailedCommandResponse")
            .field(maybe(string("message")))
            .field(json_any("error_details")),
        SchemaDecl::new("EventNotification")
            .field(string("event"))
            .field(json_any("body"))
            .field(maybe(list_of("refs", "SomeHandle")).lazy()),
    ]
}

fn handles() -> Vec<SchemaDecl> {
    vec![
        SchemaDecl::new("SomeHandle")
            .field(long("handle"))
            .field(string("type"))
            .manual_subtype("ScriptHandle")
            .manual_subtype("ValueHandle"),
        SchemaDecl::new("ScriptHandle")
            .field(json_any("name"))
            .field(long("id"))
            .field(maybe(long("lineOffset")))
            .field(maybe(long("columnOffset")))
            .field(maybe(long("lineCount")))
            .field(maybe(string("source")).lazy())
            .field(maybe(long("sourceLength")))
            .field(maybe(long("scriptType")))
            .field(json_any("context")),
        SchemaDecl::new("ValueHandle")
            .field(maybe(string("className")))
            .field(json_any("value"))
            .field(maybe(string("text")))
            .field(maybe(list_of("properties", "PropertyObject")).lazy()),
        SchemaDecl::new("PropertyObject")
            .field(json_any("name"))
            .field(maybe(long("ref")))
            .field(maybe(long("propertyType")))
            .field(maybe(long("attributes"))),
    ]
}

fn frames() -> Vec<SchemaDecl> {
    vec![
        SchemaDecl::new("FrameObject")
            .field(long("index"))
            .field(maybe(schema("receiver", "ValueRef")))
            .field(schema("func", "FunctionRef"))
            .field(maybe(schema("script", "ScriptRef")))
            .field(maybe(boolean("constructCall")))
            .field(maybe(list_of("arguments", "FrameVariable")).lazy())
            .field(maybe(list_of("locals", "FrameVariable")).lazy())
            .field(maybe(long("position")))
            .field(long("line"))
            .field(maybe(long("column")))
            .field(maybe(string("sourceLineText")))
            .field(maybe(list_of("scopes", "ScopeRef")))
            .field(maybe(string("text"))),
        SchemaDecl::new("FunctionRef")
            .field(maybe(long("ref")))
            .field(maybe(string("type")))
            .field(maybe(string("name")))
            .field(maybe(string("inferredName")))
            .field(maybe(long("scriptId"))),
        SchemaDecl::new("ValueRef")
            .field(maybe(long("ref")))
            .field(maybe(long("handle")))
            .field(maybe(string("type")))
            .field(json_any("value"))
            .field(maybe(string("className"))),
        SchemaDecl::new("ScriptRef")
            .field(maybe(long("ref")))
            .field(maybe(long("id")))
            .field(json_any("name")),
        SchemaDecl::new("FrameVariable")
            .field(json_any("name"))
            .field(schema("value", "ValueRef")),
        SchemaDecl::new("ScopeRef")
            .field(long("type"))
            .field(long("index")),
    ]
}

fn bodies() -> Vec<SchemaDecl> {
    vec![
        SchemaDecl::new("BacktraceBody")
            .field(maybe(long("fromFrame")))
            .field(maybe(long("toFrame")))
            .field(long("totalFrames"))
            .field(maybe(list_of("frames", "FrameObject"))),
        SchemaDecl::new("ScopeBody")
            .field(long("index"))
            .field(maybe(long("frameIndex")))
            .field(long("type"))
            .field(schema("object", "ValueRef")),
        SchemaDecl::new("SetBreakpointBody")
            .field(maybe(string("type")))
            .field(long("breakpoint"))
            .field(json_any("script_name"))
            .field(maybe(long("line")))
            .field(maybe(long("column")))
            .field(json_any("actual_locations")),
        SchemaDecl::new("VersionBody").field(string("V8Version")),
        SchemaDecl::new("BreakEventBody")
            .field(maybe(string("invocationText")))
            .field(maybe(long("sourceLine")))
            .field(maybe(long("sourceColumn")))
            .field(maybe(string("sourceLineText")))
            .field(maybe(schema("script", "ScriptRef")))
            .field(maybe(FieldDecl::new("breakpoints", FieldKind::list(FieldKind::Long)))),
        SchemaDecl::new("ExceptionEventBody")
            .field(boolean("uncaught"))
            .field(schema("exception", "ValueHandle"))
            .field(maybe(long("sourceLine")))
            .field(maybe(long("sourceColumn")))
            .field(maybe(string("sourceLineText")))
            .field(maybe(schema("script", "ScriptRef"))),
        SchemaDecl::new("AfterCompileBody").field(schema("script", "ScriptHandle")),
        SchemaDecl::new("ScriptCollectedBody").field(schema("script", "ScriptRef")),
    ]
}

fn live_edit() -> Vec<SchemaDecl> {
    vec![
        SchemaDecl::new("ChangeLiveBody")
            .field(json_any("change_log"))
            .field(maybe(schema("result", "LiveEditResult")))
            .field(maybe(boolean("stepin_recommended"))),
        SchemaDecl::new("LiveEditResult")
            .field(schema("change_tree", "OldTreeNode"))
            .field(json_any("textual_diff"))
            .field(boolean("updated"))
            .field(boolean("stack_modified"))
            .field(maybe(boolean("stack_update_needs_step_in")))
            .field(maybe(string("created_script_name"))),
        SchemaDecl::new("OldTreeNode")
            .field(string("name"))
            .field(schema("positions", "Positions"))
            .field(FieldDecl::new("status", FieldKind::Enum(FUNCTION_STATUSES)))
            .field(maybe(string("status_explanation")))
            .field(maybe(schema("new_positions", "Positions")))
            .field(maybe(list_of("children", "OldTreeNode")).lazy())
            .field(maybe(list_of("new_children", "NewTreeNode")).lazy()),
        SchemaDecl::new("NewTreeNode")
            .field(string("name"))
            .field(maybe(schema("positions", "Positions")))
            .field(maybe(list_of("children", "NewTreeNode")).lazy()),
        SchemaDecl::new("Positions")
            .field(long("start_position"))
            .field(long("end_position"))
            .closed(),
        SchemaDecl::new("CompileErrorDetails")
            .field(string("type"))
            .field(maybe(string("syntaxErrorMessage")))
            .field(maybe(schema("position", "PositionRange"))),
        SchemaDecl::new("PositionRange")
            .field(schema("start", "TextPosition"))
            .field(schema("end", "TextPosition")),
        SchemaDecl::new("TextPosition")
            .field(long("line"))
            .field(long("column"))
            .field(long("position"))
            .closed(),
    ]
}

fn handle_type(data: &ObjectData) -> Option<String> {
    data.string("type").ok()
}

/// Build the V8 parser. `strict` closes every schema.
///
/// # Errors
///
/// Returns `AppError::Config` if the declarations are inconsistent.
pub fn build_parser(strict: bool) -> Result<ProtocolParser> {
    ProtocolParser::builder()
        .schemas(declarations())
        .caster("SomeHandle", "ScriptHandle", |data| {
            handle_type(data).as_deref() == Some("script")
        })
        .caster("SomeHandle", "ValueHandle", |data| {
            handle_type(data).as_deref() != Some("script")
        })
        .strict(strict)
        .build()
}
