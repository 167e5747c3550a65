//! Typed views over decoded V8 messages and handles.

use serde_json::Value;

use crate::protocol::{ObjectData, ProtocolParser};
use crate::{AppError, Result};

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Response to an earlier request.
    Response(CommandResponse),
    /// Unsolicited event.
    Event(EventNotification),
}

impl Incoming {
    /// Decode JSON text as an `IncomingMessage`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the text is not a V8 message.
    pub fn parse(parser: &ProtocolParser, json: &str) -> Result<Self> {
        let message = parser.parse_str(json, "IncomingMessage")?;
        if let Some(response) = message.view("CommandResponse") {
            return Ok(Self::Response(CommandResponse(response)));
        }
        if let Some(event) = message.view("EventNotification") {
            return Ok(Self::Event(EventNotification(event)));
        }
        Err(AppError::Protocol(
            "Failed to parse type IncomingMessage: unknown message type".into(),
        ))
    }
}

/// A `type: "response"` message.
#[derive(Debug, Clone)]
pub struct CommandResponse(ObjectData);

impl CommandResponse {
    /// Sequence number of the request this answers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is malformed.
    pub fn request_seq(&self) -> Result<u64> {
        let seq = self.0.long("request_seq")?;
        u64::try_from(seq).map_err(|_| {
            AppError::Protocol(format!("Failed to parse type CommandResponse: negative request_seq {seq}"))
        })
    }

    /// Echoed command name.
    #[must_use]
    pub fn command(&self) -> Option<String> {
        self.0.opt_string("command").ok().flatten()
    }

    /// Whether the VM is running after the command.
    #[must_use]
    pub fn running(&self) -> Option<bool> {
        self.0.opt_boolean("running").ok().flatten()
    }

    /// The success view, if `success` is true.
    #[must_use]
    pub fn success(&self) -> Option<SuccessResponse> {
        self.0.view("SuccessCommandResponse").map(SuccessResponse)
    }

    /// The failure view, if `success` is false.
    #[must_use]
    pub fn failure(&self) -> Option<FailedResponse> {
        self.0.view("FailedCommandResponse").map(FailedResponse)
    }

    /// Convert a remote failure into `AppError::RemoteCommand`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RemoteCommand` carrying the remote message.
    pub fn into_result(self) -> Result<SuccessResponse> {
        if let Some(success) = self.success() {
            return Ok(success);
        }
        let message = self
            .failure()
            .and_then(|failure| failure.message())
            .unwrap_or_else(|| "unknown failure".into());
        Err(AppError::RemoteCommand(message))
    }
}

/// A response with `success: true`.
#[derive(Debug, Clone)]
pub struct SuccessResponse(ObjectData);

impl SuccessResponse {
    /// Decode the body as `schema`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the body does not fit.
    pub fn body_as(&self, schema: &str) -> Result<ObjectData> {
        self.0.decode_property("body", schema)
    }

    /// Decode an array body element-wise as `schema`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the body is not an array of `schema`.
    pub fn body_list(&self, schema: &str) -> Result<Vec<ObjectData>> {
        self.0.decode_property_list("body", schema)
    }

    /// Decode an object body entry-wise as `schema`, keyed by property.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the body is not a map of `schema`.
    pub fn body_map(&self, schema: &str) -> Result<Vec<(String, ObjectData)>> {
        self.0.decode_property_map("body", schema)
    }

    /// Handles inlined in the response.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if an entry is not a handle.
    pub fn refs(&self) -> Result<Vec<SomeHandle>> {
        Ok(self.0.data_list("refs")?.into_iter().map(SomeHandle).collect())
    }

    /// Whether the VM is running after the command.
    #[must_use]
    pub fn running(&self) -> Option<bool> {
        self.0.opt_boolean("running").ok().flatten()
    }
}

/// A response with `success: false`.
#[derive(Debug, Clone)]
pub struct FailedResponse(ObjectData);

impl FailedResponse {
    /// Remote failure message.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.0.opt_string("message").ok().flatten()
    }

    /// Structured failure details, if the remote sent any.
    #[must_use]
    pub fn error_details(&self) -> Option<&Value> {
        self.0.raw().get("error_details").filter(|details| !details.is_null())
    }

    /// Decode the details as `schema`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if there are no details or they do not fit.
    pub fn details_as(&self, schema: &str) -> Result<ObjectData> {
        self.0.decode_property("error_details", schema)
    }
}

/// A `type: "event"` message.
#[derive(Debug, Clone)]
pub struct EventNotification(ObjectData);

impl EventNotification {
    /// Event name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is malformed.
    pub fn event(&self) -> Result<String> {
        self.0.string("event")
    }

    /// Decode the body as `schema`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the body does not fit.
    pub fn body_as(&self, schema: &str) -> Result<ObjectData> {
        self.0.decode_property("body", schema)
    }

    /// Handles inlined in the event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if an entry is not a handle.
    pub fn refs(&self) -> Result<Vec<SomeHandle>> {
        Ok(self.0.data_list("refs")?.into_iter().map(SomeHandle).collect())
    }
}

/// Any remote object identified by a handle.
#[derive(Debug, Clone)]
pub struct SomeHandle(pub ObjectData);

impl SomeHandle {
    /// Remote handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is malformed.
    pub fn handle(&self) -> Result<i64> {
        self.0.long("handle")
    }

    /// Handle type, e.g. `script`, `object`, `number`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is malformed.
    pub fn type_name(&self) -> Result<String> {
        self.0.string("type")
    }

    /// Whether the handle describes a script.
    #[must_use]
    pub fn is_script(&self) -> bool {
        self.type_name().is_ok_and(|kind| kind == "script")
    }

    /// Cast to a script handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the handle is not a script.
    pub fn as_script(&self) -> Result<ScriptHandle> {
        self.0.cast("ScriptHandle").map(ScriptHandle)
    }

    /// Cast to a value handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the handle is a script.
    pub fn as_value(&self) -> Result<ValueHandle> {
        self.0.cast("ValueHandle").map(ValueHandle)
    }
}

/// Script description.
#[derive(Debug, Clone)]
pub struct ScriptHandle(pub ObjectData);

impl ScriptHandle {
    /// Script id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is malformed.
    pub fn id(&self) -> Result<i64> {
        self.0.long("id")
    }

    /// Script name, if it is a string.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.0
            .json("name")
            .ok()
            .and_then(|name| name.as_str().map(str::to_owned))
    }

    /// Line offset within the containing document.
    #[must_use]
    pub fn line_offset(&self) -> i64 {
        self.0.opt_long("lineOffset").ok().flatten().unwrap_or_default()
    }

    /// Column offset within the containing document.
    #[must_use]
    pub fn column_offset(&self) -> i64 {
        self.0.opt_long("columnOffset").ok().flatten().unwrap_or_default()
    }

    /// Number of lines, if reported.
    #[must_use]
    pub fn line_count(&self) -> Option<i64> {
        self.0.opt_long("lineCount").ok().flatten()
    }

    /// Source text, if it was included.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is malformed.
    pub fn source(&self) -> Result<Option<String>> {
        self.0.opt_string("source")
    }
}

/// Value description.
#[derive(Debug, Clone)]
pub struct ValueHandle(pub ObjectData);

impl ValueHandle {
    /// Remote handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is malformed.
    pub fn handle(&self) -> Result<i64> {
        self.0.long("handle")
    }

    /// Value type.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is malformed.
    pub fn type_name(&self) -> Result<String> {
        self.0.string("type")
    }

    /// Class name of objects.
    #[must_use]
    pub fn class_name(&self) -> Option<String> {
        self.0.opt_string("className").ok().flatten()
    }

    /// Primitive value, null for objects.
    #[must_use]
    pub fn value(&self) -> Value {
        self.0.json("value").unwrap_or(Value::Null)
    }

    /// Display text.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        self.0.opt_string("text").ok().flatten()
    }

    /// Declared properties of an object value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the property list is malformed.
    pub fn properties(&self) -> Result<Vec<ObjectData>> {
        self.0.data_list("properties")
    }
}
