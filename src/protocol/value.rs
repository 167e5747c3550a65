//! Decoded field values and the scalar ("quick") decoders.

use serde_json::{Map, Number, Value};

use super::object_data::ObjectData;

/// A decoded field value.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Absent optional property or explicit null.
    Null,
    /// Integer.
    Long(i64),
    /// Boolean.
    Boolean(bool),
    /// Floating point number.
    Float(f64),
    /// Any JSON number.
    Number(Number),
    /// String.
    String(String),
    /// Raw JSON object.
    Object(Map<String, Value>),
    /// Any JSON value.
    Json(Value),
    /// Matched enum constant, as declared.
    Enum(&'static str),
    /// Ignored value.
    Void,
    /// Nested schema instance.
    Data(ObjectData),
    /// Decoded array.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Whether the value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Variant name, for error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Long(_) => "long",
            Self::Boolean(_) => "boolean",
            Self::Float(_) => "float",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Object(_) => "object",
            Self::Json(_) => "json",
            Self::Enum(_) => "enum",
            Self::Void => "void",
            Self::Data(_) => "schema instance",
            Self::List(_) => "list",
        }
    }
}

/// Scalar decoder: a pure function of the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QuickParser {
    Long,
    Boolean,
    Float,
    Number,
    String,
    Object,
    Json,
    Enum(&'static [&'static str]),
    Void,
}

impl QuickParser {
    /// Decode a non-null value. Failures carry a short cause.
    pub(crate) fn parse(self, value: &Value) -> std::result::Result<FieldValue, String> {
        match self {
            Self::Long => parse_long(value).map(FieldValue::Long),
            Self::Boolean => value
                .as_bool()
                .map(FieldValue::Boolean)
                .ok_or_else(|| expected("boolean", value)),
            Self::Float => value
                .as_f64()
                .map(FieldValue::Float)
                .ok_or_else(|| expected("float", value)),
            Self::Number => match value {
                Value::Number(number) => Ok(FieldValue::Number(number.clone())),
                other => Err(expected("number", other)),
            },
            Self::String => value
                .as_str()
                .map(|text| FieldValue::String(text.to_owned()))
                .ok_or_else(|| expected("string", value)),
            Self::Object => value
                .as_object()
                .map(|object| FieldValue::Object(object.clone()))
                .ok_or_else(|| expected("object", value)),
            Self::Json => Ok(FieldValue::Json(value.clone())),
            Self::Enum(constants) => {
                let text = value.as_str().ok_or_else(|| expected("enum string", value))?;
                constants
                    .iter()
                    .find(|constant| constant.eq_ignore_ascii_case(text))
                    .map(|constant| FieldValue::Enum(*constant))
                    .ok_or_else(|| format!("unknown enum constant {text:?}"))
            }
            Self::Void => Ok(FieldValue::Void),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn parse_long(value: &Value) -> std::result::Result<i64, String> {
    if let Some(long) = value.as_i64() {
        return Ok(long);
    }
    if value.as_u64().is_some() {
        return Err(format!("integer {value} out of range"));
    }
    match value.as_f64() {
        Some(float) if float.fract().abs() < f64::EPSILON && float.abs() < 9.0e15 => {
            Ok(float as i64)
        }
        _ => Err(expected("integer", value)),
    }
}

fn expected(what: &str, value: &Value) -> String {
    let found = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("expected {what}, found {found}")
}
