//! Decoded schema instances.
//!
//! Every decoded JSON node is a [`NodeData`]: the shared root document, a
//! JSON pointer to the node, and one lazily filled part per schema the node
//! has been viewed as. An [`ObjectData`] is a node plus the schema it is
//! currently viewed as, so a base instance and its subtype views share the
//! same node and therefore the same identity and memoized fields.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};

use super::parser::{FieldLoader, Registry, ValueParser};
use super::value::FieldValue;
use crate::{AppError, Result};

static NULL: Value = Value::Null;

/// Decoded state of one node for one schema.
pub(crate) struct TypedPart {
    slots: Vec<OnceLock<FieldValue>>,
    subtype: Option<usize>,
}

/// One raw JSON node and the schema views decoded over it.
pub(crate) struct NodeData {
    registry: Arc<Registry>,
    root: Arc<Value>,
    pointer: String,
    parts: Vec<OnceLock<Arc<TypedPart>>>,
}

impl NodeData {
    pub(crate) fn new(registry: Arc<Registry>, root: Arc<Value>, pointer: String) -> Arc<Self> {
        let parts = (0..registry.handlers.len()).map(|_| OnceLock::new()).collect();
        Arc::new(Self {
            registry,
            root,
            pointer,
            parts,
        })
    }

    fn raw(&self) -> &Value {
        if self.pointer.is_empty() {
            return &self.root;
        }
        self.root.pointer(&self.pointer).unwrap_or(&NULL)
    }

    fn child(&self, segment: &str) -> Arc<Self> {
        let escaped = segment.replace('~', "~0").replace('/', "~1");
        Self::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.root),
            format!("{}/{escaped}", self.pointer),
        )
    }
}

/// A node viewed as one schema.
#[derive(Clone)]
pub struct ObjectData {
    node: Arc<NodeData>,
    handler: usize,
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("schema", &self.schema_name())
            .field("pointer", &self.node.pointer)
            .finish_non_exhaustive()
    }
}

impl ObjectData {
    /// Decode `node` as handler `index`, including its base chain.
    pub(crate) fn decode(node: Arc<NodeData>, index: usize) -> Result<Self> {
        let chain = node.registry.chain(index);
        for member in chain.iter().rev() {
            ensure_part(&node, *member)?;
        }
        Ok(Self {
            node,
            handler: index,
        })
    }

    /// Name of the schema this view decodes as.
    #[must_use]
    pub fn schema_name(&self) -> &'static str {
        self.node.registry.handlers[self.handler].name
    }

    /// The raw JSON node.
    #[must_use]
    pub fn raw(&self) -> &Value {
        self.node.raw()
    }

    /// Whether both views are over the same decoded node.
    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// View of the direct base schema, if any.
    #[must_use]
    pub fn base(&self) -> Option<Self> {
        self.node.registry.handlers[self.handler]
            .base
            .map(|base| Self {
                node: Arc::clone(&self.node),
                handler: base,
            })
    }

    /// The automatic subtype chosen at decode time, if the schema has any.
    #[must_use]
    pub fn resolved_subtype(&self) -> Option<Self> {
        let part = self.node.parts[self.handler].get()?;
        part.subtype.map(|subtype| Self {
            node: Arc::clone(&self.node),
            handler: subtype,
        })
    }

    /// Follow automatic subtypes down to the most specific view.
    #[must_use]
    pub fn most_specific(&self) -> Self {
        let mut current = self.clone();
        while let Some(next) = current.resolved_subtype() {
            current = next;
        }
        current
    }

    /// Find the view named `schema` along the base chain or the chosen
    /// automatic subtypes of this node.
    #[must_use]
    pub fn view(&self, schema: &str) -> Option<Self> {
        let target = self.node.registry.by_name.get(schema).copied()?;
        if self.node.parts[target].get().is_some() {
            return Some(Self {
                node: Arc::clone(&self.node),
                handler: target,
            });
        }
        None
    }

    /// Cast to a manually selected subtype, running its caster.
    ///
    /// Casting is memoized per node: casting twice yields views over the
    /// same node.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `schema` is not a manual subtype of
    /// this view and `AppError::Protocol` if the caster rejects the node or
    /// the node fails to decode as the subtype.
    pub fn cast(&self, schema: &str) -> Result<Self> {
        let registry = &self.node.registry;
        let target = registry.index_of(schema)?;
        let handler = &registry.handlers[self.handler];
        let Some(Some(caster)) = handler.manual_cases.get(&target) else {
            return Err(AppError::Config(format!(
                "{schema} is not a manual subtype of {}",
                handler.name
            )));
        };

        if self.node.parts[target].get().is_none() && !caster(self) {
            return Err(AppError::Protocol(format!(
                "Failed to parse type {schema}: value is not a {schema}"
            )));
        }
        ensure_part(&self.node, target)?;
        Ok(Self {
            node: Arc::clone(&self.node),
            handler: target,
        })
    }

    /// The manual subtype view, only if it has already been cast.
    #[must_use]
    pub fn cast_if_resolved(&self, schema: &str) -> Option<Self> {
        let target = self.node.registry.by_name.get(schema).copied()?;
        let handler = &self.node.registry.handlers[self.handler];
        if !handler.manual_cases.contains_key(&target) {
            return None;
        }
        self.view(schema)
    }

    /// Decode the property `property` of this node as `schema`, sharing the
    /// root document. The result is not memoized.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the property is missing or does not
    /// fit the schema.
    pub fn decode_property(&self, property: &str, schema: &str) -> Result<Self> {
        let index = self.node.registry.index_of(schema)?;
        if self.raw().get(property).is_none() {
            return Err(AppError::Protocol(format!(
                "Failed to parse type {schema}: property '{property}' is missing in {}",
                self.schema_name()
            )));
        }
        Self::decode(self.node.child(property), index)
    }

    /// Decode the array property `property` element-wise as `schema`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the property is not an array or an
    /// element does not fit the schema.
    pub fn decode_property_list(&self, property: &str, schema: &str) -> Result<Vec<Self>> {
        let index = self.node.registry.index_of(schema)?;
        let Some(elements) = self.raw().get(property).and_then(Value::as_array) else {
            return Err(AppError::Protocol(format!(
                "Failed to parse type {schema}: expected array"
            )));
        };
        let list = self.node.child(property);
        (0..elements.len())
            .map(|position| Self::decode(list.child(&position.to_string()), index))
            .collect()
    }

    /// Decode every entry of the object property `property` as `schema`,
    /// keyed by property name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the property is not an object or an
    /// entry does not fit the schema.
    pub fn decode_property_map(&self, property: &str, schema: &str) -> Result<Vec<(String, Self)>> {
        let index = self.node.registry.index_of(schema)?;
        let Some(entries) = self.raw().get(property).and_then(Value::as_object) else {
            return Err(AppError::Protocol(format!(
                "Failed to parse type {schema}: expected object map"
            )));
        };
        let map = self.node.child(property);
        entries
            .keys()
            .map(|key| Ok((key.clone(), Self::decode(map.child(key), index)?)))
            .collect()
    }

    // ── Field access ─────────────────────────────────────────────────────────

    /// Decoded value of the field `name`, declared on this schema or one
    /// of its bases.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if no such field is declared or a lazy
    /// field fails to decode.
    pub fn field(&self, name: &str) -> Result<FieldValue> {
        let registry = &self.node.registry;
        let Some((owner, position)) = registry.chain(self.handler).into_iter().find_map(|index| {
            registry.handlers[index]
                .field_index
                .get(name)
                .map(|position| (index, *position))
        }) else {
            return Err(AppError::Protocol(format!(
                "schema {} has no field '{name}'",
                self.schema_name()
            )));
        };

        let part = ensure_part(&self.node, owner)?;
        if let Some(value) = part.slots[position].get() {
            return Ok(value.clone());
        }

        let handler = &registry.handlers[owner];
        let loader = &handler.fields[position];
        let object = self
            .raw()
            .as_object()
            .ok_or_else(|| parse_error(handler.name, "expected JSON object"))?;
        let value = load_field(&self.node, handler.name, loader, object)?;
        if !loader.parser.is_structural() {
            return Ok(value);
        }
        let _ = part.slots[position].set(value.clone());
        Ok(part.slots[position].get().cloned().unwrap_or(value))
    }

    /// Required integer field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is null or not an integer.
    pub fn long(&self, name: &str) -> Result<i64> {
        match self.field(name)? {
            FieldValue::Long(value) => Ok(value),
            other => Err(self.mismatch(name, "long", &other)),
        }
    }

    /// Optional integer field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is present but not an integer.
    pub fn opt_long(&self, name: &str) -> Result<Option<i64>> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Long(value) => Ok(Some(value)),
            other => Err(self.mismatch(name, "long", &other)),
        }
    }

    /// Required boolean field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is null or not a boolean.
    pub fn boolean(&self, name: &str) -> Result<bool> {
        match self.field(name)? {
            FieldValue::Boolean(value) => Ok(value),
            other => Err(self.mismatch(name, "boolean", &other)),
        }
    }

    /// Optional boolean field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is present but not a boolean.
    pub fn opt_boolean(&self, name: &str) -> Result<Option<bool>> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Boolean(value) => Ok(Some(value)),
            other => Err(self.mismatch(name, "boolean", &other)),
        }
    }

    /// Required string field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is null or not a string.
    pub fn string(&self, name: &str) -> Result<String> {
        match self.field(name)? {
            FieldValue::String(value) => Ok(value),
            other => Err(self.mismatch(name, "string", &other)),
        }
    }

    /// Optional string field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is present but not a string.
    pub fn opt_string(&self, name: &str) -> Result<Option<String>> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::String(value) => Ok(Some(value)),
            other => Err(self.mismatch(name, "string", &other)),
        }
    }

    /// Required enum field, as its declared constant.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is null or not an enum.
    pub fn enum_value(&self, name: &str) -> Result<&'static str> {
        match self.field(name)? {
            FieldValue::Enum(value) => Ok(value),
            other => Err(self.mismatch(name, "enum", &other)),
        }
    }

    /// Optional enum field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is present but not an enum.
    pub fn opt_enum_value(&self, name: &str) -> Result<Option<&'static str>> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Enum(value) => Ok(Some(value)),
            other => Err(self.mismatch(name, "enum", &other)),
        }
    }

    /// Any-JSON field; null when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is not a JSON field.
    pub fn json(&self, name: &str) -> Result<Value> {
        match self.field(name)? {
            FieldValue::Null => Ok(Value::Null),
            FieldValue::Json(value) => Ok(value),
            FieldValue::Object(map) => Ok(Value::Object(map)),
            other => Err(self.mismatch(name, "json", &other)),
        }
    }

    /// Raw-object field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is not an object field.
    pub fn opt_object(&self, name: &str) -> Result<Option<Map<String, Value>>> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Object(value) => Ok(Some(value)),
            other => Err(self.mismatch(name, "object", &other)),
        }
    }

    /// Required nested schema instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is null or not a schema.
    pub fn data(&self, name: &str) -> Result<Self> {
        match self.field(name)? {
            FieldValue::Data(value) => Ok(value),
            other => Err(self.mismatch(name, "schema instance", &other)),
        }
    }

    /// Optional nested schema instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is present but not a schema.
    pub fn opt_data(&self, name: &str) -> Result<Option<Self>> {
        match self.field(name)? {
            FieldValue::Null => Ok(None),
            FieldValue::Data(value) => Ok(Some(value)),
            other => Err(self.mismatch(name, "schema instance", &other)),
        }
    }

    /// List of nested schema instances; empty when absent. Null elements
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is not a list of schemas.
    pub fn data_list(&self, name: &str) -> Result<Vec<Self>> {
        match self.field(name)? {
            FieldValue::Null => Ok(Vec::new()),
            FieldValue::List(items) => items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(|item| match item {
                    FieldValue::Data(value) => Ok(value),
                    other => Err(self.mismatch(name, "schema instance", &other)),
                })
                .collect(),
            other => Err(self.mismatch(name, "list", &other)),
        }
    }

    /// List of integers; empty when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the field is not a list of integers.
    pub fn long_list(&self, name: &str) -> Result<Vec<i64>> {
        match self.field(name)? {
            FieldValue::Null => Ok(Vec::new()),
            FieldValue::List(items) => items
                .into_iter()
                .map(|item| match item {
                    FieldValue::Long(value) => Ok(value),
                    other => Err(self.mismatch(name, "long", &other)),
                })
                .collect(),
            other => Err(self.mismatch(name, "list", &other)),
        }
    }

    fn mismatch(&self, name: &str, wanted: &str, found: &FieldValue) -> AppError {
        parse_error(
            self.schema_name(),
            &format!("field '{name}': expected {wanted}, found {}", found.kind_name()),
        )
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

fn parse_error(schema: &str, cause: &str) -> AppError {
    AppError::Protocol(format!("Failed to parse type {schema}: {cause}"))
}

fn cause_text(err: &AppError) -> String {
    match err {
        AppError::Protocol(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Decode the part of `node` for handler `index` once, eager fields and
/// automatic subtype included.
fn ensure_part(node: &Arc<NodeData>, index: usize) -> Result<Arc<TypedPart>> {
    let slot = &node.parts[index];
    if let Some(part) = slot.get() {
        return Ok(Arc::clone(part));
    }

    let registry = Arc::clone(&node.registry);
    let handler = &registry.handlers[index];
    let object = node
        .raw()
        .as_object()
        .ok_or_else(|| parse_error(handler.name, "expected JSON object"))?;

    if handler.closed || registry.strict {
        if let Some(unknown) = object
            .keys()
            .find(|key| !handler.known_properties.contains(key.as_str()))
        {
            return Err(parse_error(
                handler.name,
                &format!("unexpected property '{unknown}'"),
            ));
        }
    }

    let slots: Vec<OnceLock<FieldValue>> = handler.fields.iter().map(|_| OnceLock::new()).collect();
    for (position, loader) in handler.fields.iter().enumerate() {
        if loader.lazy {
            continue;
        }
        let value = load_field(node, handler.name, loader, object)?;
        let _ = slots[position].set(value);
    }

    let subtype = if handler.has_auto_subtypes() {
        let matched: Vec<usize> = handler
            .auto_cases
            .iter()
            .filter(|case| case.condition.matches(object))
            .map(|case| case.handler)
            .collect();
        let chosen = match matched.as_slice() {
            [] => handler.default_case.ok_or_else(|| {
                parse_error(handler.name, "no subtype case matches the value")
            })?,
            [single] => *single,
            _ => {
                let names: Vec<&str> = matched
                    .iter()
                    .map(|case| registry.handlers[*case].name)
                    .collect();
                return Err(parse_error(
                    handler.name,
                    &format!("ambiguous subtype, matches {}", names.join(", ")),
                ));
            }
        };
        Some(chosen)
    } else {
        None
    };

    let part = Arc::new(TypedPart { slots, subtype });
    let _ = slot.set(Arc::clone(&part));

    if let Some(chosen) = subtype {
        ensure_part(node, chosen).map_err(|err| {
            parse_error(
                handler.name,
                &format!(
                    "subtype {}: {}",
                    registry.handlers[chosen].name,
                    cause_text(&err)
                ),
            )
        })?;
    }

    Ok(slot.get().map_or(part, Arc::clone))
}

fn load_field(
    node: &Arc<NodeData>,
    schema: &str,
    loader: &FieldLoader,
    object: &Map<String, Value>,
) -> Result<FieldValue> {
    let field_error = |cause: &str| parse_error(schema, &format!("field '{}': {cause}", loader.name));

    let value = match object.get(loader.json_name) {
        None if loader.optional => return Ok(FieldValue::Null),
        None => return Err(field_error("required property is missing")),
        Some(Value::Null) if loader.nullable => return Ok(FieldValue::Null),
        Some(Value::Null) => return Err(field_error("null is not allowed")),
        Some(value) => value,
    };

    let child = node.child(loader.json_name);
    parse_value(&child, &loader.parser, value).map_err(|cause| field_error(cause.as_str()))
}

fn parse_value(
    node: &Arc<NodeData>,
    parser: &ValueParser,
    value: &Value,
) -> std::result::Result<FieldValue, String> {
    match parser {
        ValueParser::Quick(quick) => quick.parse(value),
        ValueParser::Schema(type_ref) => ObjectData::decode(Arc::clone(node), type_ref.index)
            .map(FieldValue::Data)
            .map_err(|err| cause_text(&err)),
        ValueParser::List(inner) => {
            let elements = value.as_array().ok_or("expected array")?;
            elements
                .iter()
                .enumerate()
                .map(|(position, element)| {
                    if element.is_null() {
                        return Ok(FieldValue::Null);
                    }
                    let child = node.child(&position.to_string());
                    parse_value(&child, inner, element)
                        .map_err(|cause| format!("element {position}: {cause}"))
                })
                .collect::<std::result::Result<Vec<_>, String>>()
                .map(FieldValue::List)
        }
    }
}
