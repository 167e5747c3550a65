//! Declarative schema descriptors.
//!
//! A [`SchemaDecl`] lists named fields with their decoders plus the
//! subtype wiring of the schema. Descriptors are plain data: they may name
//! schemas that are declared later, and the parser resolves those names
//! in a second pass.

use serde_json::Value;

/// How one field's JSON value is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Signed integer.
    Long,
    /// `true` / `false`.
    Boolean,
    /// Floating point number.
    Float,
    /// Any JSON number, kept as is.
    Number,
    /// UTF-8 string.
    String,
    /// Raw JSON object.
    Object,
    /// Any JSON value, kept as is.
    Json,
    /// One of the listed string constants, matched case-insensitively.
    Enum(&'static [&'static str]),
    /// Value present but ignored.
    Void,
    /// Nested instance of the named schema.
    Schema(&'static str),
    /// JSON array whose elements decode as the inner kind.
    List(Box<FieldKind>),
}

impl FieldKind {
    /// List of `inner`.
    #[must_use]
    pub fn list(inner: FieldKind) -> Self {
        Self::List(Box::new(inner))
    }

    /// Whether decoding recurses into schemas or containers.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Schema(_) | Self::List(_))
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    /// Accessor name.
    pub name: &'static str,
    /// Property name on the wire; defaults to `name`.
    pub json_name: &'static str,
    /// Decoder.
    pub kind: FieldKind,
    /// Absent property allowed; reads back as null.
    pub optional: bool,
    /// Explicit JSON `null` allowed.
    pub nullable: bool,
    /// Decode on first access instead of at parse time.
    pub lazy: bool,
}

impl FieldDecl {
    /// Required, non-null, eagerly decoded field.
    #[must_use]
    pub fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            json_name: name,
            kind,
            optional: false,
            nullable: false,
            lazy: false,
        }
    }

    /// Allow the property to be absent.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Allow an explicit JSON `null`.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Decode on first access.
    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Read the value from a differently named property.
    #[must_use]
    pub fn json_name(mut self, json_name: &'static str) -> Self {
        self.json_name = json_name;
        self
    }
}

/// Condition selecting an automatic subtype case.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Property equals the given JSON value.
    FieldEquals(&'static str, Value),
    /// Property is present (null counts as present).
    FieldPresent(&'static str),
    /// Property is absent.
    FieldAbsent(&'static str),
    /// Chosen when no other case matches. At most one per schema.
    Default,
}

impl Condition {
    /// Whether the condition holds for `object`. `Default` never matches
    /// here; it is only a fallback.
    #[must_use]
    pub fn matches(&self, object: &serde_json::Map<String, Value>) -> bool {
        match self {
            Self::FieldEquals(name, expected) => object.get(*name) == Some(expected),
            Self::FieldPresent(name) => object.contains_key(*name),
            Self::FieldAbsent(name) => !object.contains_key(*name),
            Self::Default => false,
        }
    }
}

/// How a subtype is selected from its base.
#[derive(Debug, Clone, PartialEq)]
pub enum SubtypeMode {
    /// Selected at decode time by a condition on the raw node.
    Auto(Condition),
    /// Selected later by an externally registered caster.
    Manual,
}

/// One subtype declared on a base schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtypeDecl {
    /// Subtype schema name.
    pub schema: &'static str,
    /// Selection mode.
    pub mode: SubtypeMode,
}

/// Descriptor of one schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDecl {
    /// Registry name.
    pub name: &'static str,
    /// Own fields; fields of the base schema are inherited.
    pub fields: Vec<FieldDecl>,
    /// Subtypes this schema can be viewed as.
    pub subtypes: Vec<SubtypeDecl>,
    /// Reject properties no schema in the family declares.
    pub closed: bool,
}

impl SchemaDecl {
    /// Empty open schema.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
            subtypes: Vec::new(),
            closed: false,
        }
    }

    /// Add a field.
    #[must_use]
    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    /// Add an automatic subtype case.
    #[must_use]
    pub fn auto_subtype(mut self, schema: &'static str, condition: Condition) -> Self {
        self.subtypes.push(SubtypeDecl {
            schema,
            mode: SubtypeMode::Auto(condition),
        });
        self
    }

    /// Add a manually cast subtype.
    #[must_use]
    pub fn manual_subtype(mut self, schema: &'static str) -> Self {
        self.subtypes.push(SubtypeDecl {
            schema,
            mode: SubtypeMode::Manual,
        });
        self
    }

    /// Reject unknown properties.
    #[must_use]
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }
}
