//! Schema registry construction and decode entry points.
//!
//! Building is two-phase because real schemas are mutually recursive:
//!
//! 1. one [`TypeHandler`] is created per declared schema; references to
//!    other schemas are recorded by name only;
//! 2. every reference is resolved to a handler index, subtype links and
//!    automatic cases are wired, externally supplied casters are attached
//!    to manual subtypes, and finally every manual subtype is checked to
//!    have a caster.
//!
//! Any inconsistency found while building is a configuration error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use super::object_data::{NodeData, ObjectData};
use super::schema::{Condition, FieldKind, SchemaDecl, SubtypeMode};
use super::value::QuickParser;
use crate::{AppError, Result};

/// Predicate deciding whether a decoded base instance is a given subtype.
pub type CastPredicate = Arc<dyn Fn(&ObjectData) -> bool + Send + Sync>;

/// Reference to a schema, resolved in the second build phase.
#[derive(Debug, Clone)]
pub(crate) struct TypeRef {
    pub(crate) name: &'static str,
    pub(crate) index: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum ValueParser {
    Quick(QuickParser),
    Schema(TypeRef),
    List(Box<ValueParser>),
}

impl ValueParser {
    fn from_kind(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Long => Self::Quick(QuickParser::Long),
            FieldKind::Boolean => Self::Quick(QuickParser::Boolean),
            FieldKind::Float => Self::Quick(QuickParser::Float),
            FieldKind::Number => Self::Quick(QuickParser::Number),
            FieldKind::String => Self::Quick(QuickParser::String),
            FieldKind::Object => Self::Quick(QuickParser::Object),
            FieldKind::Json => Self::Quick(QuickParser::Json),
            FieldKind::Enum(constants) => Self::Quick(QuickParser::Enum(constants)),
            FieldKind::Void => Self::Quick(QuickParser::Void),
            FieldKind::Schema(name) => Self::Schema(TypeRef {
                name,
                index: usize::MAX,
            }),
            FieldKind::List(inner) => Self::List(Box::new(Self::from_kind(inner))),
        }
    }

    pub(crate) fn is_structural(&self) -> bool {
        !matches!(self, Self::Quick(_))
    }

    fn resolve(&mut self, by_name: &HashMap<&'static str, usize>) -> std::result::Result<(), String> {
        match self {
            Self::Quick(_) => Ok(()),
            Self::Schema(type_ref) => {
                type_ref.index = *by_name
                    .get(type_ref.name)
                    .ok_or_else(|| format!("unknown schema {}", type_ref.name))?;
                Ok(())
            }
            Self::List(inner) => inner.resolve(by_name),
        }
    }
}

pub(crate) struct FieldLoader {
    pub(crate) name: &'static str,
    pub(crate) json_name: &'static str,
    pub(crate) parser: ValueParser,
    pub(crate) optional: bool,
    pub(crate) nullable: bool,
    pub(crate) lazy: bool,
}

pub(crate) struct AutoCase {
    pub(crate) condition: Condition,
    pub(crate) handler: usize,
}

/// Per-schema decode metadata.
pub(crate) struct TypeHandler {
    pub(crate) name: &'static str,
    pub(crate) fields: Vec<FieldLoader>,
    pub(crate) field_index: HashMap<&'static str, usize>,
    pub(crate) base: Option<usize>,
    pub(crate) auto_cases: Vec<AutoCase>,
    pub(crate) default_case: Option<usize>,
    pub(crate) manual_cases: HashMap<usize, Option<CastPredicate>>,
    pub(crate) closed: bool,
    pub(crate) known_properties: HashSet<&'static str>,
    pending_subtypes: Vec<(&'static str, SubtypeMode)>,
}

impl TypeHandler {
    pub(crate) fn has_auto_subtypes(&self) -> bool {
        !self.auto_cases.is_empty() || self.default_case.is_some()
    }
}

/// All handlers of one parser instance.
pub(crate) struct Registry {
    pub(crate) handlers: Vec<TypeHandler>,
    pub(crate) by_name: HashMap<&'static str, usize>,
    pub(crate) strict: bool,
}

impl Registry {
    pub(crate) fn index_of(&self, schema: &str) -> Result<usize> {
        self.by_name
            .get(schema)
            .copied()
            .ok_or_else(|| AppError::Config(format!("schema {schema} is not registered")))
    }

    /// Handler `index` followed by its bases, nearest first.
    pub(crate) fn chain(&self, index: usize) -> Vec<usize> {
        let mut chain = vec![index];
        let mut current = index;
        while let Some(base) = self.handlers[current].base {
            chain.push(base);
            current = base;
        }
        chain
    }
}

/// Collects schema declarations and casters, then builds a parser.
#[derive(Default)]
pub struct ParserBuilder {
    decls: Vec<SchemaDecl>,
    casters: Vec<(&'static str, &'static str, CastPredicate)>,
    strict: bool,
}

impl ParserBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare one schema.
    #[must_use]
    pub fn schema(mut self, decl: SchemaDecl) -> Self {
        self.decls.push(decl);
        self
    }

    /// Declare several schemas.
    #[must_use]
    pub fn schemas(mut self, decls: impl IntoIterator<Item = SchemaDecl>) -> Self {
        self.decls.extend(decls);
        self
    }

    /// Supply the caster that turns a `base` instance into `subtype`.
    #[must_use]
    pub fn caster(
        mut self,
        base: &'static str,
        subtype: &'static str,
        predicate: impl Fn(&ObjectData) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.casters.push((base, subtype, Arc::new(predicate)));
        self
    }

    /// Treat every schema as closed.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Run both build phases.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for duplicate schemas, unresolved
    /// references, conflicting subtype declarations, or manual subtypes
    /// without a caster.
    pub fn build(self) -> Result<ProtocolParser> {
        let mut registry = create_handlers(self.decls, self.strict)?;
        resolve_references(&mut registry)?;
        wire_subtypes(&mut registry)?;
        attach_casters(&mut registry, self.casters)?;
        verify_casters(&registry)?;
        check_chains(&registry)?;
        collect_known_properties(&mut registry);
        Ok(ProtocolParser {
            registry: Arc::new(registry),
        })
    }
}

// ── Phase 1 ───────────────────────────────────────────────────────────────────

fn create_handlers(decls: Vec<SchemaDecl>, strict: bool) -> Result<Registry> {
    let mut handlers = Vec::with_capacity(decls.len());
    let mut by_name = HashMap::new();

    for decl in decls {
        if by_name.insert(decl.name, handlers.len()).is_some() {
            return Err(AppError::Config(format!(
                "schema {} is declared twice",
                decl.name
            )));
        }

        let mut field_index = HashMap::new();
        let mut fields = Vec::with_capacity(decl.fields.len());
        for field in decl.fields {
            if field_index.insert(field.name, fields.len()).is_some() {
                return Err(AppError::Config(format!(
                    "schema {} declares field {} twice",
                    decl.name, field.name
                )));
            }
            fields.push(FieldLoader {
                name: field.name,
                json_name: field.json_name,
                parser: ValueParser::from_kind(&field.kind),
                optional: field.optional,
                nullable: field.nullable,
                lazy: field.lazy,
            });
        }

        handlers.push(TypeHandler {
            name: decl.name,
            fields,
            field_index,
            base: None,
            auto_cases: Vec::new(),
            default_case: None,
            manual_cases: HashMap::new(),
            closed: decl.closed,
            known_properties: HashSet::new(),
            pending_subtypes: decl
                .subtypes
                .into_iter()
                .map(|subtype| (subtype.schema, subtype.mode))
                .collect(),
        });
    }

    Ok(Registry {
        handlers,
        by_name,
        strict,
    })
}

// ── Phase 2 ───────────────────────────────────────────────────────────────────

fn resolve_references(registry: &mut Registry) -> Result<()> {
    let by_name = &registry.by_name;
    for handler in &mut registry.handlers {
        for field in &mut handler.fields {
            field.parser.resolve(by_name).map_err(|cause| {
                AppError::Config(format!(
                    "schema {} field {}: {cause}",
                    handler.name, field.name
                ))
            })?;
        }
    }
    Ok(())
}

fn wire_subtypes(registry: &mut Registry) -> Result<()> {
    for base in 0..registry.handlers.len() {
        let pending = std::mem::take(&mut registry.handlers[base].pending_subtypes);
        for (subtype_name, mode) in pending {
            let base_name = registry.handlers[base].name;
            let subtype = *registry.by_name.get(subtype_name).ok_or_else(|| {
                AppError::Config(format!(
                    "schema {base_name} declares unknown subtype {subtype_name}"
                ))
            })?;
            if subtype == base {
                return Err(AppError::Config(format!(
                    "schema {base_name} cannot be its own subtype"
                )));
            }
            if let Some(existing) = registry.handlers[subtype].base {
                return Err(AppError::Config(format!(
                    "schema {subtype_name} is already a subtype of {}",
                    registry.handlers[existing].name
                )));
            }
            registry.handlers[subtype].base = Some(base);

            let handler = &mut registry.handlers[base];
            match mode {
                SubtypeMode::Auto(Condition::Default) => {
                    if handler.default_case.is_some() {
                        return Err(AppError::Config(format!(
                            "schema {base_name} declares more than one default subtype"
                        )));
                    }
                    handler.default_case = Some(subtype);
                }
                SubtypeMode::Auto(condition) => handler.auto_cases.push(AutoCase {
                    condition,
                    handler: subtype,
                }),
                SubtypeMode::Manual => {
                    handler.manual_cases.insert(subtype, None);
                }
            }
        }
    }
    Ok(())
}

fn attach_casters(
    registry: &mut Registry,
    casters: Vec<(&'static str, &'static str, CastPredicate)>,
) -> Result<()> {
    for (base_name, subtype_name, predicate) in casters {
        let base = registry.index_of(base_name)?;
        let subtype = registry.index_of(subtype_name)?;
        let slot = registry.handlers[base]
            .manual_cases
            .get_mut(&subtype)
            .ok_or_else(|| {
                AppError::Config(format!(
                    "{subtype_name} is not a manual subtype of {base_name}"
                ))
            })?;
        *slot = Some(predicate);
    }
    Ok(())
}

fn verify_casters(registry: &Registry) -> Result<()> {
    for handler in &registry.handlers {
        for (subtype, caster) in &handler.manual_cases {
            if caster.is_none() {
                return Err(AppError::Config(format!(
                    "no caster registered for manual subtype {} of {}",
                    registry.handlers[*subtype].name, handler.name
                )));
            }
        }
    }
    Ok(())
}

fn check_chains(registry: &Registry) -> Result<()> {
    let limit = registry.handlers.len();
    for (index, handler) in registry.handlers.iter().enumerate() {
        let mut steps = 0;
        let mut current = index;
        while let Some(base) = registry.handlers[current].base {
            steps += 1;
            if steps > limit {
                return Err(AppError::Config(format!(
                    "schema {} has a cyclic subtype chain",
                    handler.name
                )));
            }
            current = base;
        }
    }
    Ok(())
}

/// A property is known to a schema if any schema in its base chain or any
/// of its (transitive) subtypes declares it.
fn collect_known_properties(registry: &mut Registry) {
    let count = registry.handlers.len();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (index, handler) in registry.handlers.iter().enumerate() {
        if let Some(base) = handler.base {
            children[base].push(index);
        }
    }

    let mut known = Vec::with_capacity(count);
    for index in 0..count {
        let mut properties = HashSet::new();
        for member in registry.chain(index) {
            add_own_properties(&registry.handlers[member], &mut properties);
        }
        let mut stack = children[index].clone();
        while let Some(descendant) = stack.pop() {
            add_own_properties(&registry.handlers[descendant], &mut properties);
            stack.extend(children[descendant].iter().copied());
        }
        known.push(properties);
    }

    for (handler, properties) in registry.handlers.iter_mut().zip(known) {
        handler.known_properties = properties;
    }
}

fn add_own_properties(handler: &TypeHandler, properties: &mut HashSet<&'static str>) {
    properties.extend(handler.fields.iter().map(|field| field.json_name));
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// Schema-driven decoder over untyped JSON trees. Cheap to clone.
#[derive(Clone)]
pub struct ProtocolParser {
    registry: Arc<Registry>,
}

impl ProtocolParser {
    /// Start declaring schemas.
    #[must_use]
    pub fn builder() -> ParserBuilder {
        ParserBuilder::new()
    }

    /// Whether `schema` is registered.
    #[must_use]
    pub fn has_schema(&self, schema: &str) -> bool {
        self.registry.by_name.contains_key(schema)
    }

    /// Decode `value` as `schema`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unregistered schema and
    /// `AppError::Protocol` when the value does not fit the schema.
    pub fn parse(&self, value: Value, schema: &str) -> Result<ObjectData> {
        self.parse_shared(Arc::new(value), schema)
    }

    /// Decode a JSON document held in an `Arc`, without copying it.
    ///
    /// # Errors
    ///
    /// Same as [`ProtocolParser::parse`].
    pub fn parse_shared(&self, root: Arc<Value>, schema: &str) -> Result<ObjectData> {
        let index = self.registry.index_of(schema)?;
        let node = NodeData::new(Arc::clone(&self.registry), root, String::new());
        ObjectData::decode(node, index)
    }

    /// Decode JSON text as `schema`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for invalid JSON, otherwise the errors
    /// of [`ProtocolParser::parse`].
    pub fn parse_str(&self, json: &str, schema: &str) -> Result<ObjectData> {
        let value: Value = serde_json::from_str(json)?;
        self.parse(value, schema)
    }

    /// Decode a JSON array whose elements are all `schema`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if `value` is not an array or any
    /// element fails to decode.
    pub fn parse_list(&self, value: Value, schema: &str) -> Result<Vec<ObjectData>> {
        let index = self.registry.index_of(schema)?;
        let root = Arc::new(value);
        let Some(elements) = root.as_array() else {
            return Err(AppError::Protocol(format!(
                "Failed to parse type {schema}: expected array"
            )));
        };
        (0..elements.len())
            .map(|position| {
                let node = NodeData::new(
                    Arc::clone(&self.registry),
                    Arc::clone(&root),
                    format!("/{position}"),
                );
                ObjectData::decode(node, index)
            })
            .collect()
    }
}
