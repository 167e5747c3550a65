//! Schema-driven decoding of loosely typed JSON payloads.
//!
//! - `schema`: declarative descriptors ([`SchemaDecl`], [`FieldDecl`]).
//! - `parser`: two-phase registry build and [`ProtocolParser`].
//! - `object_data`: decoded instances ([`ObjectData`]) with eager, lazy
//!   and memoized structural fields plus subtype views.
//! - `value`: decoded field values.
//! - `v8`: the V8 debugger vocabulary built on top of the above.

pub mod object_data;
pub mod parser;
pub mod schema;
pub mod v8;
pub mod value;

pub use object_data::ObjectData;
pub use parser::{CastPredicate, ParserBuilder, ProtocolParser};
pub use schema::{Condition, FieldDecl, FieldKind, SchemaDecl, SubtypeMode};
pub use value::FieldValue;
