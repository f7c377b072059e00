//! Yin Core: value representation and the attribute schema shared by
//! every backend of the Yin execution engine.
//!
//! Key design principles:
//! - `Value`: what a Yin program talks about (scalars, closures, stream
//!   and cursor handles). Independent of any particular VM's control or
//!   continuation representation.
//! - `Datom`: the flat `(e, a, v, t, m)` fact that every AST node lowers
//!   to (§4.1). `Attribute` is the closed schema those facts draw from.
//! - `AstNode`: the nested, map-shaped program a front-end parser emits —
//!   the *input* to projection, not a VM's working representation.
//!
//! This crate has no I/O and no notion of a running VM; `yin-runtime`
//! builds the datom/stream/scheduler machinery on top of it, and
//! `yin-vm` builds the four CESK backends on top of that.

pub mod ast;
pub mod attribute;
pub mod effect;
pub mod entity;
pub mod error;
pub mod stream_ref;
pub mod value;

pub use ast::AstNode;
pub use attribute::{Attribute, Datom, DatomValue, Scalar, META_DERIVED, META_NONE};
pub use effect::{Effect, PrimitiveOutcome};
pub use entity::{EntityId, TempidAllocator};
pub use error::{ErrorSnapshot, VmError, VmErrorKind};
pub use stream_ref::{CursorRef, StreamId};
pub use value::{Body, Closure, ContinuationId, Env, ParkedId, Value};
