//! Runtime values (§3) and the environment closures capture.

use crate::attribute::Scalar;
use crate::entity::EntityId;
use crate::stream_ref::{CursorRef, StreamId};
use std::collections::HashMap;
use std::rc::Rc;

/// A continuation handle, opaque to `Value` itself. The VM that owns the
/// continuation resolves it (reified continuations have no producing
/// primitive in this core — the variant exists so the type is complete per
/// §3's runtime-value enumeration, and so a host extension can expose one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ContinuationId(pub u64);

/// A parked-continuation handle — an index into a VM's wait-set (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ParkedId(pub u64);

/// Where a closure's body lives, depending on which VM backend created it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Body {
    /// Tree-walking and datom-graph backends: the body is an AST/datom
    /// entity id, re-evaluated on every call.
    Node(EntityId),
    /// Register backend: an instruction pointer into the owning VM's
    /// bytecode, plus the per-body register-file size the compiler
    /// recorded for it (§4.6 — "an invariant provided by the compiler").
    RegisterAddress { ip: usize, reg_count: usize },
    /// Stack backend: an instruction pointer into the owning VM's
    /// bytecode.
    StackAddress { ip: usize },
}

/// A finite, immutable mapping from name to value.
///
/// Closures capture the environment at their creation site (§3). Rather
/// than clone the whole mapping on every `lambda` application, extensions
/// are linked through a parent pointer — environments form a DAG (never a
/// cycle, since each extension can only point to an already-existing
/// parent), so `Rc` gives O(1) sharing with correct cleanup.
#[derive(Debug, Clone, Default)]
pub struct Env {
    bindings: HashMap<String, Value>,
    parent: Option<Rc<Env>>,
}

impl Env {
    pub fn empty() -> Rc<Env> {
        Rc::new(Env::default())
    }

    /// Extend `parent` with a new frame of bindings.
    pub fn extend(parent: &Rc<Env>, bindings: HashMap<String, Value>) -> Rc<Env> {
        Rc::new(Env { bindings, parent: Some(Rc::clone(parent)) })
    }

    /// Look up `name`, walking the parent chain.
    ///
    /// Uses membership-based lookup rather than `Option`-chaining on
    /// truthiness: a binding to `Bool(false)` is a hit, not a miss (§9,
    /// "Variable resolution correctness").
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(v) = self.bindings.get(name) {
            return Some(v);
        }
        match &self.parent {
            Some(parent) => parent.get(name),
            None => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// This frame's own bindings, not the parent chain — for callers (e.g.
    /// continuation export) that need to walk frames one at a time rather
    /// than resolve through them.
    pub fn own_bindings(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.bindings.iter()
    }

    pub fn parent_ref(&self) -> Option<&Env> {
        self.parent.as_deref()
    }
}

/// A closure: a lambda's parameters, its body, and the environment
/// captured at the moment the `lambda` node was evaluated.
#[derive(Debug, Clone)]
pub struct Closure {
    pub params: Vec<String>,
    pub body: Body,
    pub env: Rc<Env>,
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        // Closures are compared by identity of their body; two freshly
        // evaluated lambdas are never equal even with identical source.
        self.body == other.body && Rc::ptr_eq(&self.env, &other.env)
    }
}

/// A runtime value (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Resolution miss sentinel (§4.13: "resolves to nil for get-style
    /// paths"). Distinct from `Scalar(Bool(false))` so the two can never
    /// be confused by membership-based lookup.
    Nil,
    Scalar(Scalar),
    Closure(Rc<Closure>),
    StreamRef(StreamId),
    CursorRef(CursorRef),
    Continuation(ContinuationId),
    Parked(ParkedId),
    /// A resolved reference to a built-in or module-registered primitive
    /// (§4.11), named the way it was looked up: unnamespaced for the core
    /// primitive tier, `module/member` for a registered module. Carrying
    /// the name rather than a function pointer keeps `Value` plain data.
    Primitive(String),
}

impl Value {
    pub fn int(n: i64) -> Value {
        Value::Scalar(Scalar::Int(n))
    }

    pub fn float(n: f64) -> Value {
        Value::Scalar(Scalar::Float(n))
    }

    pub fn bool(b: bool) -> Value {
        Value::Scalar(Scalar::Bool(b))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::Scalar(Scalar::String(s.into()))
    }

    /// Truthiness is used only where the language explicitly asks for it
    /// (the `if` test); resolution logic must never use this in place of
    /// membership checks (§9).
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Scalar(Scalar::Bool(false)) | Value::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Scalar(Scalar::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Scalar(Scalar::Int(_)) => "int",
            Value::Scalar(Scalar::Float(_)) => "float",
            Value::Scalar(Scalar::Bool(_)) => "bool",
            Value::Scalar(Scalar::String(_)) => "string",
            Value::Scalar(Scalar::Symbol(_)) => "symbol",
            Value::Scalar(Scalar::Keyword(_)) => "keyword",
            Value::Closure(_) => "closure",
            Value::StreamRef(_) => "stream-ref",
            Value::CursorRef(_) => "cursor-ref",
            Value::Continuation(_) => "continuation",
            Value::Parked(_) => "parked-continuation",
            Value::Primitive(_) => "primitive",
        }
    }
}
