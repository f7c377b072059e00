//! The fixed, enumerated attribute schema (§3) and the datom quintuple.

use crate::entity::EntityId;
use std::fmt;

/// One of the fixed, namespaced attributes a datom's `a` position may hold.
///
/// The schema is closed: projection and every VM backend match on this
/// enum exhaustively rather than comparing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Attribute {
    #[serde(rename = "yin/type")]
    Type,
    #[serde(rename = "yin/value")]
    Value,
    #[serde(rename = "yin/name")]
    Name,
    #[serde(rename = "yin/params")]
    Params,
    #[serde(rename = "yin/body")]
    Body,
    #[serde(rename = "yin/operator")]
    Operator,
    #[serde(rename = "yin/operands")]
    Operands,
    #[serde(rename = "yin/test")]
    Test,
    #[serde(rename = "yin/consequent")]
    Consequent,
    #[serde(rename = "yin/alternate")]
    Alternate,
    #[serde(rename = "yin/source")]
    Source,
    #[serde(rename = "yin/target")]
    Target,
    #[serde(rename = "yin/val")]
    Val,
    #[serde(rename = "yin/buffer")]
    Buffer,
    #[serde(rename = "yin/key")]
    Key,
    #[serde(rename = "yin/prefix")]
    Prefix,
    #[serde(rename = "yin/content-hash")]
    ContentHash,
}

impl Attribute {
    /// All attributes, in a fixed canonical order. Used by content
    /// addressing (§4.2 step 3, "sort the resulting pairs by attribute").
    pub const ALL: [Attribute; 17] = [
        Attribute::Alternate,
        Attribute::Body,
        Attribute::Buffer,
        Attribute::Consequent,
        Attribute::ContentHash,
        Attribute::Key,
        Attribute::Name,
        Attribute::Operands,
        Attribute::Operator,
        Attribute::Params,
        Attribute::Prefix,
        Attribute::Source,
        Attribute::Target,
        Attribute::Test,
        Attribute::Type,
        Attribute::Val,
        Attribute::Value,
    ];

    /// The dotted keyword form, e.g. `"yin/operator"`.
    pub fn keyword(self) -> &'static str {
        match self {
            Attribute::Type => "yin/type",
            Attribute::Value => "yin/value",
            Attribute::Name => "yin/name",
            Attribute::Params => "yin/params",
            Attribute::Body => "yin/body",
            Attribute::Operator => "yin/operator",
            Attribute::Operands => "yin/operands",
            Attribute::Test => "yin/test",
            Attribute::Consequent => "yin/consequent",
            Attribute::Alternate => "yin/alternate",
            Attribute::Source => "yin/source",
            Attribute::Target => "yin/target",
            Attribute::Val => "yin/val",
            Attribute::Buffer => "yin/buffer",
            Attribute::Key => "yin/key",
            Attribute::Prefix => "yin/prefix",
            Attribute::ContentHash => "yin/content-hash",
        }
    }

    /// Whether this attribute's value is an entity reference (or, for
    /// `Operands`, a vector of references).
    pub fn is_ref(self) -> bool {
        matches!(
            self,
            Attribute::Operator
                | Attribute::Operands
                | Attribute::Body
                | Attribute::Test
                | Attribute::Consequent
                | Attribute::Alternate
                | Attribute::Source
                | Attribute::Target
                | Attribute::Val
        )
    }

    /// The single cardinality-many attribute in the schema.
    pub fn is_cardinality_many(self) -> bool {
        matches!(self, Attribute::Operands)
    }

    /// Inverse of [`Attribute::keyword`], used when reconstructing
    /// attributes from a transport bundle's string-keyed `av-pairs`.
    pub fn from_keyword(s: &str) -> Option<Attribute> {
        Attribute::ALL.into_iter().find(|a| a.keyword() == s)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())
    }
}

/// A scalar value a datom may hold in its `v` position (anything that is
/// not itself an entity reference).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Symbol(String),
    Keyword(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(n) => write!(f, "{n}"),
            Scalar::Float(n) => write!(f, "{n}"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::String(s) => write!(f, "{s:?}"),
            Scalar::Symbol(s) => write!(f, "{s}"),
            Scalar::Keyword(s) => write!(f, ":{s}"),
        }
    }
}

/// The `v` position of a datom: a scalar, a single reference, or — for the
/// one cardinality-many attribute — an ordered vector of references.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum DatomValue {
    Scalar(Scalar),
    Ref(EntityId),
    RefList(Vec<EntityId>),
}

impl DatomValue {
    /// Entity ids this value references, in order.
    pub fn refs(&self) -> Vec<EntityId> {
        match self {
            DatomValue::Scalar(_) => Vec::new(),
            DatomValue::Ref(e) => vec![*e],
            DatomValue::RefList(es) => es.clone(),
        }
    }
}

/// The `m` value meaning "no metadata".
pub const META_NONE: EntityId = EntityId(0);

/// The distinguished `m` value marking a datom as derived (e.g. a
/// content-hash annotation appended after the fact, §4.2).
pub const META_DERIVED: EntityId = EntityId(1);

/// A single fact: `(e, a, v, t, m)` — see §3.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Datom {
    pub e: EntityId,
    pub a: Attribute,
    pub v: DatomValue,
    pub t: i64,
    pub m: EntityId,
}

impl Datom {
    pub fn new(e: EntityId, a: Attribute, v: DatomValue, t: i64) -> Self {
        Datom { e, a, v, t, m: META_NONE }
    }

    pub fn derived(e: EntityId, a: Attribute, v: DatomValue, t: i64) -> Self {
        Datom { e, a, v, t, m: META_DERIVED }
    }

    pub fn is_derived(&self) -> bool {
        self.m == META_DERIVED
    }
}
