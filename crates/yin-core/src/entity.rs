//! Entity identity — the local "gauge" for a datom set.
//!
//! An [`EntityId`] is only meaningful within one datom set. Negative values
//! are tempids assigned during AST projection (§4.1); they become positive
//! once a transactor resolves them against an indexed store. This crate has
//! no transactor — it only needs to tell tempids and resolved ids apart.

use std::fmt;

/// A locally-unique entity identifier.
///
/// Negative values are unresolved tempids. Entity identity is a gauge: it
/// has no meaning outside the datom set it was assigned in. Global identity
/// is the content hash (see `yin-runtime::hash`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl EntityId {
    /// A tempid is any negative entity id.
    pub fn is_tempid(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId(value)
    }
}

/// A strictly-decreasing tempid allocator.
///
/// Projection (§4.1) draws ids from this counter so that the root of an AST
/// always receives the largest (least negative) id and every dependency a
/// smaller one — a free topological order (`max` = root, `min - 1` = next
/// fresh id) without a separate sort pass.
#[derive(Debug, Clone)]
pub struct TempidAllocator {
    next: i64,
}

impl Default for TempidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TempidAllocator {
    pub fn new() -> Self {
        TempidAllocator { next: -1 }
    }

    /// Allocate the next fresh tempid, decrementing the counter.
    pub fn fresh(&mut self) -> EntityId {
        let id = EntityId(self.next);
        self.next -= 1;
        id
    }
}
