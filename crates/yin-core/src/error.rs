//! Fatal error taxonomy shared by every VM backend (§4.13, §7).
//!
//! All fatal errors abort the current step with a descriptor carrying the
//! error kind, the offending entity id or instruction pointer, and a
//! snapshot of the relevant VM state. Expected suspensions (stream park)
//! are *not* represented here — they are a normal `step` outcome, not an
//! error (§4.13).

use crate::entity::EntityId;
use std::fmt;

/// The kind of fatal condition, independent of which backend hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    /// Unknown `yin/type` value, or an opcode outside the dispatch table.
    UnknownNode,
    /// A required attribute is missing, or a reference points nowhere.
    MalformedProgram,
    /// `apply` was called on a non-function value.
    ApplyNonFunction,
    /// Content hashing found a cycle in the entity graph.
    CyclicDependency,
    /// Bundle import found a cycle among its entries.
    CyclicDependencyInBundle,
    /// `stream/put` (or an effect from it) targeted an already-closed
    /// stream.
    PutOnClosedStream,
    /// Continuation import referenced a closure body hash with no
    /// corresponding bundle entry.
    UnknownClosureBodyHash,
}

impl fmt::Display for VmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmErrorKind::UnknownNode => "unknown node type or opcode",
            VmErrorKind::MalformedProgram => "malformed program",
            VmErrorKind::ApplyNonFunction => "apply on non-function",
            VmErrorKind::CyclicDependency => "cyclic-dependency",
            VmErrorKind::CyclicDependencyInBundle => "cyclic-dependency-in-bundle",
            VmErrorKind::PutOnClosedStream => "put on closed stream",
            VmErrorKind::UnknownClosureBodyHash => "unknown closure body hash",
        };
        write!(f, "{s}")
    }
}

/// A snapshot of the VM at the moment a fatal error was raised, for
/// diagnostics. Each backend renders its own `Control`/`Continuation`
/// through `Debug`/`Display` rather than this crate knowing their shape.
#[derive(Debug, Clone, Default)]
pub struct ErrorSnapshot {
    pub control: Option<String>,
    pub continuation_top: Option<String>,
}

/// A fatal VM error (§7): kind, offending location, and a state snapshot.
#[derive(Debug, Clone)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub detail: String,
    pub entity: Option<EntityId>,
    pub ip: Option<usize>,
    pub snapshot: ErrorSnapshot,
}

impl VmError {
    pub fn new(kind: VmErrorKind, detail: impl Into<String>) -> Self {
        VmError {
            kind,
            detail: detail.into(),
            entity: None,
            ip: None,
            snapshot: ErrorSnapshot::default(),
        }
    }

    pub fn with_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_ip(mut self, ip: usize) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_snapshot(mut self, snapshot: ErrorSnapshot) -> Self {
        self.snapshot = snapshot;
        self
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)?;
        if let Some(e) = self.entity {
            write!(f, " (entity {e})")?;
        }
        if let Some(ip) = self.ip {
            write!(f, " (ip {ip})")?;
        }
        Ok(())
    }
}

impl std::error::Error for VmError {}
