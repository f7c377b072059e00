//! Effect descriptors (§4.11): the closed tagged-union a primitive returns
//! when it needs to mutate VM state (store, streams) instead of just
//! computing a value.
//!
//! Per the REDESIGN FLAGS in spec.md §9, this is modeled as a real sum
//! type rather than a map with a discriminator field — a primitive's
//! result type is `Result<Outcome, VmError>` where `Outcome` is either a
//! plain value or one of these effects, so "unknown effect tag" becomes
//! unrepresentable rather than a runtime check.

use crate::stream_ref::{CursorRef, StreamId};
use crate::value::Value;

/// The effects a primitive may ask the VM to apply on its behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// `vm/store-put`: write `val` under `key` in the VM's global store.
    StorePut { key: Value, val: Value },
    /// `stream/make`: create a new stream with optional bounded capacity.
    StreamMake { capacity: Option<usize> },
    /// `stream/put`: append `val` to the stream named by `target`.
    StreamPut { target: StreamId, val: Value },
    /// `stream/cursor`: open a fresh cursor onto `source` at position 0.
    StreamCursor { source: StreamId },
    /// `stream/next`: advance `source`, reading the value at its position.
    StreamNext { source: CursorRef },
    /// `stream/close`: close the stream named by `target`.
    StreamClose { target: StreamId },
}

/// What evaluating a primitive call produces: either it's done, or the VM
/// must apply an effect and then resume with whatever the effect yields.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveOutcome {
    Value(Value),
    Effect(Effect),
}

impl From<Value> for PrimitiveOutcome {
    fn from(v: Value) -> Self {
        PrimitiveOutcome::Value(v)
    }
}

impl From<Effect> for PrimitiveOutcome {
    fn from(e: Effect) -> Self {
        PrimitiveOutcome::Effect(e)
    }
}
