//! Value-level handles into the stream core (`yin-runtime::stream`).
//!
//! These are plain data — copyable, comparable, serializable — because §3
//! requires cursors to be *values* external to the stream they read, and
//! stream-refs to flow through the environment/store like any other value.

use std::fmt;

/// A handle to a stream living in a VM's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// An external, value-typed read pointer into a stream. Multiple cursors
/// over the same stream advance independently; reading through one does
/// not consume data for any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CursorRef {
    pub stream: StreamId,
    pub position: usize,
}

impl CursorRef {
    pub fn new(stream: StreamId) -> Self {
        CursorRef { stream, position: 0 }
    }

    pub fn advanced(self) -> Self {
        CursorRef { position: self.position + 1, ..self }
    }

    pub fn seek(self, position: usize) -> Self {
        CursorRef { position, ..self }
    }
}
