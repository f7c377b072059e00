//! Stream core (§4.8): an append-only log with external cursors over a
//! pluggable storage backend. Pure data operations — nothing here
//! blocks; suspension is layered on top by the scheduler (§4.9).

use std::collections::HashMap;

use yin_core::{CursorRef, StreamId, Value};

/// The storage contract a stream is built on.
pub trait StreamStorage: std::fmt::Debug {
    fn append(&mut self, value: Value);
    fn read_at(&self, position: usize) -> Option<Value>;
    fn length(&self) -> usize;
    /// The lowest position still retained. Backends that never evict can
    /// always return 0; a backend that prunes old entries returns the
    /// new floor so `next` can report [`NextResult::Gap`].
    fn min_retained(&self) -> usize {
        0
    }
}

/// Default backend: vector-backed, in-memory, nothing ever evicted.
#[derive(Debug, Default)]
pub struct VecStorage {
    values: Vec<Value>,
}

impl StreamStorage for VecStorage {
    fn append(&mut self, value: Value) {
        self.values.push(value);
    }

    fn read_at(&self, position: usize) -> Option<Value> {
        self.values.get(position).cloned()
    }

    fn length(&self) -> usize {
        self.values.len()
    }
}

/// `{ storage_handle, capacity (None = unbounded), closed? }` (§3).
#[derive(Debug)]
pub struct Stream {
    storage: Box<dyn StreamStorage>,
    capacity: Option<usize>,
    closed: bool,
    /// High-water mark: one past the furthest position any cursor has
    /// successfully read. Capacity is governed by the unread backlog
    /// (`storage.length() - consumed`), not total appended length, so a
    /// drained stream frees a slot for the next `put` (§4.9, §8 scenario
    /// 8) — the same `send_count - receive_count` queue-depth shape the
    /// teacher's channel stats use, adapted to a shared read watermark
    /// since cursors here aren't registered with the stream individually.
    consumed: usize,
}

impl Stream {
    pub fn new(storage: Box<dyn StreamStorage>, capacity: Option<usize>) -> Self {
        Stream { storage, capacity, closed: false, consumed: 0 }
    }

    fn backlog(&self) -> usize {
        self.storage.length().saturating_sub(self.consumed)
    }
}

/// Outcome of [`StreamStore::put`].
#[derive(Debug, Clone, PartialEq)]
pub enum PutResult {
    Ok,
    /// Capacity reached; the caller should park (§4.9).
    Full,
    /// The stream is closed — fatal, not a suspension (§4.13).
    Closed,
}

/// Outcome of [`StreamStore::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum NextResult {
    Ok(Value, CursorRef),
    /// Open, no data at the cursor's position yet — park (§4.9).
    Blocked,
    /// Closed, no data at the cursor's position — done for good.
    End,
    /// The cursor's position was evicted by the storage backend.
    Gap,
}

/// A registry of streams, keyed by [`StreamId`], with the §4.8 operation
/// table implemented over it.
#[derive(Debug, Default)]
pub struct StreamStore {
    streams: HashMap<StreamId, Stream>,
    next_id: u64,
}

impl StreamStore {
    pub fn new() -> Self {
        StreamStore::default()
    }

    pub fn make(&mut self, storage: Box<dyn StreamStorage>, capacity: Option<usize>) -> StreamId {
        self.next_id += 1;
        let id = StreamId(self.next_id);
        self.streams.insert(id, Stream::new(storage, capacity));
        id
    }

    pub fn make_default(&mut self, capacity: Option<usize>) -> StreamId {
        self.make(Box::new(VecStorage::default()), capacity)
    }

    fn get(&self, id: StreamId) -> &Stream {
        self.streams.get(&id).expect("stream id must be live for the lifetime of its VM")
    }

    fn get_mut(&mut self, id: StreamId) -> &mut Stream {
        self.streams.get_mut(&id).expect("stream id must be live for the lifetime of its VM")
    }

    pub fn put(&mut self, id: StreamId, value: Value) -> PutResult {
        let stream = self.get_mut(id);
        if stream.closed {
            return PutResult::Closed;
        }
        if let Some(cap) = stream.capacity {
            if stream.backlog() >= cap {
                return PutResult::Full;
            }
        }
        stream.storage.append(value);
        PutResult::Ok
    }

    /// Idempotent: closing an already-closed stream is a no-op (§8 law 7).
    pub fn close(&mut self, id: StreamId) {
        self.get_mut(id).closed = true;
    }

    pub fn cursor(&self, id: StreamId) -> CursorRef {
        CursorRef::new(id)
    }

    pub fn seek(&self, cursor: CursorRef, position: usize) -> CursorRef {
        cursor.seek(position)
    }

    pub fn next(&mut self, cursor: CursorRef) -> NextResult {
        let stream = self.get_mut(cursor.stream);
        if cursor.position < stream.storage.min_retained() {
            return NextResult::Gap;
        }
        match stream.storage.read_at(cursor.position) {
            Some(v) => {
                stream.consumed = stream.consumed.max(cursor.position + 1);
                NextResult::Ok(v, cursor.advanced())
            }
            None if stream.closed => NextResult::End,
            None => NextResult::Blocked,
        }
    }

    pub fn length(&self, id: StreamId) -> usize {
        self.get(id).storage.length()
    }

    pub fn is_closed(&self, id: StreamId) -> bool {
        self.get(id).closed
    }
}

/// The read-only surface the scheduler's wake-check needs (§4.9) —
/// implemented by [`StreamStore`] so the scheduler stays decoupled from
/// storage details.
pub trait StreamTable {
    fn peek_at(&self, stream: StreamId, position: usize) -> Option<Value>;
    fn table_length(&self, stream: StreamId) -> usize;
    /// Unread backlog: appended minus consumed, the quantity capacity is
    /// actually measured against (§4.9) — not `table_length`.
    fn table_backlog(&self, stream: StreamId) -> usize;
    fn table_closed(&self, stream: StreamId) -> bool;
    fn table_capacity(&self, stream: StreamId) -> Option<usize>;
}

impl StreamTable for StreamStore {
    fn peek_at(&self, stream: StreamId, position: usize) -> Option<Value> {
        self.get(stream).storage.read_at(position)
    }

    fn table_length(&self, stream: StreamId) -> usize {
        self.length(stream)
    }

    fn table_backlog(&self, stream: StreamId) -> usize {
        self.get(stream).backlog()
    }

    fn table_closed(&self, stream: StreamId) -> bool {
        self.is_closed(stream)
    }

    fn table_capacity(&self, stream: StreamId) -> Option<usize> {
        self.get(stream).capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_cursors_observe_the_same_order() {
        let mut store = StreamStore::new();
        let s = store.make_default(None);
        for i in 0..3 {
            assert_eq!(store.put(s, Value::int(i)), PutResult::Ok);
        }
        let mut c1 = store.cursor(s);
        let mut c2 = store.cursor(s);
        for expect in 0..3 {
            match store.next(c1) {
                NextResult::Ok(v, next) => {
                    assert_eq!(v, Value::int(expect));
                    c1 = next;
                }
                other => panic!("expected Ok, got {other:?}"),
            }
            match store.next(c2) {
                NextResult::Ok(v, next) => {
                    assert_eq!(v, Value::int(expect));
                    c2 = next;
                }
                other => panic!("expected Ok, got {other:?}"),
            }
        }
        store.close(s);
        assert_eq!(store.next(c1), NextResult::End);
        assert_eq!(store.next(c2), NextResult::End);
        // Idempotent close.
        store.close(s);
        assert!(store.is_closed(s));
    }

    #[test]
    fn put_on_full_bounded_stream_reports_full() {
        let mut store = StreamStore::new();
        let s = store.make_default(Some(1));
        assert_eq!(store.put(s, Value::int(1)), PutResult::Ok);
        assert_eq!(store.put(s, Value::int(2)), PutResult::Full);
    }

    #[test]
    fn put_on_closed_stream_is_rejected() {
        let mut store = StreamStore::new();
        let s = store.make_default(None);
        store.close(s);
        assert_eq!(store.put(s, Value::int(1)), PutResult::Closed);
    }

    #[test]
    fn next_on_empty_open_stream_blocks() {
        let mut store = StreamStore::new();
        let s = store.make_default(None);
        let c = store.cursor(s);
        assert_eq!(store.next(c), NextResult::Blocked);
    }

    #[test]
    fn draining_a_read_value_frees_capacity_for_the_next_put() {
        let mut store = StreamStore::new();
        let s = store.make_default(Some(1));
        assert_eq!(store.put(s, Value::int(1)), PutResult::Ok);
        assert_eq!(store.put(s, Value::int(2)), PutResult::Full, "still full before anything is read");

        let c = store.cursor(s);
        match store.next(c) {
            NextResult::Ok(v, _) => assert_eq!(v, Value::int(1)),
            other => panic!("expected Ok, got {other:?}"),
        }

        // Nothing was evicted from storage...
        assert_eq!(store.length(s), 1);
        // ...but the unread backlog is now zero, so a slot is free.
        assert_eq!(store.put(s, Value::int(2)), PutResult::Ok);
        assert_eq!(store.length(s), 2);
    }
}
