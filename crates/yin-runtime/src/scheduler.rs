//! The cooperative scheduler (§4.9).
//!
//! Each VM instance owns one `Scheduler`: a run-queue of resumable frames
//! and a wait-set of parked ones. This layer is deliberately single
//! threaded and carries no OS concurrency primitive — unlike the
//! green-thread scheduler this project's teacher uses for real strands,
//! spec.md §5 requires cooperative scheduling *within* one VM instance,
//! with no preemption and no cross-thread sharing of run-queue/wait-set
//! state. Parking and waking are plain data transitions.
//!
//! Generic over `C`, the VM-specific bundle of "what to resume with" —
//! typically a `(Continuation, Rc<Env>)` pair — so the same park/wake/
//! close-propagation algorithm serves every backend without duplicating
//! it four times.

use std::collections::VecDeque;

use yin_core::{CursorRef, StreamId, Value};

use crate::stream::StreamTable;

/// Why a continuation is sitting in the wait-set.
#[derive(Debug, Clone, PartialEq)]
pub enum ParkReason {
    /// Parked on `stream/next`; resumed with the value read (or `nil` on
    /// close) once data is available.
    Next { cursor: CursorRef },
    /// Parked on `stream/put`; resumed once the stream is no longer at
    /// capacity, carrying the value that couldn't be appended.
    Put { stream: StreamId, pending_value: Value },
}

/// A frame parked in the wait-set.
#[derive(Debug, Clone)]
pub struct ParkedEntry<C> {
    pub continuation: C,
    pub reason: ParkReason,
}

/// A frame ready to run, with the value it should resume with (`None` for
/// a `Put` frame that is simply unblocked — the pending value is already
/// captured by the continuation itself via the effect that parked it).
#[derive(Debug, Clone)]
pub struct RunEntry<C> {
    pub continuation: C,
    pub resume_value: Option<Value>,
}

/// Run-queue + wait-set, and the park/wake-check/close-propagation
/// algorithm (§4.9).
#[derive(Debug)]
pub struct Scheduler<C> {
    run_queue: VecDeque<RunEntry<C>>,
    wait_set: Vec<ParkedEntry<C>>,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Scheduler { run_queue: VecDeque::new(), wait_set: Vec::new() }
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Scheduler::default()
    }

    pub fn is_idle(&self) -> bool {
        self.run_queue.is_empty() && self.wait_set.is_empty()
    }

    pub fn wait_set_len(&self) -> usize {
        self.wait_set.len()
    }

    /// Park `continuation`, blocked for `reason`.
    pub fn park(&mut self, continuation: C, reason: ParkReason) {
        self.wait_set.push(ParkedEntry { continuation, reason });
    }

    /// Scan the wait-set, moving every runnable entry onto the run-queue.
    /// A `:next` entry is runnable once its stream has data at the
    /// cursor's position, or is closed (resumed with `nil` in that case).
    /// A `:put` entry is runnable once its stream is below capacity.
    pub fn wake_check(&mut self, streams: &dyn StreamTable) {
        let mut still_waiting = Vec::with_capacity(self.wait_set.len());
        for entry in self.wait_set.drain(..) {
            match &entry.reason {
                ParkReason::Next { cursor } => {
                    if let Some(v) = streams.peek_at(cursor.stream, cursor.position) {
                        self.run_queue.push_back(RunEntry {
                            continuation: entry.continuation,
                            resume_value: Some(v),
                        });
                    } else if streams.table_closed(cursor.stream) {
                        self.run_queue.push_back(RunEntry {
                            continuation: entry.continuation,
                            resume_value: Some(Value::Nil),
                        });
                    } else {
                        still_waiting.push(entry);
                    }
                }
                ParkReason::Put { stream, .. } => {
                    let below_capacity = match streams.table_capacity(*stream) {
                        Some(cap) => streams.table_backlog(*stream) < cap,
                        None => true,
                    };
                    if below_capacity {
                        self.run_queue.push_back(RunEntry {
                            continuation: entry.continuation,
                            resume_value: None,
                        });
                    } else {
                        still_waiting.push(entry);
                    }
                }
            }
        }
        self.wait_set = still_waiting;
    }

    /// Closing a stream wakes every `:next` waiter blocked on it at once,
    /// with `nil` (§4.9, §8 law 7).
    pub fn close_propagate(&mut self, stream: StreamId) {
        let mut still_waiting = Vec::with_capacity(self.wait_set.len());
        for entry in self.wait_set.drain(..) {
            match &entry.reason {
                ParkReason::Next { cursor } if cursor.stream == stream => {
                    self.run_queue.push_back(RunEntry {
                        continuation: entry.continuation,
                        resume_value: Some(Value::Nil),
                    });
                }
                _ => still_waiting.push(entry),
            }
        }
        self.wait_set = still_waiting;
    }

    pub fn pop_runnable(&mut self) -> Option<RunEntry<C>> {
        self.run_queue.pop_front()
    }

    pub fn push_runnable(&mut self, continuation: C, resume_value: Option<Value>) {
        self.run_queue.push_back(RunEntry { continuation, resume_value });
    }

    /// The wait-set as it currently stands, for a caller that wants to
    /// export one of its entries (§4.10 "export continuation") without
    /// disturbing the others.
    pub fn wait_set_entries(&self) -> &[ParkedEntry<C>] {
        &self.wait_set
    }

    /// Remove and return the wait-set entry at `index`, e.g. because it is
    /// about to be exported and handed to another process. The caller is
    /// responsible for re-parking it (or an imported equivalent) if it
    /// still needs to resume locally.
    pub fn take_parked(&mut self, index: usize) -> ParkedEntry<C> {
        self.wait_set.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamStore;

    #[test]
    fn put_waiter_stays_parked_at_capacity_and_wakes_with_room() {
        let mut store = StreamStore::new();
        let s = store.make_default(Some(1));
        store.put(s, Value::int(1));

        let mut sched: Scheduler<&'static str> = Scheduler::new();
        sched.park("producer", ParkReason::Put { stream: s, pending_value: Value::int(2) });
        sched.wake_check(&store);
        assert!(sched.pop_runnable().is_none(), "still at capacity");
        assert_eq!(sched.wait_set_len(), 1);

        let mut roomy = StreamStore::new();
        let r = roomy.make_default(Some(2));
        roomy.put(r, Value::int(1));
        let mut sched2: Scheduler<&'static str> = Scheduler::new();
        sched2.park("producer2", ParkReason::Put { stream: r, pending_value: Value::int(2) });
        sched2.wake_check(&roomy);
        let runnable = sched2.pop_runnable().expect("should wake, capacity available");
        assert_eq!(runnable.continuation, "producer2");
    }

    #[test]
    fn close_wakes_all_next_waiters_at_once() {
        let mut store = StreamStore::new();
        let s = store.make_default(None);
        let c1 = store.cursor(s);
        let c2 = store.cursor(s);

        let mut sched: Scheduler<&'static str> = Scheduler::new();
        sched.park("consumer1", ParkReason::Next { cursor: c1 });
        sched.park("consumer2", ParkReason::Next { cursor: c2 });
        store.close(s);
        sched.close_propagate(s);

        assert_eq!(sched.wait_set_len(), 0);
        let first = sched.pop_runnable().unwrap();
        let second = sched.pop_runnable().unwrap();
        assert_eq!(first.resume_value, Some(Value::Nil));
        assert_eq!(second.resume_value, Some(Value::Nil));
    }
}
