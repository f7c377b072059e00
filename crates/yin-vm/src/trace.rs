//! The trace surface (§4.12): an opt-in instrumented run that emits
//! datoms describing each step into a `yin-runtime` stream, so a trace is
//! queryable by the same stream/cursor mechanism as any other stream of
//! data — not a side-channel log file.
//!
//! Implemented first (and, for this workspace, only) on the register VM
//! per the Open Question resolution in spec.md §9 ("the register backend
//! first, others later, all conforming to the same trace datom schema").
//! Other backends can adopt the same [`TraceEvent`]/[`TraceSink`] pair
//! without changing this schema.

use serde::{Deserialize, Serialize};

use yin_core::{StreamId, Value};
use yin_runtime::StreamStore;

/// Default snapshot cadence (§4.12: "snapshot every 64 steps").
pub const DEFAULT_CADENCE: u64 = 64;

/// A value as it appears in a trace record: by default only its type tag
/// is carried (§4.12, "values carry type tags only"); the raw value is
/// included only when the caller opts in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TracedValue {
    TypeTag(&'static str),
    Raw(String),
}

impl TracedValue {
    fn of(v: &Value, raw: bool) -> TracedValue {
        if raw {
            TracedValue::Raw(format!("{v:?}"))
        } else {
            TracedValue::TypeTag(v.type_tag())
        }
    }
}

/// One step-level trace datom: opcode, ip before/after, and whatever of
/// branch-taken/call-target/return-value-tag applies to that opcode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub step: u64,
    pub opcode: i64,
    pub ip_before: usize,
    pub ip_after: usize,
    pub branch_taken: Option<bool>,
    pub call_target: Option<TracedValue>,
    pub return_value: Option<TracedValue>,
}

/// A periodic register-file snapshot, at the configured cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    pub step: u64,
    pub registers: Vec<TracedValue>,
}

/// Run-level datoms: recorded once at load and once at halt/park.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub vm_kind: String,
    pub program_id: Option<String>,
    pub start_ip: usize,
    pub end_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TraceEvent {
    Run(RunEvent),
    Step(StepEvent),
    RegisterSnapshot(RegisterSnapshot),
}

/// Trace configuration plus the stream trace events are appended to.
/// Carried by a VM as an optional field — absent unless a caller opts in
/// (§9, "the trace surface ... specified but out of the default path").
pub struct TraceSink {
    pub stream: StreamId,
    pub cadence: u64,
    pub raw_values: bool,
    step_since_snapshot: u64,
}

impl TraceSink {
    /// Open a fresh, unbounded trace stream in `streams` and return a
    /// sink that appends to it.
    pub fn new(streams: &mut StreamStore, cadence: u64, raw_values: bool) -> TraceSink {
        let stream = streams.make_default(None);
        TraceSink { stream, cadence, raw_values, step_since_snapshot: 0 }
    }

    fn emit(&self, streams: &mut StreamStore, event: &TraceEvent) {
        let json = serde_json::to_string(event).expect("trace events always serialize");
        // A trace sink's own stream is never bounded, so `put` cannot
        // report `Full`/`Closed` here.
        let _ = streams.put(self.stream, Value::string(json));
    }

    pub fn run_started(&self, streams: &mut StreamStore, vm_kind: &str, program_id: Option<String>, start_ip: usize) {
        self.emit(
            streams,
            &TraceEvent::Run(RunEvent { vm_kind: vm_kind.to_string(), program_id, start_ip, end_reason: None }),
        );
    }

    pub fn run_ended(&self, streams: &mut StreamStore, vm_kind: &str, end_reason: &str) {
        self.emit(
            streams,
            &TraceEvent::Run(RunEvent {
                vm_kind: vm_kind.to_string(),
                program_id: None,
                start_ip: 0,
                end_reason: Some(end_reason.to_string()),
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &self,
        streams: &mut StreamStore,
        step: u64,
        opcode: i64,
        ip_before: usize,
        ip_after: usize,
        branch_taken: Option<bool>,
        call_target: Option<&Value>,
        return_value: Option<&Value>,
    ) {
        self.emit(
            streams,
            &TraceEvent::Step(StepEvent {
                step,
                opcode,
                ip_before,
                ip_after,
                branch_taken,
                call_target: call_target.map(|v| TracedValue::of(v, self.raw_values)),
                return_value: return_value.map(|v| TracedValue::of(v, self.raw_values)),
            }),
        );
    }

    /// Record a register-file snapshot if `cadence` steps have elapsed
    /// since the last one.
    pub fn maybe_snapshot(&mut self, streams: &mut StreamStore, step: u64, registers: &[Value]) {
        self.step_since_snapshot += 1;
        if self.step_since_snapshot < self.cadence {
            return;
        }
        self.step_since_snapshot = 0;
        let registers = registers.iter().map(|v| TracedValue::of(v, self.raw_values)).collect();
        self.emit(streams, &TraceEvent::RegisterSnapshot(RegisterSnapshot { step, registers }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yin_runtime::NextResult;

    #[test]
    fn trace_events_land_on_a_readable_stream() {
        let mut streams = StreamStore::new();
        let sink = TraceSink::new(&mut streams, DEFAULT_CADENCE, false);
        sink.run_started(&mut streams, "register", Some("sha256:deadbeef".into()), 0);
        sink.step(&mut streams, 1, 0, 0, 3, None, None, Some(&Value::int(42)));

        let mut cursor = streams.cursor(sink.stream);
        let mut seen = Vec::new();
        loop {
            match streams.next(cursor) {
                NextResult::Ok(v, next) => {
                    seen.push(v);
                    cursor = next;
                }
                _ => break,
            }
        }
        assert_eq!(seen.len(), 2);
        let Value::Scalar(yin_core::Scalar::String(json)) = &seen[1] else {
            panic!("expected a JSON string scalar");
        };
        assert!(json.contains("\"step\":1"));
    }

    #[test]
    fn snapshot_only_fires_at_cadence() {
        let mut streams = StreamStore::new();
        let mut sink = TraceSink::new(&mut streams, 2, false);
        sink.maybe_snapshot(&mut streams, 1, &[Value::int(1)]);
        assert_eq!(streams.length(sink.stream), 0, "first step under cadence emits nothing");
        sink.maybe_snapshot(&mut streams, 2, &[Value::int(1)]);
        assert_eq!(streams.length(sink.stream), 1, "second step hits cadence");
    }

    #[test]
    fn type_tag_only_by_default() {
        let v = Value::string("secret");
        match TracedValue::of(&v, false) {
            TracedValue::TypeTag(t) => assert_eq!(t, "string"),
            TracedValue::Raw(_) => panic!("raw values must be opt-in"),
        }
    }
}
