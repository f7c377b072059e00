//! The tree-walking VM (§4.4).
//!
//! Control is either the current entity (about to be evaluated) or a
//! value (about to be delivered to the top of the continuation). The
//! continuation is a singly-linked chain of frames — cheap to capture by
//! cloning an `Rc` when a computation parks, since a frame never needs to
//! be mutated once pushed.

use std::collections::HashMap;
use std::rc::Rc;

use yin_core::{
    Attribute, Body, Closure, DatomValue, Effect, Env, EntityId, PrimitiveOutcome, Scalar, Value,
    VmError, VmErrorKind,
};
use yin_runtime::{
    content_hashes, export_env, export_value, import_env, import_value, project, DatomIndex, ExportedValue,
    ModuleRegistry, NextResult, ParkReason, PutResult, Scheduler, Sha256Hasher, Store, StreamStore,
};

use crate::cesk::{CeskVm, Status};
use crate::support::value_key;

#[derive(Debug, Clone)]
enum Control {
    Node(EntityId),
    Value(Value),
}

/// The frame kinds named in §3's continuation shape, plus one addition
/// (`StreamCloseSource`) for `stream/close`'s sub-expression — the
/// schema there lists `stream-put`/`stream-cursor`/`stream-next` frames
/// but `stream/close` needs the same treatment for its own source
/// expression, so it gets the analogous frame kind.
#[derive(Debug, Clone)]
enum FrameKind {
    EvalOperator { operand_ids: Vec<EntityId> },
    EvalOperand { op_value: Value, operand_ids: Vec<EntityId>, evaluated: Vec<Value> },
    EvalTest { consequent: EntityId, alternate: EntityId },
    EvalStorePutVal { key: String },
    EvalStreamPutTarget { val_id: EntityId },
    EvalStreamPutVal { target: yin_core::StreamId },
    /// Re-entered on wake: retries a put that previously reported `Full`,
    /// now that the stream has room. Carries its own value rather than
    /// relying on the resumed `Control`, since the scheduler's run-queue
    /// entry for a `:put` wake doesn't carry one (§4.9).
    RetryStreamPut { stream: yin_core::StreamId, value: Value },
    EvalStreamCursorSource,
    EvalStreamNextSource,
    EvalStreamCloseSource,
}

#[derive(Debug, Clone)]
struct Frame {
    kind: FrameKind,
    env: Rc<Env>,
    next: Link,
}

type Link = Option<Rc<Frame>>;

fn push(link: &Link, kind: FrameKind, env: Rc<Env>) -> Link {
    Some(Rc::new(Frame { kind, env, next: link.clone() }))
}

pub struct TreeWalkVm {
    idx: DatomIndex,
    control: Control,
    env: Rc<Env>,
    store: Store,
    cont: Link,
    registry: ModuleRegistry,
    streams: StreamStore,
    scheduler: Scheduler<Link>,
    gensym_counter: u64,
    status: Status,
    steps: u64,
}

impl TreeWalkVm {
    pub fn new(registry: ModuleRegistry) -> Self {
        TreeWalkVm {
            idx: DatomIndex::build(&[]),
            control: Control::Value(Value::Nil),
            env: Env::empty(),
            store: Store::new(),
            cont: None,
            registry,
            streams: StreamStore::new(),
            scheduler: Scheduler::new(),
            gensym_counter: 0,
            status: Status::Halted,
            steps: 0,
        }
    }

    pub fn streams(&self) -> &StreamStore {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut StreamStore {
        &mut self.streams
    }

    /// Drive the wake check from outside (e.g. a test simulating a
    /// concurrent reader advancing a shared cursor); `eval` already calls
    /// this on its own once blocked, but progress past that point
    /// requires whatever external actor frees capacity or supplies data.
    pub fn wake_check(&mut self) {
        self.scheduler.wake_check(&self.streams);
    }

    fn type_error(&self, what: &str, v: &Value) -> VmError {
        VmError::new(VmErrorKind::ApplyNonFunction, format!("{what}: unexpected {}", v.type_tag()))
    }

    fn step_node(&mut self, id: EntityId) -> Result<(), VmError> {
        let type_name = self
            .idx
            .type_name(id)
            .ok_or_else(|| VmError::new(VmErrorKind::UnknownNode, "entity has no yin/type datom").with_entity(id))?;

        match type_name {
            "literal" => {
                let v = match self.idx.attr(id, Attribute::Value) {
                    Some(DatomValue::Scalar(s)) => Value::Scalar(s.clone()),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "literal missing yin/value").with_entity(id)),
                };
                self.control = Control::Value(v);
            }
            "variable" => {
                let name = match self.idx.attr(id, Attribute::Name) {
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.clone(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "variable missing yin/name").with_entity(id)),
                };
                let v = yin_runtime::resolve(&name, &self.env, &self.store, &self.registry).unwrap_or(Value::Nil);
                self.control = Control::Value(v);
            }
            "lambda" => {
                let params = match self.idx.attr(id, Attribute::Params) {
                    Some(DatomValue::Scalar(Scalar::String(s))) if s.is_empty() => Vec::new(),
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.split(',').map(String::from).collect(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "lambda missing yin/params").with_entity(id)),
                };
                let body_id = match self.idx.attr(id, Attribute::Body) {
                    Some(DatomValue::Ref(r)) => *r,
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "lambda missing yin/body").with_entity(id)),
                };
                let closure = Closure { params, body: Body::Node(body_id), env: Rc::clone(&self.env) };
                self.control = Control::Value(Value::Closure(Rc::new(closure)));
            }
            "application" => {
                let op_id = match self.idx.attr(id, Attribute::Operator) {
                    Some(DatomValue::Ref(r)) => *r,
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "application missing yin/operator").with_entity(id)),
                };
                let operand_ids = match self.idx.attr(id, Attribute::Operands) {
                    Some(DatomValue::RefList(rs)) => rs.clone(),
                    None => Vec::new(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "application operands not a ref list").with_entity(id)),
                };
                self.cont = push(&self.cont, FrameKind::EvalOperator { operand_ids }, Rc::clone(&self.env));
                self.control = Control::Node(op_id);
            }
            "if" => {
                let test_id = self.ref_attr(id, Attribute::Test)?;
                let consequent = self.ref_attr(id, Attribute::Consequent)?;
                let alternate = self.ref_attr(id, Attribute::Alternate)?;
                self.cont = push(&self.cont, FrameKind::EvalTest { consequent, alternate }, Rc::clone(&self.env));
                self.control = Control::Node(test_id);
            }
            "vm/gensym" => {
                let prefix = match self.idx.attr(id, Attribute::Prefix) {
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.clone(),
                    _ => String::new(),
                };
                let sym = format!("{prefix}{}", self.gensym_counter);
                self.gensym_counter += 1;
                self.control = Control::Value(Value::Scalar(Scalar::Symbol(sym)));
            }
            "vm/store-get" => {
                let key = match self.idx.attr(id, Attribute::Key) {
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.clone(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "vm/store-get missing yin/key").with_entity(id)),
                };
                self.control = Control::Value(self.store.get(&key).cloned().unwrap_or(Value::Nil));
            }
            "vm/store-put" => {
                let key = match self.idx.attr(id, Attribute::Key) {
                    Some(DatomValue::Scalar(Scalar::String(s))) => s.clone(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "vm/store-put missing yin/key").with_entity(id)),
                };
                let val_id = self.ref_attr(id, Attribute::Val)?;
                self.cont = push(&self.cont, FrameKind::EvalStorePutVal { key }, Rc::clone(&self.env));
                self.control = Control::Node(val_id);
            }
            "stream/make" => {
                let buffer = match self.idx.attr(id, Attribute::Buffer) {
                    Some(DatomValue::Scalar(Scalar::Int(n))) => Some(*n as usize),
                    _ => None,
                };
                let sid = self.streams.make_default(buffer);
                self.control = Control::Value(Value::StreamRef(sid));
            }
            "stream/put" => {
                let target_id = self.ref_attr(id, Attribute::Target)?;
                let val_id = self.ref_attr(id, Attribute::Val)?;
                self.cont = push(&self.cont, FrameKind::EvalStreamPutTarget { val_id }, Rc::clone(&self.env));
                self.control = Control::Node(target_id);
            }
            "stream/cursor" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.cont = push(&self.cont, FrameKind::EvalStreamCursorSource, Rc::clone(&self.env));
                self.control = Control::Node(source_id);
            }
            "stream/next" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.cont = push(&self.cont, FrameKind::EvalStreamNextSource, Rc::clone(&self.env));
                self.control = Control::Node(source_id);
            }
            "stream/close" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.cont = push(&self.cont, FrameKind::EvalStreamCloseSource, Rc::clone(&self.env));
                self.control = Control::Node(source_id);
            }
            other => return Err(VmError::new(VmErrorKind::UnknownNode, format!("unknown node type {other}")).with_entity(id)),
        }
        Ok(())
    }

    fn ref_attr(&self, id: EntityId, a: Attribute) -> Result<EntityId, VmError> {
        match self.idx.attr(id, a) {
            Some(DatomValue::Ref(r)) => Ok(*r),
            _ => Err(VmError::new(VmErrorKind::MalformedProgram, format!("missing {a}")).with_entity(id)),
        }
    }

    fn step_value(&mut self, v: Value) -> Result<(), VmError> {
        let Some(frame) = self.cont.clone() else {
            self.control = Control::Value(v);
            self.status = Status::Halted;
            return Ok(());
        };
        self.cont = frame.next.clone();
        let env = Rc::clone(&frame.env);

        match &frame.kind {
            FrameKind::EvalOperator { operand_ids } => {
                if operand_ids.is_empty() {
                    self.apply(v, Vec::new(), env)?;
                } else {
                    let next_id = operand_ids[0];
                    self.cont = push(
                        &self.cont,
                        FrameKind::EvalOperand { op_value: v, operand_ids: operand_ids.clone(), evaluated: Vec::new() },
                        Rc::clone(&env),
                    );
                    self.control = Control::Node(next_id);
                }
            }
            FrameKind::EvalOperand { op_value, operand_ids, evaluated } => {
                let mut evaluated = evaluated.clone();
                evaluated.push(v);
                if evaluated.len() == operand_ids.len() {
                    self.apply(op_value.clone(), evaluated, env)?;
                } else {
                    let next_id = operand_ids[evaluated.len()];
                    self.cont = push(
                        &self.cont,
                        FrameKind::EvalOperand { op_value: op_value.clone(), operand_ids: operand_ids.clone(), evaluated },
                        Rc::clone(&env),
                    );
                    self.control = Control::Node(next_id);
                }
            }
            FrameKind::EvalTest { consequent, alternate } => {
                self.env = env;
                self.control = Control::Node(if v.is_truthy() { *consequent } else { *alternate });
            }
            FrameKind::EvalStorePutVal { key } => {
                self.store.put(key.clone(), v.clone());
                self.env = env;
                self.control = Control::Value(v);
            }
            FrameKind::EvalStreamPutTarget { val_id } => {
                let Value::StreamRef(sid) = v else {
                    return Err(self.type_error("stream/put target", &v));
                };
                self.cont = push(&self.cont, FrameKind::EvalStreamPutVal { target: sid }, Rc::clone(&env));
                self.env = env;
                self.control = Control::Node(*val_id);
            }
            FrameKind::EvalStreamPutVal { target } => {
                self.try_put(*target, v, env)?;
            }
            FrameKind::RetryStreamPut { stream, value } => {
                self.try_put(*stream, value.clone(), env)?;
            }
            FrameKind::EvalStreamCursorSource => {
                let Value::StreamRef(sid) = v else {
                    return Err(self.type_error("stream/cursor source", &v));
                };
                self.env = env;
                self.control = Control::Value(Value::CursorRef(self.streams.cursor(sid)));
            }
            FrameKind::EvalStreamNextSource => {
                let Value::CursorRef(cursor) = v else {
                    return Err(self.type_error("stream/next source", &v));
                };
                self.env = env;
                match self.streams.next(cursor) {
                    NextResult::Ok(val, _advanced) => self.control = Control::Value(val),
                    NextResult::Blocked => {
                        self.scheduler.park(self.cont.clone(), yin_runtime::ParkReason::Next { cursor });
                        self.status = Status::Blocked;
                    }
                    NextResult::End | NextResult::Gap => self.control = Control::Value(Value::Nil),
                }
            }
            FrameKind::EvalStreamCloseSource => {
                let Value::StreamRef(sid) = v else {
                    return Err(self.type_error("stream/close source", &v));
                };
                self.streams.close(sid);
                self.scheduler.close_propagate(sid);
                self.env = env;
                self.control = Control::Value(Value::StreamRef(sid));
            }
        }
        Ok(())
    }

    fn try_put(&mut self, sid: yin_core::StreamId, value: Value, env: Rc<Env>) -> Result<(), VmError> {
        match self.streams.put(sid, value.clone()) {
            PutResult::Ok => {
                self.env = env;
                self.control = Control::Value(value);
            }
            PutResult::Full => {
                let parked = push(&self.cont, FrameKind::RetryStreamPut { stream: sid, value: value.clone() }, env);
                self.scheduler.park(parked, yin_runtime::ParkReason::Put { stream: sid, pending_value: value });
                self.status = Status::Blocked;
            }
            PutResult::Closed => return Err(VmError::new(VmErrorKind::PutOnClosedStream, "put on closed stream")),
        }
        Ok(())
    }

    fn apply(&mut self, f: Value, args: Vec<Value>, resume_env: Rc<Env>) -> Result<(), VmError> {
        match f {
            Value::Closure(c) => {
                let mut bindings = HashMap::new();
                for (p, a) in c.params.iter().zip(args) {
                    bindings.insert(p.clone(), a);
                }
                self.env = Env::extend(&c.env, bindings);
                match c.body {
                    Body::Node(id) => self.control = Control::Node(id),
                    _ => return Err(VmError::new(VmErrorKind::ApplyNonFunction, "tree-walking VM cannot apply a bytecode closure")),
                }
            }
            Value::Primitive(name) => {
                let outcome = self.registry.call(&name, &args)?;
                match outcome {
                    PrimitiveOutcome::Value(v) => {
                        self.env = resume_env;
                        self.control = Control::Value(v);
                    }
                    PrimitiveOutcome::Effect(eff) => self.apply_effect(eff, resume_env)?,
                }
            }
            other => return Err(self.type_error("apply", &other)),
        }
        Ok(())
    }

    fn apply_effect(&mut self, eff: Effect, resume_env: Rc<Env>) -> Result<(), VmError> {
        match eff {
            Effect::StorePut { key, val } => {
                let key = value_key(&key)?;
                self.store.put(key, val.clone());
                self.env = resume_env;
                self.control = Control::Value(val);
            }
            Effect::StreamMake { capacity } => {
                let sid = self.streams.make_default(capacity);
                self.env = resume_env;
                self.control = Control::Value(Value::StreamRef(sid));
            }
            Effect::StreamPut { target, val } => self.try_put(target, val, resume_env)?,
            Effect::StreamCursor { source } => {
                self.env = resume_env;
                self.control = Control::Value(Value::CursorRef(self.streams.cursor(source)));
            }
            Effect::StreamNext { source } => {
                self.env = resume_env;
                match self.streams.next(source) {
                    NextResult::Ok(val, _) => self.control = Control::Value(val),
                    NextResult::Blocked => {
                        self.scheduler.park(self.cont.clone(), yin_runtime::ParkReason::Next { cursor: source });
                        self.status = Status::Blocked;
                    }
                    NextResult::End | NextResult::Gap => self.control = Control::Value(Value::Nil),
                }
            }
            Effect::StreamClose { target } => {
                self.streams.close(target);
                self.scheduler.close_propagate(target);
                self.env = resume_env;
                self.control = Control::Value(Value::StreamRef(target));
            }
        }
        Ok(())
    }
}

impl CeskVm for TreeWalkVm {
    type Program = yin_core::AstNode;

    fn load_program(&mut self, program: Self::Program) -> Result<(), VmError> {
        let projection = project(&program, 0);
        self.idx = DatomIndex::build(&projection.datoms);
        self.control = Control::Node(projection.root);
        self.env = Env::empty();
        self.cont = None;
        self.status = Status::Running;
        self.steps = 0;
        Ok(())
    }

    fn step(&mut self) -> Result<(), VmError> {
        if self.status != Status::Running {
            return Ok(());
        }
        self.steps += 1;
        match std::mem::replace(&mut self.control, Control::Value(Value::Nil)) {
            Control::Node(id) => self.step_node(id),
            Control::Value(v) => self.step_value(v),
        }
    }

    fn eval(&mut self) -> Result<(), VmError> {
        loop {
            match self.status {
                Status::Halted => return Ok(()),
                Status::Blocked => {
                    self.scheduler.wake_check(&self.streams);
                    match self.scheduler.pop_runnable() {
                        Some(run) => {
                            self.cont = run.continuation;
                            self.control = Control::Value(run.resume_value.unwrap_or(Value::Nil));
                            self.status = Status::Running;
                        }
                        None => return Ok(()),
                    }
                }
                Status::Running => self.step()?,
            }
        }
    }

    fn status(&self) -> Status {
        self.status
    }

    fn value(&self) -> Option<Value> {
        match (&self.control, self.status) {
            (Control::Value(v), Status::Halted) => Some(v.clone()),
            _ => None,
        }
    }

    fn environment(&self) -> Rc<Env> {
        Rc::clone(&self.env)
    }

    fn store(&self) -> &Store {
        &self.store
    }

    fn control_repr(&self) -> String {
        match &self.control {
            Control::Node(id) => format!("node({id})"),
            Control::Value(v) => format!("value({v:?})"),
        }
    }

    fn continuation_repr(&self) -> String {
        let mut depth = 0;
        let mut cur = &self.cont;
        while let Some(frame) = cur {
            depth += 1;
            cur = &frame.next;
        }
        format!("{depth} frame(s)")
    }

    fn step_count(&self) -> u64 {
        self.steps
    }
}

/// A single frame of an exported parked continuation (§4.10 "export
/// continuation"), mirroring [`FrameKind`] with every AST-entity
/// reference replaced by its content hash so the frame means the same
/// thing on any VM instance, regardless of that instance's entity-id
/// gauge.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExportedFrameKind {
    EvalOperator { operand_hashes: Vec<String> },
    EvalOperand { op_value: ExportedValue, operand_hashes: Vec<String>, evaluated: Vec<ExportedValue> },
    EvalTest { consequent_hash: String, alternate_hash: String },
    EvalStorePutVal { key: String },
    EvalStreamPutTarget { val_hash: String },
    EvalStreamPutVal { target: u64 },
    RetryStreamPut { stream: u64, value: ExportedValue },
    EvalStreamCursorSource,
    EvalStreamNextSource,
    EvalStreamCloseSource,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportedFrame {
    pub kind: ExportedFrameKind,
    pub env: std::collections::BTreeMap<String, ExportedValue>,
}

/// Why the exported continuation was parked, carried alongside the frame
/// stack so import can re-park it under the same [`ParkReason`] locally
/// (§4.9). Stream/cursor handles are not AST entities and have no content
/// hash — resuming an imported continuation requires the importing VM to
/// already have an equivalent stream wired under the same id, per §5
/// ("streams may be shared between VMs only through deliberate wiring").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum ExportedParkReason {
    Next { stream: u64, position: usize },
    Put { stream: u64, pending_value: ExportedValue },
}

/// A self-contained, content-addressed export of one parked continuation
/// (§4.10, §6's "continuation bundle" shape; §8 law 5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportedContinuation {
    pub reason: ExportedParkReason,
    pub frames: Vec<ExportedFrame>,
}

fn export_frame_kind(
    kind: &FrameKind,
    hash_of: &impl Fn(EntityId) -> Option<String>,
) -> Result<ExportedFrameKind, VmError> {
    let hash = |id: EntityId| -> Result<String, VmError> {
        hash_of(id).ok_or_else(|| {
            VmError::new(VmErrorKind::UnknownClosureBodyHash, "no content hash for a frame's entity reference").with_entity(id)
        })
    };
    Ok(match kind {
        FrameKind::EvalOperator { operand_ids } => {
            let operand_hashes = operand_ids.iter().map(|id| hash(*id)).collect::<Result<_, _>>()?;
            ExportedFrameKind::EvalOperator { operand_hashes }
        }
        FrameKind::EvalOperand { op_value, operand_ids, evaluated } => ExportedFrameKind::EvalOperand {
            op_value: export_value(op_value, hash_of)?,
            operand_hashes: operand_ids.iter().map(|id| hash(*id)).collect::<Result<_, _>>()?,
            evaluated: evaluated.iter().map(|v| export_value(v, hash_of)).collect::<Result<_, _>>()?,
        },
        FrameKind::EvalTest { consequent, alternate } => {
            ExportedFrameKind::EvalTest { consequent_hash: hash(*consequent)?, alternate_hash: hash(*alternate)? }
        }
        FrameKind::EvalStorePutVal { key } => ExportedFrameKind::EvalStorePutVal { key: key.clone() },
        FrameKind::EvalStreamPutTarget { val_id } => {
            ExportedFrameKind::EvalStreamPutTarget { val_hash: hash(*val_id)? }
        }
        FrameKind::EvalStreamPutVal { target } => ExportedFrameKind::EvalStreamPutVal { target: target.0 },
        FrameKind::RetryStreamPut { stream, value } => {
            ExportedFrameKind::RetryStreamPut { stream: stream.0, value: export_value(value, hash_of)? }
        }
        FrameKind::EvalStreamCursorSource => ExportedFrameKind::EvalStreamCursorSource,
        FrameKind::EvalStreamNextSource => ExportedFrameKind::EvalStreamNextSource,
        FrameKind::EvalStreamCloseSource => ExportedFrameKind::EvalStreamCloseSource,
    })
}

fn import_frame_kind(
    kind: &ExportedFrameKind,
    body_of: &impl Fn(&str) -> Option<EntityId>,
) -> Result<FrameKind, VmError> {
    let resolve = |h: &str| -> Result<EntityId, VmError> {
        body_of(h).ok_or_else(|| {
            VmError::new(VmErrorKind::UnknownClosureBodyHash, format!("no imported entity for hash {h}"))
        })
    };
    Ok(match kind {
        ExportedFrameKind::EvalOperator { operand_hashes } => {
            FrameKind::EvalOperator { operand_ids: operand_hashes.iter().map(|h| resolve(h)).collect::<Result<_, _>>()? }
        }
        ExportedFrameKind::EvalOperand { op_value, operand_hashes, evaluated } => FrameKind::EvalOperand {
            op_value: import_value(op_value, body_of)?,
            operand_ids: operand_hashes.iter().map(|h| resolve(h)).collect::<Result<_, _>>()?,
            evaluated: evaluated.iter().map(|v| import_value(v, body_of)).collect::<Result<_, _>>()?,
        },
        ExportedFrameKind::EvalTest { consequent_hash, alternate_hash } => {
            FrameKind::EvalTest { consequent: resolve(consequent_hash)?, alternate: resolve(alternate_hash)? }
        }
        ExportedFrameKind::EvalStorePutVal { key } => FrameKind::EvalStorePutVal { key: key.clone() },
        ExportedFrameKind::EvalStreamPutTarget { val_hash } => {
            FrameKind::EvalStreamPutTarget { val_id: resolve(val_hash)? }
        }
        ExportedFrameKind::EvalStreamPutVal { target } => {
            FrameKind::EvalStreamPutVal { target: yin_core::StreamId(*target) }
        }
        ExportedFrameKind::RetryStreamPut { stream, value } => FrameKind::RetryStreamPut {
            stream: yin_core::StreamId(*stream),
            value: import_value(value, body_of)?,
        },
        ExportedFrameKind::EvalStreamCursorSource => FrameKind::EvalStreamCursorSource,
        ExportedFrameKind::EvalStreamNextSource => FrameKind::EvalStreamNextSource,
        ExportedFrameKind::EvalStreamCloseSource => FrameKind::EvalStreamCloseSource,
    })
}

impl TreeWalkVm {
    /// Export the wait-set entry at `index` (see
    /// [`Scheduler::wait_set_entries`]) as a self-contained bundle, using
    /// this VM's own loaded program to resolve each frame's entity-id
    /// references to content hashes (§4.10).
    pub fn export_parked_continuation(&self, index: usize) -> Result<ExportedContinuation, VmError> {
        let entry = self
            .scheduler
            .wait_set_entries()
            .get(index)
            .ok_or_else(|| VmError::new(VmErrorKind::MalformedProgram, "no such parked continuation"))?;
        let hashes = content_hashes(&self.idx, &Sha256Hasher)?;
        let hash_of = |id: EntityId| hashes.get(&id).cloned();

        let mut frames = Vec::new();
        let mut cur = &entry.continuation;
        while let Some(frame) = cur {
            frames.push(ExportedFrame {
                kind: export_frame_kind(&frame.kind, &hash_of)?,
                env: export_env(&frame.env, &hash_of)?,
            });
            cur = &frame.next;
        }

        let reason = match &entry.reason {
            ParkReason::Next { cursor } => ExportedParkReason::Next { stream: cursor.stream.0, position: cursor.position },
            ParkReason::Put { stream, pending_value } => {
                ExportedParkReason::Put { stream: stream.0, pending_value: export_value(pending_value, &hash_of)? }
            }
        };
        Ok(ExportedContinuation { reason, frames })
    }

    /// Remove and export the wait-set entry at `index`, leaving it out of
    /// this VM's own wait-set (it is assumed to continue life only in the
    /// returned bundle, or a re-park of it, from here on).
    pub fn take_parked_continuation(&mut self, index: usize) -> Result<ExportedContinuation, VmError> {
        let exported = self.export_parked_continuation(index)?;
        self.scheduler.take_parked(index);
        Ok(exported)
    }

    /// Import a previously-exported parked continuation, resolving each
    /// frame's content-hash references against `hash_to_eid` (typically
    /// the map [`yin_runtime::import_ast`] returned when the
    /// corresponding AST bundle was imported into this VM's own datom
    /// set) and re-parking it in this VM's wait-set so it can be resumed
    /// by the ordinary `eval`/wake-check loop once its stream condition
    /// is satisfied locally (§4.10, §8 law 5).
    pub fn import_parked_continuation(
        &mut self,
        bundle: &ExportedContinuation,
        hash_to_eid: &std::collections::HashMap<String, EntityId>,
    ) -> Result<(), VmError> {
        let body_of = |h: &str| hash_to_eid.get(h).copied();

        let mut link: Link = None;
        for frame in bundle.frames.iter().rev() {
            let kind = import_frame_kind(&frame.kind, &body_of)?;
            let env = import_env(&frame.env, &body_of)?;
            link = push(&link, kind, env);
        }

        let reason = match &bundle.reason {
            ExportedParkReason::Next { stream, position } => ParkReason::Next {
                cursor: yin_core::CursorRef::new(yin_core::StreamId(*stream)).seek(*position),
            },
            ExportedParkReason::Put { stream, pending_value } => ParkReason::Put {
                stream: yin_core::StreamId(*stream),
                pending_value: import_value(pending_value, &body_of)?,
            },
        };
        self.scheduler.park(link, reason);
        Ok(())
    }

    /// Drive the scheduler loop from a wait-set that was populated only
    /// by [`import_parked_continuation`](Self::import_parked_continuation) —
    /// i.e. this VM never itself produced the `Blocked` status, so there
    /// is no in-flight `self.control`/`self.cont` to resume from first.
    /// Equivalent to what `eval` does once an ordinary park leaves the VM
    /// `Blocked`, minus the step that produced the park.
    pub fn resume_imported_continuations(&mut self) -> Result<(), VmError> {
        self.status = Status::Blocked;
        self.eval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yin_core::AstNode;

    fn vm() -> TreeWalkVm {
        TreeWalkVm::new(ModuleRegistry::with_core_primitives())
    }

    fn run(ast: AstNode) -> TreeWalkVm {
        let mut m = vm();
        m.load_program(ast).unwrap();
        m.eval().unwrap();
        m
    }

    #[test]
    fn evaluates_a_literal() {
        let m = run(AstNode::Literal { value: Scalar::Int(42) });
        assert!(m.halted());
        assert_eq!(m.value(), Some(Value::int(42)));
    }

    #[test]
    fn applies_a_primitive() {
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Variable { name: "+".into() }),
            operands: vec![
                AstNode::Literal { value: Scalar::Int(10) },
                AstNode::Literal { value: Scalar::Int(20) },
            ],
        };
        let m = run(ast);
        assert_eq!(m.value(), Some(Value::int(30)));
    }

    #[test]
    fn applies_a_two_argument_closure() {
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Lambda {
                params: vec!["x".into(), "y".into()],
                body: Box::new(AstNode::Application {
                    operator: Box::new(AstNode::Variable { name: "+".into() }),
                    operands: vec![
                        AstNode::Variable { name: "x".into() },
                        AstNode::Variable { name: "y".into() },
                    ],
                }),
            }),
            operands: vec![
                AstNode::Literal { value: Scalar::Int(3) },
                AstNode::Literal { value: Scalar::Int(5) },
            ],
        };
        let m = run(ast);
        assert_eq!(m.value(), Some(Value::int(8)));
    }

    #[test]
    fn single_argument_closure_reports_a_step_count() {
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Lambda {
                params: vec!["x".into()],
                body: Box::new(AstNode::Application {
                    operator: Box::new(AstNode::Variable { name: "+".into() }),
                    operands: vec![
                        AstNode::Variable { name: "x".into() },
                        AstNode::Literal { value: Scalar::Int(1) },
                    ],
                }),
            }),
            operands: vec![AstNode::Literal { value: Scalar::Int(5) }],
        };
        let m = run(ast);
        assert_eq!(m.value(), Some(Value::int(6)));
        assert!(m.step_count() > 0);
    }

    #[test]
    fn let_binding_via_nested_lambda_application() {
        // `(let [x false] x)`, encoded as `((λ (x) x) false)` — there is no
        // sequencing node in the AST, so a binding form is just an
        // immediately-applied lambda.
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Lambda {
                params: vec!["x".into()],
                body: Box::new(AstNode::Variable { name: "x".into() }),
            }),
            operands: vec![AstNode::Literal { value: Scalar::Bool(false) }],
        };
        let m = run(ast);
        assert_eq!(m.value(), Some(Value::bool(false)));
    }

    #[test]
    fn producer_blocked_on_full_stream_resumes_after_external_drain() {
        // `((λ (s) ((λ (_) (stream/put s 2)) (stream/put s 1))) (stream/make 1))`
        // — a capacity-1 stream fills on the first put, so the second put
        // parks; draining it externally (simulating a concurrent reader)
        // and re-running `eval` lets the computation finish.
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Lambda {
                params: vec!["s".into()],
                body: Box::new(AstNode::Application {
                    operator: Box::new(AstNode::Lambda {
                        params: vec!["_".into()],
                        body: Box::new(AstNode::StreamPut {
                            target: Box::new(AstNode::Variable { name: "s".into() }),
                            val: Box::new(AstNode::Literal { value: Scalar::Int(2) }),
                        }),
                    }),
                    operands: vec![AstNode::StreamPut {
                        target: Box::new(AstNode::Variable { name: "s".into() }),
                        val: Box::new(AstNode::Literal { value: Scalar::Int(1) }),
                    }],
                }),
            }),
            operands: vec![AstNode::StreamMake { buffer: Some(1) }],
        };

        let mut m = vm();
        m.load_program(ast).unwrap();
        m.eval().unwrap();
        assert!(m.blocked(), "second put should park once the stream is full");

        let sid = yin_core::StreamId(1);
        assert_eq!(m.streams().length(sid), 1);

        // A reader draining the queued value frees capacity even though
        // the append-only storage never evicts anything: the stream
        // tracks how far a cursor has read and measures capacity against
        // the unread backlog, not total length (§4.9, §8 scenario 8).
        let c = m.streams_mut().cursor(sid);
        let _ = m.streams_mut().next(c);
        m.wake_check();
        m.eval().unwrap();
        assert!(m.halted(), "draining the backlog should free capacity for the parked put");
        assert_eq!(m.value(), Some(Value::int(2)));
    }
}
