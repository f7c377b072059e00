//! The datom-graph VM (§4.5): the same evaluation strategy as the
//! tree-walker, but the continuation is an explicit `Vec`-backed stack of
//! frames rather than a linked list — the distinction the register/stack
//! backends push further into an actual bytecode program counter.
//!
//! Frame kinds mirror the tree-walker's (`app-op`, `app-args`, `if`,
//! `restore-env`, the stream frames) one-for-one; only the continuation's
//! representation differs.

use std::collections::HashMap;
use std::rc::Rc;

use yin_core::{
    Attribute, Body, Closure, DatomValue, Effect, Env, EntityId, PrimitiveOutcome, Scalar, Value,
    VmError, VmErrorKind,
};
use yin_runtime::{project, DatomIndex, ModuleRegistry, NextResult, PutResult, Scheduler, Store, StreamStore};

use crate::cesk::{CeskVm, Status};
use crate::support::value_key;

#[derive(Debug, Clone)]
enum Control {
    Node(EntityId),
    Value(Value),
}

#[derive(Debug, Clone)]
enum FrameKind {
    AppOp { operand_ids: Vec<EntityId> },
    AppArgs { op_value: Value, operand_ids: Vec<EntityId>, evaluated: Vec<Value> },
    If { consequent: EntityId, alternate: EntityId },
    StorePutVal { key: String },
    StreamPutTarget { val_id: EntityId },
    StreamPutVal { target: yin_core::StreamId },
    RetryStreamPut { stream: yin_core::StreamId, value: Value },
    StreamCursorSource,
    StreamNextSource,
    StreamCloseSource,
}

#[derive(Debug, Clone)]
struct Frame {
    kind: FrameKind,
    env: Rc<Env>,
}

/// The explicit continuation: an ordinary `Vec` used as a stack (push/pop
/// at the back), rather than the tree-walker's `Rc`-linked chain.
type Stack = Vec<Frame>;

pub struct DatomGraphVm {
    idx: DatomIndex,
    control: Control,
    env: Rc<Env>,
    store: Store,
    stack: Stack,
    registry: ModuleRegistry,
    streams: StreamStore,
    scheduler: Scheduler<Stack>,
    gensym_counter: u64,
    status: Status,
    steps: u64,
}

impl DatomGraphVm {
    pub fn new(registry: ModuleRegistry) -> Self {
        DatomGraphVm {
            idx: DatomIndex::build(&[]),
            control: Control::Value(Value::Nil),
            env: Env::empty(),
            store: Store::new(),
            stack: Vec::new(),
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

    pub fn wake_check(&mut self) {
        self.scheduler.wake_check(&self.streams);
    }

    fn type_error(&self, what: &str, v: &Value) -> VmError {
        VmError::new(VmErrorKind::ApplyNonFunction, format!("{what}: unexpected {}", v.type_tag()))
    }

    fn ref_attr(&self, id: EntityId, a: Attribute) -> Result<EntityId, VmError> {
        match self.idx.attr(id, a) {
            Some(DatomValue::Ref(r)) => Ok(*r),
            _ => Err(VmError::new(VmErrorKind::MalformedProgram, format!("missing {a}")).with_entity(id)),
        }
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
                let body_id = self.ref_attr(id, Attribute::Body)?;
                let closure = Closure { params, body: Body::Node(body_id), env: Rc::clone(&self.env) };
                self.control = Control::Value(Value::Closure(Rc::new(closure)));
            }
            "application" => {
                let op_id = self.ref_attr(id, Attribute::Operator)?;
                let operand_ids = match self.idx.attr(id, Attribute::Operands) {
                    Some(DatomValue::RefList(rs)) => rs.clone(),
                    None => Vec::new(),
                    _ => return Err(VmError::new(VmErrorKind::MalformedProgram, "application operands not a ref list").with_entity(id)),
                };
                self.stack.push(Frame { kind: FrameKind::AppOp { operand_ids }, env: Rc::clone(&self.env) });
                self.control = Control::Node(op_id);
            }
            "if" => {
                let test_id = self.ref_attr(id, Attribute::Test)?;
                let consequent = self.ref_attr(id, Attribute::Consequent)?;
                let alternate = self.ref_attr(id, Attribute::Alternate)?;
                self.stack.push(Frame { kind: FrameKind::If { consequent, alternate }, env: Rc::clone(&self.env) });
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
                self.stack.push(Frame { kind: FrameKind::StorePutVal { key }, env: Rc::clone(&self.env) });
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
                self.stack.push(Frame { kind: FrameKind::StreamPutTarget { val_id }, env: Rc::clone(&self.env) });
                self.control = Control::Node(target_id);
            }
            "stream/cursor" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.stack.push(Frame { kind: FrameKind::StreamCursorSource, env: Rc::clone(&self.env) });
                self.control = Control::Node(source_id);
            }
            "stream/next" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.stack.push(Frame { kind: FrameKind::StreamNextSource, env: Rc::clone(&self.env) });
                self.control = Control::Node(source_id);
            }
            "stream/close" => {
                let source_id = self.ref_attr(id, Attribute::Source)?;
                self.stack.push(Frame { kind: FrameKind::StreamCloseSource, env: Rc::clone(&self.env) });
                self.control = Control::Node(source_id);
            }
            other => return Err(VmError::new(VmErrorKind::UnknownNode, format!("unknown node type {other}")).with_entity(id)),
        }
        Ok(())
    }

    fn step_value(&mut self, v: Value) -> Result<(), VmError> {
        let Some(frame) = self.stack.pop() else {
            self.control = Control::Value(v);
            self.status = Status::Halted;
            return Ok(());
        };
        let env = frame.env;

        match frame.kind {
            FrameKind::AppOp { operand_ids } => {
                if operand_ids.is_empty() {
                    self.apply(v, Vec::new(), env)?;
                } else {
                    let next_id = operand_ids[0];
                    self.stack.push(Frame {
                        kind: FrameKind::AppArgs { op_value: v, operand_ids, evaluated: Vec::new() },
                        env: Rc::clone(&env),
                    });
                    self.control = Control::Node(next_id);
                }
            }
            FrameKind::AppArgs { op_value, operand_ids, mut evaluated } => {
                evaluated.push(v);
                if evaluated.len() == operand_ids.len() {
                    self.apply(op_value, evaluated, env)?;
                } else {
                    let next_id = operand_ids[evaluated.len()];
                    self.stack.push(Frame {
                        kind: FrameKind::AppArgs { op_value, operand_ids, evaluated },
                        env: Rc::clone(&env),
                    });
                    self.control = Control::Node(next_id);
                }
            }
            FrameKind::If { consequent, alternate } => {
                self.env = env;
                self.control = Control::Node(if v.is_truthy() { consequent } else { alternate });
            }
            FrameKind::StorePutVal { key } => {
                self.store.put(key, v.clone());
                self.env = env;
                self.control = Control::Value(v);
            }
            FrameKind::StreamPutTarget { val_id } => {
                let Value::StreamRef(sid) = v else {
                    return Err(self.type_error("stream/put target", &v));
                };
                self.stack.push(Frame { kind: FrameKind::StreamPutVal { target: sid }, env: Rc::clone(&env) });
                self.env = env;
                self.control = Control::Node(val_id);
            }
            FrameKind::StreamPutVal { target } => {
                self.try_put(target, v, env)?;
            }
            FrameKind::RetryStreamPut { stream, value } => {
                self.try_put(stream, value, env)?;
            }
            FrameKind::StreamCursorSource => {
                let Value::StreamRef(sid) = v else {
                    return Err(self.type_error("stream/cursor source", &v));
                };
                self.env = env;
                self.control = Control::Value(Value::CursorRef(self.streams.cursor(sid)));
            }
            FrameKind::StreamNextSource => {
                let Value::CursorRef(cursor) = v else {
                    return Err(self.type_error("stream/next source", &v));
                };
                self.env = env;
                match self.streams.next(cursor) {
                    NextResult::Ok(val, _advanced) => self.control = Control::Value(val),
                    NextResult::Blocked => {
                        self.scheduler.park(std::mem::take(&mut self.stack), yin_runtime::ParkReason::Next { cursor });
                        self.status = Status::Blocked;
                    }
                    NextResult::End | NextResult::Gap => self.control = Control::Value(Value::Nil),
                }
            }
            FrameKind::StreamCloseSource => {
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
                let mut parked = std::mem::take(&mut self.stack);
                parked.push(Frame { kind: FrameKind::RetryStreamPut { stream: sid, value: value.clone() }, env });
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
                    _ => return Err(VmError::new(VmErrorKind::ApplyNonFunction, "datom-graph VM cannot apply a bytecode closure")),
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
                        self.scheduler.park(std::mem::take(&mut self.stack), yin_runtime::ParkReason::Next { cursor: source });
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

impl CeskVm for DatomGraphVm {
    type Program = (Vec<yin_core::Datom>, EntityId);

    fn load_program(&mut self, program: Self::Program) -> Result<(), VmError> {
        let (datoms, root) = program;
        self.idx = DatomIndex::build(&datoms);
        self.control = Control::Node(root);
        self.env = Env::empty();
        self.stack = Vec::new();
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
                            self.stack = run.continuation;
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
        format!("{} frame(s)", self.stack.len())
    }

    fn step_count(&self) -> u64 {
        self.steps
    }
}

impl DatomGraphVm {
    /// Convenience entry point for callers that already have an AST rather
    /// than a pre-projected datom set.
    pub fn load_ast(&mut self, ast: &yin_core::AstNode) -> Result<(), VmError> {
        let projection = project(ast, 0);
        self.load_program((projection.datoms, projection.root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yin_core::AstNode;

    fn vm() -> DatomGraphVm {
        DatomGraphVm::new(ModuleRegistry::with_core_primitives())
    }

    fn run(ast: AstNode) -> DatomGraphVm {
        let mut m = vm();
        m.load_ast(&ast).unwrap();
        m.eval().unwrap();
        m
    }

    #[test]
    fn evaluates_a_literal() {
        let m = run(AstNode::Literal { value: Scalar::Int(42) });
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
        assert_eq!(run(ast).value(), Some(Value::int(30)));
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
        assert_eq!(run(ast).value(), Some(Value::int(8)));
    }

    #[test]
    fn if_selects_consequent_or_alternate() {
        let mk = |test| AstNode::If {
            test: Box::new(test),
            consequent: Box::new(AstNode::Literal { value: Scalar::Int(1) }),
            alternate: Box::new(AstNode::Literal { value: Scalar::Int(0) }),
        };
        assert_eq!(run(mk(AstNode::Literal { value: Scalar::Bool(true) })).value(), Some(Value::int(1)));
        assert_eq!(run(mk(AstNode::Literal { value: Scalar::Bool(false) })).value(), Some(Value::int(0)));
    }

    #[test]
    fn producer_blocked_on_full_stream_stays_blocked_without_eviction() {
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
        let m = run(ast);
        assert!(m.blocked());
        assert_eq!(m.continuation_repr(), "1 frame(s)");
    }
}
