//! The stack interpreter (§4.7): an operand stack, an explicit call-frame
//! stack standing in for the host call stack, and a program counter.
//! `apply` pops `argc` values plus the function, then either calls a
//! primitive directly or pushes a frame and jumps to the closure body.
//!
//! Popping the argument values uses a constant-time subrange
//! (`split_off`) rather than repeated `pop`-and-reverse or a lazy
//! sequence, per §9's "stack-VM hot-path" note.

use std::collections::HashMap;
use std::rc::Rc;

use yin_core::{Body, Closure, Env, PrimitiveOutcome, Scalar, StreamId, Value, VmError, VmErrorKind};
use yin_runtime::{ModuleRegistry, NextResult, PutResult, Scheduler, Store, StreamStore};

use super::bytecode::*;
use crate::cesk::{CeskVm, Status};
use crate::support::value_key;

#[derive(Debug, Clone)]
struct CallFrame {
    env: Rc<Env>,
    return_ip: usize,
}

#[derive(Debug, Clone)]
enum ParkKind {
    Next { source: yin_core::CursorRef },
    Put { target: StreamId, value: Value },
}

/// Captured machine state at the moment of parking: the call-frame stack,
/// the operand stack as it stood with the parking op's operands already
/// consumed (so resume only needs to push the missing result), the
/// current env, the resume ip, and why we parked.
#[derive(Debug, Clone)]
struct Snapshot {
    call_stack: Vec<CallFrame>,
    operand_stack: Vec<Value>,
    env: Rc<Env>,
    ip: usize,
    kind: ParkKind,
}

pub struct StackVm {
    bc: Bytecode,
    ip: usize,
    operand_stack: Vec<Value>,
    env: Rc<Env>,
    call_stack: Vec<CallFrame>,
    store: Store,
    registry: ModuleRegistry,
    streams: StreamStore,
    scheduler: Scheduler<Snapshot>,
    gensym_counter: u64,
    status: Status,
    steps: u64,
    halted_value: Option<Value>,
}

impl StackVm {
    pub fn new(registry: ModuleRegistry) -> Self {
        StackVm {
            bc: Bytecode::default(),
            ip: 0,
            operand_stack: Vec::new(),
            env: Env::empty(),
            call_stack: Vec::new(),
            store: Store::new(),
            registry,
            streams: StreamStore::new(),
            scheduler: Scheduler::new(),
            gensym_counter: 0,
            status: Status::Halted,
            steps: 0,
            halted_value: None,
        }
    }

    pub fn streams(&self) -> &StreamStore {
        &self.streams
    }

    pub fn wake_check(&mut self) {
        self.scheduler.wake_check(&self.streams);
    }

    fn word(&self, at: usize) -> i64 {
        self.bc.code[at]
    }

    fn push(&mut self, v: Value) {
        self.operand_stack.push(v);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.operand_stack
            .pop()
            .ok_or_else(|| VmError::new(VmErrorKind::MalformedProgram, "operand stack underflow").with_ip(self.ip))
    }

    /// Pop the top `argc` values off the operand stack, in the order they
    /// were pushed (arg0 first) — a single constant-time subrange split
    /// rather than `argc` individual pops plus a reverse.
    fn pop_args(&mut self, argc: usize) -> Vec<Value> {
        let at = self.operand_stack.len() - argc;
        self.operand_stack.split_off(at)
    }

    fn apply(&mut self, f: Value, args: Vec<Value>, after_ip: usize) -> Result<(), VmError> {
        match f {
            Value::Closure(c) => {
                let Body::StackAddress { ip: body_ip } = c.body else {
                    return Err(VmError::new(VmErrorKind::ApplyNonFunction, "stack VM cannot apply a non-stack closure").with_ip(self.ip));
                };
                let mut bindings = HashMap::new();
                for (p, a) in c.params.iter().zip(args) {
                    bindings.insert(p.clone(), a);
                }
                let callee_env = Env::extend(&c.env, bindings);
                self.call_stack.push(CallFrame { env: std::mem::replace(&mut self.env, callee_env), return_ip: after_ip });
                self.ip = body_ip;
            }
            Value::Primitive(name) => {
                let outcome = self.registry.call(&name, &args)?;
                self.ip = after_ip;
                match outcome {
                    PrimitiveOutcome::Value(v) => self.push(v),
                    PrimitiveOutcome::Effect(eff) => self.apply_effect(eff, after_ip)?,
                }
            }
            other => {
                return Err(VmError::new(
                    VmErrorKind::ApplyNonFunction,
                    format!("call target is not a function: {}", other.type_tag()),
                )
                .with_ip(self.ip))
            }
        }
        Ok(())
    }

    fn apply_effect(&mut self, eff: yin_core::Effect, after_ip: usize) -> Result<(), VmError> {
        use yin_core::Effect;
        match eff {
            Effect::StorePut { key, val } => {
                let key = value_key(&key)?;
                self.store.put(key, val.clone());
                self.push(val);
            }
            Effect::StreamMake { capacity } => {
                let sid = self.streams.make_default(capacity);
                self.push(Value::StreamRef(sid));
            }
            Effect::StreamPut { target, val } => self.do_put(target, val, after_ip)?,
            Effect::StreamCursor { source } => self.push(Value::CursorRef(self.streams.cursor(source))),
            Effect::StreamNext { source } => self.do_next(source, after_ip)?,
            Effect::StreamClose { target } => {
                self.streams.close(target);
                self.scheduler.close_propagate(target);
                self.push(Value::StreamRef(target));
            }
        }
        Ok(())
    }

    fn do_put(&mut self, target: StreamId, val: Value, after_ip: usize) -> Result<(), VmError> {
        match self.streams.put(target, val.clone()) {
            PutResult::Ok => self.push(val),
            PutResult::Full => self.park(after_ip, ParkKind::Put { target, value: val }),
            PutResult::Closed => return Err(VmError::new(VmErrorKind::PutOnClosedStream, "put on closed stream").with_ip(self.ip)),
        }
        Ok(())
    }

    fn do_next(&mut self, source: yin_core::CursorRef, after_ip: usize) -> Result<(), VmError> {
        match self.streams.next(source) {
            NextResult::Ok(v, _advanced) => self.push(v),
            NextResult::Blocked => self.park(after_ip, ParkKind::Next { source }),
            NextResult::End | NextResult::Gap => self.push(Value::Nil),
        }
        Ok(())
    }

    fn park(&mut self, after_ip: usize, kind: ParkKind) {
        let snapshot = Snapshot {
            call_stack: std::mem::take(&mut self.call_stack),
            operand_stack: self.operand_stack.clone(),
            env: Rc::clone(&self.env),
            ip: after_ip,
            kind: kind.clone(),
        };
        let reason = match &kind {
            ParkKind::Next { source } => yin_runtime::ParkReason::Next { cursor: *source },
            ParkKind::Put { target, value } => yin_runtime::ParkReason::Put { stream: *target, pending_value: value.clone() },
        };
        self.scheduler.park(snapshot, reason);
        self.status = Status::Blocked;
    }

    fn resume(&mut self, snapshot: Snapshot, resume_value: Option<Value>) -> Result<(), VmError> {
        self.call_stack = snapshot.call_stack;
        self.operand_stack = snapshot.operand_stack;
        self.env = snapshot.env;
        self.ip = snapshot.ip;
        self.status = Status::Running;
        match snapshot.kind {
            ParkKind::Next { .. } => self.push(resume_value.unwrap_or(Value::Nil)),
            ParkKind::Put { target, value } => self.do_put(target, value, snapshot.ip)?,
        }
        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), VmError> {
        let op = self.word(self.ip);
        match op {
            OP_LITERAL => {
                let ki = self.word(self.ip + 1) as usize;
                let s = self.bc.consts[ki].clone();
                self.push(Value::Scalar(s));
                self.ip += 2;
            }
            OP_LOAD_VAR => {
                let ni = self.word(self.ip + 1) as usize;
                let name = self.bc.strings[ni].clone();
                let v = yin_runtime::resolve(&name, &self.env, &self.store, &self.registry).unwrap_or(Value::Nil);
                self.push(v);
                self.ip += 2;
            }
            OP_LAMBDA => {
                let pi = self.word(self.ip + 1) as usize;
                let rel = self.word(self.ip + 2);
                let params = self.bc.param_lists[pi].clone();
                let body_ip = self.ip + 3;
                let closure = Closure { params, body: Body::StackAddress { ip: body_ip }, env: Rc::clone(&self.env) };
                self.push(Value::Closure(Rc::new(closure)));
                self.ip = (body_ip as i64 + rel) as usize;
            }
            OP_APPLY => {
                let argc = self.word(self.ip + 1) as usize;
                let after_ip = self.ip + 2;
                let args = self.pop_args(argc);
                let f = self.pop()?;
                self.apply(f, args, after_ip)?;
            }
            OP_JUMP_IF_FALSE => {
                let rel = self.word(self.ip + 1);
                let after_ip = self.ip + 2;
                let test = self.pop()?;
                self.ip = if test.is_truthy() { after_ip } else { (after_ip as i64 + rel) as usize };
            }
            OP_JUMP => {
                let rel = self.word(self.ip + 1);
                let after_ip = self.ip + 2;
                self.ip = (after_ip as i64 + rel) as usize;
            }
            OP_RETURN => {
                let result = self.pop()?;
                match self.call_stack.pop() {
                    Some(frame) => {
                        self.env = frame.env;
                        self.ip = frame.return_ip;
                        self.push(result);
                    }
                    None => {
                        self.halted_value = Some(result);
                        self.status = Status::Halted;
                    }
                }
            }
            OP_GENSYM => {
                let pi = self.word(self.ip + 1) as usize;
                let prefix = self.bc.strings[pi].clone();
                let sym = format!("{prefix}{}", self.gensym_counter);
                self.gensym_counter += 1;
                self.push(Value::Scalar(Scalar::Symbol(sym)));
                self.ip += 2;
            }
            OP_STORE_GET => {
                let ki = self.word(self.ip + 1) as usize;
                let key = self.bc.strings[ki].clone();
                let v = self.store.get(&key).cloned().unwrap_or(Value::Nil);
                self.push(v);
                self.ip += 2;
            }
            OP_STORE_PUT => {
                let ki = self.word(self.ip + 1) as usize;
                let key = self.bc.strings[ki].clone();
                let v = self.pop()?;
                self.store.put(key, v.clone());
                self.push(v);
                self.ip += 2;
            }
            OP_STREAM_MAKE => {
                let has = self.word(self.ip + 1);
                let val = self.word(self.ip + 2);
                let capacity = if has == 1 { Some(val as usize) } else { None };
                let sid = self.streams.make_default(capacity);
                self.push(Value::StreamRef(sid));
                self.ip += 3;
            }
            OP_STREAM_PUT => {
                let after_ip = self.ip + 1;
                let val = self.pop()?;
                let target = self.pop()?;
                let Value::StreamRef(target) = target else {
                    return Err(VmError::new(VmErrorKind::ApplyNonFunction, "stream-put target is not a stream").with_ip(self.ip));
                };
                self.do_put(target, val, after_ip)?;
            }
            OP_STREAM_CURSOR => {
                let after_ip = self.ip + 1;
                let source = self.pop()?;
                let Value::StreamRef(sid) = source else {
                    return Err(VmError::new(VmErrorKind::ApplyNonFunction, "stream-cursor source is not a stream").with_ip(self.ip));
                };
                self.push(Value::CursorRef(self.streams.cursor(sid)));
                self.ip = after_ip;
            }
            OP_STREAM_TAKE => {
                let after_ip = self.ip + 1;
                let source = self.pop()?;
                let Value::CursorRef(cursor) = source else {
                    return Err(VmError::new(VmErrorKind::ApplyNonFunction, "stream-next source is not a cursor").with_ip(self.ip));
                };
                self.do_next(cursor, after_ip)?;
            }
            OP_STREAM_CLOSE => {
                let after_ip = self.ip + 1;
                let source = self.pop()?;
                let Value::StreamRef(sid) = source else {
                    return Err(VmError::new(VmErrorKind::ApplyNonFunction, "stream-close target is not a stream").with_ip(self.ip));
                };
                self.streams.close(sid);
                self.scheduler.close_propagate(sid);
                self.push(Value::StreamRef(sid));
                self.ip = after_ip;
            }
            other => return Err(VmError::new(VmErrorKind::UnknownNode, format!("unknown opcode {other}")).with_ip(self.ip)),
        }
        Ok(())
    }
}

impl CeskVm for StackVm {
    type Program = Bytecode;

    fn load_program(&mut self, program: Self::Program) -> Result<(), VmError> {
        self.ip = 0;
        self.operand_stack = Vec::new();
        self.env = Env::empty();
        self.call_stack = Vec::new();
        self.bc = program;
        self.status = Status::Running;
        self.steps = 0;
        self.halted_value = None;
        Ok(())
    }

    fn step(&mut self) -> Result<(), VmError> {
        if self.status != Status::Running {
            return Ok(());
        }
        self.steps += 1;
        self.dispatch()
    }

    fn eval(&mut self) -> Result<(), VmError> {
        loop {
            match self.status {
                Status::Halted => return Ok(()),
                Status::Blocked => {
                    self.scheduler.wake_check(&self.streams);
                    match self.scheduler.pop_runnable() {
                        Some(run) => self.resume(run.continuation, run.resume_value)?,
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
        self.halted_value.clone()
    }

    fn environment(&self) -> Rc<Env> {
        Rc::clone(&self.env)
    }

    fn store(&self) -> &Store {
        &self.store
    }

    fn control_repr(&self) -> String {
        format!("ip={}", self.ip)
    }

    fn continuation_repr(&self) -> String {
        format!("{} call frame(s), {} operand(s)", self.call_stack.len(), self.operand_stack.len())
    }

    fn step_count(&self) -> u64 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{compiler::compile, bytecode::assemble};
    use yin_core::AstNode;
    use yin_runtime::{project, DatomIndex};

    fn run(ast: AstNode) -> StackVm {
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let prog = compile(&idx, p.root);
        let bc = assemble(&prog);
        let mut vm = StackVm::new(ModuleRegistry::with_core_primitives());
        vm.load_program(bc).unwrap();
        vm.eval().unwrap();
        vm
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
    fn let_binding_false_is_not_fallthrough() {
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Lambda {
                params: vec!["x".into()],
                body: Box::new(AstNode::Variable { name: "x".into() }),
            }),
            operands: vec![AstNode::Literal { value: Scalar::Bool(false) }],
        };
        assert_eq!(run(ast).value(), Some(Value::bool(false)));
    }

    #[test]
    fn operand_stack_is_empty_after_a_closed_program_halts() {
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Variable { name: "+".into() }),
            operands: vec![
                AstNode::Literal { value: Scalar::Int(1) },
                AstNode::Literal { value: Scalar::Int(2) },
            ],
        };
        let m = run(ast);
        assert!(m.operand_stack.is_empty(), "no leftover operands once halted");
    }

    #[test]
    fn producer_parks_then_resumes_after_stream_drains() {
        // `((λ (s) ((λ (_) (stream/put s 2)) (stream/put s 1))) (stream/make 1))`
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
        let p = project(&ast, 0);
        let idx = DatomIndex::build(&p.datoms);
        let prog = compile(&idx, p.root);
        let bc = assemble(&prog);
        let mut vm = StackVm::new(ModuleRegistry::with_core_primitives());
        vm.load_program(bc).unwrap();
        vm.eval().unwrap();
        assert!(vm.blocked());
        assert!(vm.value().is_none());
    }
}
