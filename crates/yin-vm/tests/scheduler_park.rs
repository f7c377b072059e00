//! Scheduler park/wake (spec §8 seed scenario): a producer blocks
//! putting into a stream at capacity, a consumer drains a slot, and the
//! producer wakes and completes — across two separately-loaded programs
//! sharing one VM instance's stream/store state.

use yin_core::{AstNode, Scalar, Value};
use yin_runtime::{project, DatomIndex, ModuleRegistry, NextResult};
use yin_vm::{register, CeskVm};

fn make_capacity_one_stream_bound_to(key: &str) -> AstNode {
    AstNode::StorePut {
        key: key.to_string(),
        val: Box::new(AstNode::StreamMake { buffer: Some(1) }),
    }
}

fn put_into(key: &str, value: i64) -> AstNode {
    AstNode::StreamPut {
        target: Box::new(AstNode::StoreGet { key: key.to_string() }),
        val: Box::new(AstNode::Literal { value: Scalar::Int(value) }),
    }
}

fn load_and_run(vm: &mut register::RegisterVm, ast: &AstNode) {
    let projection = project(ast, 0);
    let idx = DatomIndex::build(&projection.datoms);
    let symbolic = register::compiler::compile(&idx, projection.root).unwrap();
    let bytecode = register::bytecode::assemble(&symbolic);
    vm.load_program(bytecode).unwrap();
    vm.eval().unwrap();
}

#[test]
fn producer_parks_on_a_full_stream_and_resumes_once_a_consumer_drains_it() {
    let mut vm = register::RegisterVm::new(ModuleRegistry::with_core_primitives());

    load_and_run(&mut vm, &make_capacity_one_stream_bound_to("s"));
    let Some(Value::StreamRef(sid)) = vm.value() else {
        panic!("expected the stream-make program to halt with a stream ref");
    };

    load_and_run(&mut vm, &put_into("s", 1));
    assert!(vm.halted(), "first put into an empty capacity-1 stream must not park");
    assert_eq!(vm.value(), Some(Value::int(1)));

    load_and_run(&mut vm, &put_into("s", 2));
    assert!(vm.blocked(), "second put into a still-full stream must park");
    assert_eq!(vm.value(), None);

    // Consumer, external to the parked producer, drains the one queued
    // value via its own cursor.
    let consumer_cursor = vm.streams().cursor(sid);
    let (first_value, consumer_cursor) = match vm.streams_mut().next(consumer_cursor) {
        NextResult::Ok(v, next) => (v, next),
        other => panic!("expected a value at the head of the stream, got {other:?}"),
    };
    assert_eq!(first_value, Value::int(1));

    // Draining freed a slot; re-evaluating wakes the parked producer.
    vm.eval().unwrap();
    assert!(vm.halted(), "producer should complete once capacity frees up");
    assert_eq!(vm.value(), Some(Value::int(2)));

    let (second_value, _) = match vm.streams_mut().next(consumer_cursor) {
        NextResult::Ok(v, next) => (v, next),
        other => panic!("expected the producer's second value, got {other:?}"),
    };
    assert_eq!(second_value, Value::int(2));
}
