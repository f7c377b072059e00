//! Backend agreement (spec §8 law 2): for a closed, deterministic
//! program, every CESK backend produces the same final value.

use yin_core::{AstNode, Scalar, Value};
use yin_runtime::{project, DatomIndex, ModuleRegistry};
use yin_vm::{datom_graph::DatomGraphVm, register, stack, tree_walk::TreeWalkVm, CeskVm};

fn two_arg_closure_call() -> AstNode {
    AstNode::Application {
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
    }
}

fn if_false_branch() -> AstNode {
    AstNode::If {
        test: Box::new(AstNode::Literal { value: Scalar::Bool(false) }),
        consequent: Box::new(AstNode::Literal { value: Scalar::Int(1) }),
        alternate: Box::new(AstNode::Literal { value: Scalar::Int(0) }),
    }
}

fn eval_all(ast: &AstNode) -> Vec<Option<Value>> {
    let projection = project(ast, 0);
    let idx = DatomIndex::build(&projection.datoms);

    let mut tree = TreeWalkVm::new(ModuleRegistry::with_core_primitives());
    tree.load_program(ast.clone()).unwrap();
    tree.eval().unwrap();

    let mut graph = DatomGraphVm::new(ModuleRegistry::with_core_primitives());
    graph.load_program((projection.datoms.clone(), projection.root)).unwrap();
    graph.eval().unwrap();

    let reg_prog = register::compiler::compile(&idx, projection.root).unwrap();
    let reg_bc = register::bytecode::assemble(&reg_prog);
    let mut reg = register::RegisterVm::new(ModuleRegistry::with_core_primitives());
    reg.load_program(reg_bc).unwrap();
    reg.eval().unwrap();

    let stack_prog = stack::compiler::compile(&idx, projection.root).unwrap();
    let stack_bc = stack::bytecode::assemble(&stack_prog);
    let mut stk = stack::StackVm::new(ModuleRegistry::with_core_primitives());
    stk.load_program(stack_bc).unwrap();
    stk.eval().unwrap();

    vec![tree.value(), graph.value(), reg.value(), stk.value()]
}

#[test]
fn all_backends_agree_on_a_closure_application() {
    let values = eval_all(&two_arg_closure_call());
    assert_eq!(values, vec![Some(Value::int(8)); 4]);
}

#[test]
fn all_backends_agree_on_an_if_expression() {
    let values = eval_all(&if_false_branch());
    assert_eq!(values, vec![Some(Value::int(0)); 4]);
}

#[test]
fn all_backends_treat_a_false_binding_as_a_real_hit() {
    let ast = AstNode::Application {
        operator: Box::new(AstNode::Lambda {
            params: vec!["x".into()],
            body: Box::new(AstNode::Variable { name: "x".into() }),
        }),
        operands: vec![AstNode::Literal { value: Scalar::Bool(false) }],
    };
    let values = eval_all(&ast);
    assert_eq!(values, vec![Some(Value::bool(false)); 4]);
}
