//! The stack backend (§4.7): symbolic stack assembly → numeric bytecode
//! → an operand-stack interpreter.

pub mod bytecode;
pub mod compiler;
pub mod vm;

pub use bytecode::{assemble, Bytecode};
pub use compiler::{compile, Instr, Program as SymbolicProgram};
pub use vm::StackVm;
