//! The register backend (§4.6): a two-phase compiler (AST → symbolic
//! register assembly → numeric bytecode) plus the interpreter that runs
//! the numeric form.

pub mod bytecode;
pub mod compiler;
pub mod vm;

pub use bytecode::{assemble, Bytecode};
pub use compiler::{compile, Instr, Program as SymbolicProgram, Reg};
pub use vm::RegisterVm;
