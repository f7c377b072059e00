//! The CESK contract shared by all four backends (§4.3).
//!
//! The contract is identical across backends so client code may swap the
//! backend a program runs on without changing call sites; what differs
//! per implementation is the `Program` format `load_program` accepts and
//! the internal shape of Control/Continuation.

use std::rc::Rc;

use yin_core::{Env, Value, VmError};
use yin_runtime::Store;

/// A VM's run status. Checked once per loop iteration rather than
/// re-deriving `halted?`/`blocked?` from other state every step (§9,
/// "the VM loop may check a single state flag").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Blocked,
    Halted,
}

pub trait CeskVm {
    /// VM-specific program format: an AST map, `{datoms, root}`, or
    /// `{bytecode, pool, reg_count}`, per backend (§4.3).
    type Program;

    fn load_program(&mut self, program: Self::Program) -> Result<(), VmError>;

    /// One CESK transition.
    fn step(&mut self) -> Result<(), VmError>;

    /// Owns the step loop and the scheduler: steps until halted, or until
    /// blocked and the wait-set has nothing runnable (the caller must
    /// mutate shared stream/store state and call `eval` again to make
    /// progress from there) (§4.3, §4.9).
    fn eval(&mut self) -> Result<(), VmError>;

    fn status(&self) -> Status;

    fn halted(&self) -> bool {
        self.status() == Status::Halted
    }

    fn blocked(&self) -> bool {
        self.status() == Status::Blocked
    }

    /// The current result, once halted.
    fn value(&self) -> Option<Value>;

    fn environment(&self) -> Rc<Env>;

    fn store(&self) -> &Store;

    /// A backend-specific rendering of the current control, for error
    /// snapshots and diagnostics only — not part of any equality contract.
    fn control_repr(&self) -> String;

    fn continuation_repr(&self) -> String;

    /// Number of `step` calls since the program was loaded.
    fn step_count(&self) -> u64;
}
