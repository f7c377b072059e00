//! The four CESK backends (§4.3–§4.7) over the datom/stream/scheduler
//! machinery in `yin-runtime`.
//!
//! - [`cesk`]: the shared `CeskVm` trait/`Status` every backend implements.
//! - [`tree_walk`]: control is the current entity or a value; continuation
//!   is a linked list of frames (§4.4).
//! - [`datom_graph`]: the same evaluation strategy with an explicit
//!   `Vec`-backed stack of frames standing in for the continuation (§4.5).
//! - [`register`]/[`stack`]: the two bytecode backends, each split into a
//!   symbolic compiler, a numeric bytecode emitter, and an interpreter
//!   (§4.6, §4.7).
//! - [`trace`]: the opt-in step trace surface, wired into the register
//!   backend (§4.12).

pub mod cesk;
pub mod datom_graph;
pub mod register;
pub mod stack;
pub mod support;
pub mod trace;
pub mod tree_walk;

pub use cesk::{CeskVm, Status};
pub use datom_graph::DatomGraphVm;
pub use tree_walk::TreeWalkVm;
