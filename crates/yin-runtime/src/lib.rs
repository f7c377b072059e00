//! Yin Runtime: the datom/stream/scheduler machinery every CESK backend
//! in `yin-vm` is built on top of.
//!
//! - [`project`]/[`hash`]: turn an [`yin_core::AstNode`] into datoms, and
//!   datoms into content hashes (§4.1, §4.2).
//! - [`stream`]/[`scheduler`]: the stream core and the cooperative
//!   scheduler every backend shares (§4.8, §4.9).
//! - [`store`]/[`module`]: the global store and the primitive/module
//!   registry behind the four-tier variable resolution chain (§3, §4.11).
//! - [`builtins`]: the core arithmetic/comparison/boolean primitive tier.
//! - [`transport`]: content-addressed export/import of ASTs and parked
//!   continuations (§4.10).

pub mod builtins;
pub mod hash;
pub mod module;
pub mod project;
pub mod scheduler;
pub mod store;
pub mod stream;
pub mod transport;

pub use hash::{content_hash_datoms, content_hashes, ContentHasher, Sha256Hasher};
pub use module::{resolve, ModuleRegistry, Primitive};
pub use project::{project, DatomIndex, Projection};
pub use scheduler::{ParkReason, ParkedEntry, RunEntry, Scheduler};
pub use store::Store;
pub use stream::{NextResult, PutResult, Stream, StreamStorage, StreamStore, StreamTable, VecStorage};
pub use transport::{
    export_ast, export_env, export_value, import_ast, import_env, import_value, Bundle, BundleEntry,
    ExportedValue,
};
