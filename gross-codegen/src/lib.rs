//! GROSS code generation library.
//!
//! A sea-of-nodes compilation core for a small imperative teaching
//! language, targeting a DLX-style RISC machine. The crate covers
//! everything between the parser (which builds graphs through the typed
//! node builders) and the instruction encoder (which walks the final
//! schedules): the graph data model, the fix-point reducer and its
//! optimization passes, instruction selection, scheduling, register
//! allocation and the post-allocation lowerings.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces, missing_docs)]

pub use gross_entity as entity;

pub mod graph;
pub mod isel;
pub mod postlower;
pub mod postra;
pub mod reductions;
pub mod regalloc;
pub mod schedule;
pub mod targets;

mod context;
mod result;

pub use crate::context::{CompiledFunction, Context};
pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
