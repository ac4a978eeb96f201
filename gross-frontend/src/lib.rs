//! Parser-facing helpers for building GROSS graphs.
//!
//! The recursive-descent parser does not manipulate graph edges directly;
//! it drives a `FunctionGraphBuilder`, which tracks the current control
//! point and each variable's last modifier through copy-on-write affine
//! tables and inserts the parse-time phis at control-flow joins.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod affine;
pub mod frontend;

pub use crate::affine::{AffineContainer, AffineRecordTable};
pub use crate::frontend::{declare_builtins, FunctionGraphBuilder};
