//! Result and error types for the compilation pipeline.

use failure_derive::Fail;

/// A compilation error.
///
/// Invariant violations inside passes are programmer errors and panic
/// instead; this type covers the diagnosable failures a caller can act on.
#[derive(Fail, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// A registered function subgraph has no `Start` node reachable from
    /// its `End`.
    #[fail(display = "malformed function: no Start node reachable from End")]
    MalformedFunction,

    /// The function's control flow never reaches `End`.
    #[fail(display = "function has no entry block")]
    NoEntryBlock,
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error
/// type.
pub type CodegenResult<T> = Result<T, CodegenError>;
