//! AddressSanitizer-style instrumentation of pewter block graphs.
//!
//! The pass rewrites the block graph of an already-compiled 32-bit x86
//! Windows image so that every instrumentable memory access is preceded
//! by a call into a runtime library (the RTL) that validates the access
//! against shadow memory:
//!
//! - every eligible basic block is walked and probe calls are emitted in
//!   front of qualifying accesses ([`instrumenter`]);
//! - the probe functions are imported from the RTL, with IAT bootstrap
//!   stubs so probes stay callable before the loader binds the import
//!   ([`stubs`]);
//! - intercepted CRT/system functions are redirected to RTL
//!   interceptors ([`intercepts`]), and the CRT's heap initialization is
//!   patched to create a private heap ([`heap`]).
//!
//! [`transform::AsanTransform`] drives the whole pass; everything else
//! is a component it orchestrates.

pub mod access;
pub mod heap;
pub mod instrumenter;
pub mod intercepts;
pub mod liveness;
pub mod probes;
pub mod redundancy;
pub mod stack;
pub mod stubs;
pub mod transform;

pub use crate::access::{memory_access_of, MemoryAccessInfo, MemoryAccessMode};
pub use crate::instrumenter::BasicBlockInstrumenter;
pub use crate::probes::ProbeTable;
pub use crate::stack::StackMode;
pub use crate::transform::{AsanTransform, InstrumentationOptions, PassStats};

use pewter_graph::GraphError;
use thiserror::Error;

/// Errors that abort the pass.
///
/// Per-block errors are fatal; no partially instrumented graph is ever
/// handed onward.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// The image already carries a generated-thunks section.
    #[error("image is already instrumented (a `.thunks` section exists)")]
    AlreadyInstrumented,
    /// A computed access has no probe in the reference table; this
    /// indicates a bug in the probe-table enumeration.
    #[error("no probe imported for access `{0}`")]
    UnknownProbe(MemoryAccessInfo),
    /// The import transform failed.
    #[error("import failed")]
    ImportFailure(#[source] GraphError),
    /// The block builder rejected a synthesized stub or thunk.
    #[error("thunk build failed")]
    ThunkBuildFailure(#[source] GraphError),
    /// The object already defines an interceptor symbol name.
    #[error("object already defines `{0}`")]
    CoffNameCollision(String),
    /// A delegated graph transform failed.
    #[error("transform failed")]
    TransformFailure(#[source] GraphError),
}

/// Convenient alias for pass results.
pub type InstrumentResult<T> = Result<T, InstrumentError>;
