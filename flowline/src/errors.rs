//! Error types for the flowline engine.
//!
//! Two of the three failure classes live here as concrete types:
//! context invariant violations and pipeline lifecycle misuse. Both are
//! programmer errors surfaced synchronously to the violating caller.
//! The third class, errors raised inside user-supplied stage hooks, is
//! never surfaced as a return value; those are recorded into the item
//! context's error ledger and processing continues (see [`crate::context::Context::add_error`]).

use thiserror::Error;

/// The main error type for flowline operations.
#[derive(Debug, Error)]
pub enum FlowlineError {
    /// A context invariant was violated.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The pipeline lifecycle state machine was misused.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Error raised when a context invariant is violated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// An absent value was passed where a present value is required.
    #[error("cannot add an absent value to a context")]
    AbsentValue,
}

/// Error raised when the pipeline lifecycle state machine is misused.
///
/// These always indicate a bug in the calling code, never a data
/// problem, so they fail fast and are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// `start()` was called on a pipeline that has already been started.
    #[error("pipeline can only be started once")]
    AlreadyRunning,

    /// An operation that requires a running pipeline was called before `start()`.
    #[error("pipeline is not running; call start() first")]
    NotRunning,

    /// Input was submitted, or `finalize()` called, after the pipeline was finalized.
    #[error("pipeline has already been finalized")]
    AlreadyFinalized,

    /// `build()` was called with no sources and no stages registered.
    #[error("pipeline has no sources or stages")]
    Empty,

    /// The result stream was requested after it had already been taken.
    #[error("result stream has already been consumed")]
    ResultsConsumed,

    /// The run-wide cancellation token fired while the operation was suspended.
    #[error("pipeline cancelled: {0}")]
    Cancelled(String),
}
