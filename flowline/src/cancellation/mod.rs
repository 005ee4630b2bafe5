//! Run-wide cooperative cancellation.
//!
//! One [`CancellationToken`] is created per top-level pipeline build and
//! handed to every stage, including the stages of nested sub-pipelines.
//! Every cooperative sleep in the engine is raced against the token so
//! that cancellation unblocks suspended work immediately rather than on
//! the next polling interval.

mod token;

pub use token::CancellationToken;
