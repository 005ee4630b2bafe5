//! Item and run-level state carried through a pipeline.
//!
//! This module provides:
//! - [`Context`]: a thread-safe, append-only, multi-valued typed store
//!   plus a per-stage error ledger
//! - [`ExecutionRequest`]: the unit passed between stages, coupling the
//!   run's global context, one item's context, a per-item service scope,
//!   and visit/completion bookkeeping

mod request;
mod store;

pub use request::ExecutionRequest;
pub use store::Context;
