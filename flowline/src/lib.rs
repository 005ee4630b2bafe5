//! # Flowline
//!
//! A composable, in-process dataflow engine: assemble a directed chain
//! of processing stages (with optional nested sub-chains), feed it a
//! stream of input items, and consume a stream of output items, while
//! the engine enforces backpressure, bounded concurrency, per-item
//! error isolation, and an explicit run lifecycle.
//!
//! Flowline provides:
//!
//! - **Five stage variants**: pass-through, filter, buffered (bounded
//!   concurrency with backpressure), branch (sub-chain that rejoins),
//!   and fork (sub-chain that takes the item for good)
//! - **Context management**: a thread-safe typed store per item plus a
//!   run-wide global context, each with a per-stage error ledger
//! - **Continue-on-failure**: stage hook errors are recorded, never
//!   fatal; only a filter's negative decision stops an item
//! - **Pull-based results**: an internally pushed result queue exposed
//!   as an asynchronous sequence
//! - **Run-wide cancellation**: one token, propagated transitively
//!   through nested sub-chains
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowline::prelude::*;
//!
//! let pipeline = PipelineBuilder::new()
//!     .add_step(FetchStage::new())
//!     .add_filter(OnlyInteresting)
//!     .add_buffered_step(EnrichStage::new())
//!     .build()?;
//!
//! let result = pipeline.invoke(Document::new("hello")).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod context;
pub mod errors;
pub mod pipeline;
pub mod services;
pub mod stages;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::context::{Context, ExecutionRequest};
    pub use crate::errors::{ContextError, FlowlineError, PipelineError};
    pub use crate::pipeline::{
        Pipeline, PipelineBuilder, PipelineOptions, ResultStream, RunState,
    };
    pub use crate::services::{ServiceRegistry, ServiceScope};
    pub use crate::stages::{
        BranchStage, BufferedStage, Filter, FilterStage, ForkStage, PassThroughStage, Process,
        Stage, StageKind,
    };
}
