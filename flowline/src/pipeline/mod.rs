//! Pipeline composition and execution.
//!
//! This module provides:
//! - [`PipelineBuilder`]: registration of stages and sources, the
//!   tail-to-head linking pass, and nested sub-chain composition
//! - [`Pipeline`]: the orchestrator driving the
//!   `Created -> Running -> Finalizing -> Stopped` lifecycle
//! - [`ResultStream`]: the pull side of the run's output
//! - [`PipelineOptions`]: buffering and polling configuration

mod builder;
#[cfg(test)]
mod integration_tests;
mod options;
mod orchestrator;
mod result;

pub use builder::PipelineBuilder;
pub use options::PipelineOptions;
pub use orchestrator::{Pipeline, RunState};
pub use result::ResultStream;
