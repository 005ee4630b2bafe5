//! Stage abstraction and its five behavioral variants.
//!
//! A stage is one link in a pipeline's forward chain. The closed set of
//! variants - [`PassThroughStage`], [`FilterStage`], [`BufferedStage`],
//! [`BranchStage`], [`ForkStage`] - share one capability trait
//! ([`Stage`]); concrete business logic attaches by composition, as a
//! held [`Process`] or [`Filter`] strategy (a user type or an async
//! closure), never by inheritance.
//!
//! Stages must never let a hook error escape `invoke`: it is caught,
//! recorded into the item context's ledger under the stage's name, and
//! the request continues to the next stage. Only a Filter's negative
//! decision stops propagation.

mod branch;
mod buffered;
mod filter;
mod fork;
mod passthrough;

pub use branch::BranchStage;
pub use buffered::BufferedStage;
pub use filter::FilterStage;
pub use fork::ForkStage;
pub use passthrough::PassThroughStage;

use crate::cancellation::CancellationToken;
use crate::context::ExecutionRequest;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;

/// The entry point of the following stage (or the orchestrator's sink).
///
/// Each stage holds exactly one continuation; the chain is acyclic and
/// frozen by the builder's linking pass before the pipeline starts.
pub type Continuation = Arc<dyn Fn(Arc<ExecutionRequest>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Which of the five behavioral variants a stage is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Transforms or observes the request inline, then continues.
    PassThrough,
    /// Stops propagation of requests that fail a predicate.
    Filter,
    /// Queues requests and processes them with bounded concurrency.
    Buffered,
    /// Conditionally detours through a sub-pipeline, then rejoins.
    Branch,
    /// Conditionally hands the request to a sub-pipeline for good.
    Fork,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::PassThrough => "pass-through",
            Self::Filter => "filter",
            Self::Buffered => "buffered",
            Self::Branch => "branch",
            Self::Fork => "fork",
        };
        f.write_str(label)
    }
}

/// The processing hook supplied by pass-through, buffered, and source
/// stages.
#[async_trait]
pub trait Process: Send + Sync {
    /// Processes one request. An error here is recorded into the item
    /// context's error ledger and the request still continues onward.
    async fn process(&self, request: Arc<ExecutionRequest>) -> anyhow::Result<()>;
}

/// The predicate hook supplied by filter, branch, and fork stages.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Decides whether the request takes this stage's positive path.
    /// An error is recorded and treated as a `false` decision.
    async fn filter(&self, request: Arc<ExecutionRequest>) -> anyhow::Result<bool>;
}

/// Wiring shared by every stage variant: display name, the `next`
/// continuation, the fork-exit continuation, and the run-wide
/// cancellation token.
///
/// All slots are assigned by the builder's linking pass and are not
/// mutated after the pipeline starts. The fork-exit slot is set on every
/// stage for uniformity but only [`ForkStage`] reads it.
pub struct StageCore {
    name: RwLock<String>,
    next: RwLock<Option<Continuation>>,
    end: RwLock<Option<Continuation>>,
    token: RwLock<CancellationToken>,
}

impl StageCore {
    pub(crate) fn new() -> Self {
        Self {
            name: RwLock::new(String::new()),
            next: RwLock::new(None),
            end: RwLock::new(None),
            token: RwLock::new(CancellationToken::new()),
        }
    }

    /// The display name assigned by the builder's naming pass; also the
    /// key under which this stage's failures appear in error ledgers.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// The cancellation token this stage observes.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.read().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub(crate) fn set_next(&self, next: Continuation) {
        *self.next.write() = Some(next);
    }

    pub(crate) fn set_end(&self, end: Continuation) {
        *self.end.write() = Some(end);
    }

    pub(crate) fn set_token(&self, token: CancellationToken) {
        *self.token.write() = token;
    }

    pub(crate) fn next(&self) -> Option<Continuation> {
        self.next.read().clone()
    }

    pub(crate) fn end(&self) -> Option<Continuation> {
        self.end.read().clone()
    }

    /// Invokes the next stage's entry point, if one is wired.
    pub(crate) async fn call_next(&self, request: Arc<ExecutionRequest>) {
        let next = self.next();
        if let Some(next) = next {
            next(request).await;
        }
    }

    /// Invokes the fork-exit continuation, if one is wired.
    pub(crate) async fn call_end(&self, request: Arc<ExecutionRequest>) {
        let end = self.end();
        if let Some(end) = end {
            end(request).await;
        }
    }
}

impl std::fmt::Debug for StageCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCore")
            .field("name", &self.name())
            .field("linked", &self.next.read().is_some())
            .finish()
    }
}

/// Capability contract every stage variant implements.
///
/// The orchestrator drives stages only through this trait: `start` once
/// before any `invoke`, `is_running` to detect drain completion,
/// `finalize` for stages that support an explicit drain, and `dispose`
/// for cleanup.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The shared wiring slots of this stage.
    fn core(&self) -> &StageCore;

    /// Which behavioral variant this stage is.
    fn kind(&self) -> StageKind;

    /// Entry point. Must never raise past its own boundary.
    async fn invoke(&self, request: Arc<ExecutionRequest>);

    /// Called once, after wiring, before any `invoke`.
    async fn start(&self) {}

    /// True while this stage holds queued or in-flight work.
    fn is_running(&self) -> bool;

    /// Whether this stage supports an explicit drain via `finalize`.
    fn supports_finalize(&self) -> bool {
        false
    }

    /// Signals that no more input is coming and waits for the drain.
    async fn finalize(&self) {}

    /// Releases the stage's resources.
    async fn dispose(&self) {}

    /// The stage's display name.
    fn name(&self) -> String {
        self.core().name()
    }
}

/// Adapts an async closure into a [`Process`] hook.
pub(crate) struct FnProcess {
    f: Box<dyn Fn(Arc<ExecutionRequest>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
}

impl FnProcess {
    pub(crate) fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<ExecutionRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            f: Box::new(move |request| f(request).boxed()),
        }
    }
}

#[async_trait]
impl Process for FnProcess {
    async fn process(&self, request: Arc<ExecutionRequest>) -> anyhow::Result<()> {
        (self.f)(request).await
    }
}

/// Adapts an async closure into a [`Filter`] hook.
pub(crate) struct FnFilter {
    f: Box<dyn Fn(Arc<ExecutionRequest>) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>,
}

impl FnFilter {
    pub(crate) fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<ExecutionRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            f: Box::new(move |request| f(request).boxed()),
        }
    }
}

#[async_trait]
impl Filter for FnFilter {
    async fn filter(&self, request: Arc<ExecutionRequest>) -> anyhow::Result<bool> {
        (self.f)(request).await
    }
}

/// Builds a continuation that invokes `stage`.
pub(crate) fn invoke_continuation(stage: Arc<dyn Stage>) -> Continuation {
    Arc::new(move |request| {
        let stage = stage.clone();
        async move { stage.invoke(request).await }.boxed()
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::context::Context;
    use crate::services::ServiceRegistry;
    use parking_lot::Mutex;

    pub(crate) fn request() -> Arc<ExecutionRequest> {
        Arc::new(ExecutionRequest::new(
            Arc::new(Context::new()),
            Arc::new(Context::new()),
            ServiceRegistry::new().scope(),
        ))
    }

    /// A continuation that records every request it receives.
    pub(crate) fn recording_continuation() -> (Continuation, Arc<Mutex<Vec<Arc<ExecutionRequest>>>>) {
        let seen: Arc<Mutex<Vec<Arc<ExecutionRequest>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let continuation: Continuation = Arc::new(move |request| {
            let sink = sink.clone();
            async move {
                sink.lock().push(request);
            }
            .boxed()
        });
        (continuation, seen)
    }
}
