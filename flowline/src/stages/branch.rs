//! Conditional sub-chain that rejoins the parent chain.

use crate::context::ExecutionRequest;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::stages::{Filter, Stage, StageCore, StageKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, error};

/// A stage that evaluates a [`Filter`] predicate and, on a true
/// decision, detours the request through a nested sub-pipeline whose
/// terminal output calls back into this stage's own `next` - the item
/// rejoins the parent chain once the sub-chain finishes. On false the
/// request skips the sub-chain and continues to `next` directly; a
/// predicate error is recorded and skips the sub-chain the same way.
pub struct BranchStage {
    core: StageCore,
    hook: Arc<dyn Filter>,
    child: Mutex<Option<PipelineBuilder>>,
    pipeline: RwLock<Option<Pipeline>>,
}

impl BranchStage {
    /// Creates a branch stage around a predicate and the builder of its
    /// sub-chain. The sub-pipeline is built and started by `start()`.
    #[must_use]
    pub fn new(hook: Arc<dyn Filter>, child: PipelineBuilder) -> Self {
        Self {
            core: StageCore::new(),
            hook,
            child: Mutex::new(Some(child)),
            pipeline: RwLock::new(None),
        }
    }

    fn sub_pipeline(&self) -> Option<Pipeline> {
        self.pipeline.read().clone()
    }
}

#[async_trait]
impl Stage for BranchStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn kind(&self) -> StageKind {
        StageKind::Branch
    }

    async fn invoke(&self, request: Arc<ExecutionRequest>) {
        request.record_visit(&self.name());

        let take_branch = match self.hook.filter(request.clone()).await {
            Ok(decision) => decision,
            Err(err) => {
                request.item().add_error(&self.name(), err);
                false
            }
        };

        if take_branch {
            if let Some(pipeline) = self.sub_pipeline() {
                if let Err(err) = pipeline.inner().add_input_request(request).await {
                    debug!(stage = %self.name(), error = %err, "sub-chain rejected request");
                }
                return;
            }
        }
        self.core.call_next(request).await;
    }

    /// Builds and starts the sub-pipeline, parameterizing its terminal
    /// sink with this stage's own `next` and deriving its cancellation
    /// token from this stage's.
    async fn start(&self) {
        let Some(builder) = self.child.lock().take() else {
            return;
        };
        match builder.build_with(Some(self.core.token()), self.core.next(), None) {
            Ok(pipeline) => {
                if let Err(err) = pipeline.start().await {
                    error!(stage = %self.name(), error = %err, "sub-chain failed to start");
                }
                *self.pipeline.write() = Some(pipeline);
            }
            Err(err) => {
                error!(stage = %self.name(), error = %err, "sub-chain failed to build");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.sub_pipeline().map_or(true, |p| p.is_running())
    }

    fn supports_finalize(&self) -> bool {
        true
    }

    async fn finalize(&self) {
        if let Some(pipeline) = self.sub_pipeline() {
            if let Err(err) = pipeline.finalize().await {
                debug!(stage = %self.name(), error = %err, "sub-chain finalize");
            }
        }
    }

    async fn dispose(&self) {
        if let Some(pipeline) = self.sub_pipeline() {
            pipeline.dispose().await;
        }
    }
}

impl std::fmt::Debug for BranchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchStage")
            .field("name", &self.name())
            .field("started", &self.pipeline.read().is_some())
            .finish()
    }
}
