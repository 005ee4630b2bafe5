//! Conditional sub-chain that ends the item's journey.

use crate::context::ExecutionRequest;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::stages::{Filter, Stage, StageCore, StageKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, error};

/// A stage with the same predicate semantics as
/// [`crate::stages::BranchStage`], except that a true decision hands the
/// request to a sub-pipeline whose terminal output is the fork-exit
/// continuation (ultimately the owning pipeline's result sink) rather
/// than this stage's `next` - once forked, the item never returns to
/// the parent chain. On false the request passes through to `next`
/// untouched.
pub struct ForkStage {
    core: StageCore,
    hook: Arc<dyn Filter>,
    child: Mutex<Option<PipelineBuilder>>,
    pipeline: RwLock<Option<Pipeline>>,
}

impl ForkStage {
    /// Creates a fork stage around a predicate and the builder of its
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
impl Stage for ForkStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn kind(&self) -> StageKind {
        StageKind::Fork
    }

    async fn invoke(&self, request: Arc<ExecutionRequest>) {
        request.record_visit(&self.name());

        let take_fork = match self.hook.filter(request.clone()).await {
            Ok(decision) => decision,
            Err(err) => {
                request.item().add_error(&self.name(), err);
                false
            }
        };

        if take_fork {
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
    /// sink with the fork-exit continuation supplied by the owning
    /// pipeline's linking pass.
    async fn start(&self) {
        let Some(builder) = self.child.lock().take() else {
            return;
        };
        match builder.build_with(Some(self.core.token()), self.core.end(), None) {
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

impl std::fmt::Debug for ForkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkStage")
            .field("name", &self.name())
            .field("started", &self.pipeline.read().is_some())
            .finish()
    }
}
