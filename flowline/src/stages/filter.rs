//! Predicate stage that stops non-matching requests.

use crate::context::ExecutionRequest;
use crate::stages::{Filter, Stage, StageCore, StageKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A stage that evaluates a [`Filter`] predicate over the request.
///
/// True continues down the chain; false marks the request complete and
/// stops propagation. A predicate error is recorded like any stage
/// error and treated as an implicit false, so the item does not
/// propagate.
pub struct FilterStage {
    core: StageCore,
    hook: Arc<dyn Filter>,
    running: AtomicBool,
}

impl FilterStage {
    /// Creates a filter stage around a predicate hook.
    #[must_use]
    pub fn new(hook: Arc<dyn Filter>) -> Self {
        Self {
            core: StageCore::new(),
            hook,
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Stage for FilterStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    async fn invoke(&self, request: Arc<ExecutionRequest>) {
        self.running.store(true, Ordering::SeqCst);
        request.record_visit(&self.name());

        let run_next = match self.hook.filter(request.clone()).await {
            Ok(decision) => decision,
            Err(error) => {
                request.item().add_error(&self.name(), error);
                false
            }
        };

        self.running.store(false, Ordering::SeqCst);

        if run_next {
            self.core.call_next(request).await;
        } else {
            request.complete();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStage")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::{recording_continuation, request};
    use crate::stages::FnFilter;
    use anyhow::anyhow;

    fn stage_with(decision: anyhow::Result<bool>) -> FilterStage {
        let decision = std::sync::Mutex::new(Some(decision));
        let stage = FilterStage::new(Arc::new(FnFilter::new(move |_req| {
            let taken = decision.lock().unwrap().take().unwrap();
            async move { taken }
        })));
        stage.core().set_name("Step 1. Gate".into());
        stage
    }

    #[tokio::test]
    async fn test_true_continues() {
        let stage = stage_with(Ok(true));
        let (continuation, seen) = recording_continuation();
        stage.core().set_next(continuation);

        let req = request();
        stage.invoke(req.clone()).await;

        assert_eq!(seen.lock().len(), 1);
        assert!(!req.is_completed());
    }

    #[tokio::test]
    async fn test_false_completes_and_stops() {
        let stage = stage_with(Ok(false));
        let (continuation, seen) = recording_continuation();
        stage.core().set_next(continuation);

        let req = request();
        stage.invoke(req.clone()).await;

        assert!(seen.lock().is_empty());
        assert!(req.is_completed());
    }

    #[tokio::test]
    async fn test_predicate_error_is_implicit_false() {
        let stage = stage_with(Err(anyhow!("bad predicate")));
        let (continuation, seen) = recording_continuation();
        stage.core().set_next(continuation);

        let req = request();
        stage.invoke(req.clone()).await;

        assert!(seen.lock().is_empty());
        assert!(req.is_completed());
        assert_eq!(
            req.item().errors()["Step 1. Gate"][0].to_string(),
            "bad predicate"
        );
    }
}
