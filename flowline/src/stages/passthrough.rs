//! Inline transform stage.

use crate::context::ExecutionRequest;
use crate::stages::{Process, Stage, StageCore, StageKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A stage that runs its [`Process`] hook on the caller's task and then
/// continues down the chain. Introduces no concurrency or buffering of
/// its own.
pub struct PassThroughStage {
    core: StageCore,
    hook: Arc<dyn Process>,
    running: AtomicBool,
}

impl PassThroughStage {
    /// Creates a pass-through stage around a processing hook.
    #[must_use]
    pub fn new(hook: Arc<dyn Process>) -> Self {
        Self {
            core: StageCore::new(),
            hook,
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Stage for PassThroughStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn kind(&self) -> StageKind {
        StageKind::PassThrough
    }

    async fn invoke(&self, request: Arc<ExecutionRequest>) {
        self.running.store(true, Ordering::SeqCst);
        request.record_visit(&self.name());

        if let Err(error) = self.hook.process(request.clone()).await {
            request.item().add_error(&self.name(), error);
        }

        self.running.store(false, Ordering::SeqCst);
        self.core.call_next(request).await;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PassThroughStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassThroughStage")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::{recording_continuation, request};
    use crate::stages::FnProcess;
    use anyhow::anyhow;

    #[tokio::test]
    async fn test_process_runs_and_continues() {
        let stage = PassThroughStage::new(Arc::new(FnProcess::new(|req| async move {
            req.item().add(42u32);
            Ok(())
        })));
        stage.core().set_name("Step 1. Add".into());
        let (continuation, seen) = recording_continuation();
        stage.core().set_next(continuation);

        let req = request();
        stage.invoke(req.clone()).await;

        assert_eq!(*req.item().try_latest::<u32>().unwrap(), 42);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(req.visited(), vec!["Step 1. Add"]);
        assert!(!stage.is_running());
    }

    #[tokio::test]
    async fn test_hook_error_is_recorded_and_request_continues() {
        let stage = PassThroughStage::new(Arc::new(FnProcess::new(|_req| async move {
            Err(anyhow!("exploded"))
        })));
        stage.core().set_name("Step 1. Boom".into());
        let (continuation, seen) = recording_continuation();
        stage.core().set_next(continuation);

        let req = request();
        stage.invoke(req.clone()).await;

        let errors = req.item().errors();
        assert_eq!(errors["Step 1. Boom"][0].to_string(), "exploded");
        // Continue-on-failure: the item still reached the next stage.
        assert_eq!(seen.lock().len(), 1);
    }
}
