//! The orchestrator that drives a built stage chain.

use crate::cancellation::CancellationToken;
use crate::context::{Context, ExecutionRequest};
use crate::errors::PipelineError;
use crate::pipeline::result::{ResultSink, ResultStream};
use crate::pipeline::PipelineOptions;
use crate::services::ServiceRegistry;
use crate::stages::Stage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Built but not yet started.
    Created,
    /// Accepting and processing input.
    Running,
    /// No more input; draining in-flight work.
    Finalizing,
    /// Fully drained; the result stream has been closed.
    Stopped,
}

impl RunState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Finalizing,
            3 => Self::Stopped,
            _ => Self::Created,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Finalizing => 2,
            Self::Stopped => 3,
        }
    }
}

pub(crate) struct PipelineInner {
    state: AtomicU8,
    finalize_requested: AtomicBool,
    global: Arc<Context>,
    sources: Vec<Arc<dyn Stage>>,
    stages: Vec<Arc<dyn Stage>>,
    services: ServiceRegistry,
    options: PipelineOptions,
    token: CancellationToken,
    sink: ResultSink,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineInner {
    fn run_state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn cancelled_error(&self) -> PipelineError {
        PipelineError::Cancelled(self.token.reason().unwrap_or_else(|| "cancelled".to_string()))
    }

    /// Feeds an already-built request into the head of the chain.
    pub(crate) async fn add_input_request(
        self: &Arc<Self>,
        request: Arc<ExecutionRequest>,
    ) -> Result<Arc<ExecutionRequest>, PipelineError> {
        match self.run_state() {
            RunState::Created | RunState::Stopped => return Err(PipelineError::NotRunning),
            RunState::Running | RunState::Finalizing => {}
        }
        if self.finalize_requested.load(Ordering::SeqCst) {
            return Err(PipelineError::AlreadyFinalized);
        }

        if let Some(source) = self.sources.first() {
            source.invoke(request.clone()).await;
        } else if let Some(first) = self.stages.first() {
            first.invoke(request.clone()).await;
        }
        Ok(request)
    }

    pub(crate) async fn add_input(
        self: &Arc<Self>,
        item: Arc<Context>,
    ) -> Result<Arc<ExecutionRequest>, PipelineError> {
        let request = Arc::new(ExecutionRequest::new(
            self.global.clone(),
            item,
            self.services.scope(),
        ));
        self.add_input_request(request).await
    }

    pub(crate) async fn add_input_value<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        input: T,
    ) -> Result<Arc<ExecutionRequest>, PipelineError> {
        self.add_input(Arc::new(Context::with_value(input))).await
    }

    /// Waits for the finalize signal, then for every source and stage to
    /// quiesce, then closes the result stream.
    async fn monitor_loop(&self) {
        let interval = self.options.poll_interval();
        'drain: {
            while self.run_state() != RunState::Finalizing {
                if !self.token.pause(interval).await {
                    break 'drain;
                }
            }
            while self.sources.iter().any(|s| s.is_running()) {
                if !self.token.pause(interval).await {
                    break 'drain;
                }
            }
            while self.stages.iter().any(|s| s.is_running()) {
                if !self.token.pause(interval).await {
                    break 'drain;
                }
            }
        }
        self.sink.stop();
        self.state.store(RunState::Stopped.as_u8(), Ordering::SeqCst);
        debug!("pipeline stopped");
    }
}

/// A built pipeline: the ordered stage chain, its sources, the shared
/// global context, and the run lifecycle.
///
/// State machine: `Created -> Running -> Finalizing -> Stopped`, driven
/// by [`Pipeline::start`] and [`Pipeline::finalize`]. Cloning is cheap;
/// clones drive the same run.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
    consumer: Arc<Mutex<Option<ResultStream>>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        global: Arc<Context>,
        sources: Vec<Arc<dyn Stage>>,
        stages: Vec<Arc<dyn Stage>>,
        services: ServiceRegistry,
        options: PipelineOptions,
        token: CancellationToken,
        sink: ResultSink,
        results: ResultStream,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                state: AtomicU8::new(RunState::Created.as_u8()),
                finalize_requested: AtomicBool::new(false),
                global,
                sources,
                stages,
                services,
                options,
                token,
                sink,
                monitor: Mutex::new(None),
            }),
            consumer: Arc::new(Mutex::new(Some(results))),
        }
    }

    /// The lifecycle state of this run.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.inner.run_state()
    }

    /// True from `start()` until the monitor observes a full drain.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state(), RunState::Running | RunState::Finalizing)
    }

    /// The global context shared between all requests of this run.
    #[must_use]
    pub fn global_context(&self) -> Arc<Context> {
        self.inner.global.clone()
    }

    /// The run-wide cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Starts the run: opens the result stream, starts every stage in
    /// declared order, then every source, then spawns the monitor task.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyRunning`] unless the pipeline is
    /// freshly built; a pipeline is never restartable.
    pub async fn start(&self) -> Result<(), PipelineError> {
        self.inner
            .state
            .compare_exchange(
                RunState::Created.as_u8(),
                RunState::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| PipelineError::AlreadyRunning)?;

        info!(
            sources = self.inner.sources.len(),
            stages = self.inner.stages.len(),
            "pipeline starting"
        );
        self.inner.sink.start();

        for stage in &self.inner.stages {
            stage.start().await;
        }
        for source in &self.inner.sources {
            source.start().await;
        }

        let inner = self.inner.clone();
        *self.inner.monitor.lock() = Some(tokio::spawn(async move {
            inner.monitor_loop().await;
        }));
        Ok(())
    }

    /// Submits one item context into the head of the chain.
    ///
    /// With no buffered stages in the chain the whole execution happens
    /// inline and the returned request is complete when this resolves.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotRunning`] before `start()`;
    /// [`PipelineError::AlreadyFinalized`] once `finalize()` has been
    /// called.
    pub async fn add_input(
        &self,
        item: Arc<Context>,
    ) -> Result<Arc<ExecutionRequest>, PipelineError> {
        self.inner.add_input(item).await
    }

    /// Wraps `input` in a fresh item context and submits it.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::add_input`].
    pub async fn add_input_value<T: Send + Sync + 'static>(
        &self,
        input: T,
    ) -> Result<Arc<ExecutionRequest>, PipelineError> {
        self.inner.add_input_value(input).await
    }

    /// Signals that no further input will arrive and drains the chain:
    /// waits for every non-finalizable source and stage to quiesce, then
    /// finalizes each finalizable one in declared order, so upstream
    /// drains complete before downstream ones begin.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotRunning`] before `start()`;
    /// [`PipelineError::AlreadyFinalized`] on a second call;
    /// [`PipelineError::Cancelled`] if the token fires mid-drain.
    pub async fn finalize(&self) -> Result<(), PipelineError> {
        if self.state() == RunState::Created {
            return Err(PipelineError::NotRunning);
        }
        if self.inner.finalize_requested.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyFinalized);
        }

        debug!("pipeline finalizing");
        let interval = self.inner.options.poll_interval();
        let token = &self.inner.token;

        while self
            .inner
            .sources
            .iter()
            .any(|s| !s.supports_finalize() && s.is_running())
        {
            if !token.pause(interval).await {
                return Err(self.inner.cancelled_error());
            }
        }
        for source in self.inner.sources.iter().filter(|s| s.supports_finalize()) {
            source.finalize().await;
        }

        for stage in &self.inner.stages {
            if stage.supports_finalize() {
                stage.finalize().await;
            } else {
                while stage.is_running() {
                    if !token.pause(interval).await {
                        return Err(self.inner.cancelled_error());
                    }
                }
            }
        }

        self.inner
            .state
            .store(RunState::Finalizing.as_u8(), Ordering::SeqCst);
        Ok(())
    }

    /// Suspends until the run reaches `Stopped`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Cancelled`] if the token fires first.
    pub async fn wait(&self) -> Result<(), PipelineError> {
        let interval = self.inner.options.poll_interval();
        while self.state() != RunState::Stopped {
            if !self.inner.token.pause(interval).await {
                return Err(self.inner.cancelled_error());
            }
        }
        Ok(())
    }

    /// Takes the pull side of the result stream.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ResultsConsumed`] on a second take; the output
    /// sequence has a single consumer.
    pub fn results(&self) -> Result<ResultStream, PipelineError> {
        self.consumer
            .lock()
            .take()
            .ok_or(PipelineError::ResultsConsumed)
    }

    /// Runs one item through the pipeline end to end: start, submit,
    /// finalize, and return the first result (if the item survived its
    /// filters).
    ///
    /// # Errors
    ///
    /// Any lifecycle error from the composed calls.
    pub async fn invoke<T: Send + Sync + 'static>(
        &self,
        input: T,
    ) -> Result<Option<Arc<Context>>, PipelineError> {
        self.start().await?;
        self.add_input_value(input).await?;
        self.finalize().await?;
        let mut results = self.results()?;
        Ok(results.next().await)
    }

    /// Runs many items through the pipeline with bounded submission
    /// concurrency and collects every result. `max_concurrency` defaults
    /// to the host's available parallelism.
    ///
    /// # Errors
    ///
    /// Any lifecycle error from the composed calls.
    pub async fn invoke_many_sync<T, I>(
        &self,
        inputs: I,
        max_concurrency: Option<usize>,
    ) -> Result<Vec<Arc<Context>>, PipelineError>
    where
        T: Send + Sync + 'static,
        I: IntoIterator<Item = T>,
    {
        self.start().await?;

        let max = max_concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
        });
        let submissions = Arc::new(tokio::sync::Semaphore::new(max.max(1)));
        let mut tasks = tokio::task::JoinSet::new();

        for input in inputs {
            let Ok(permit) = submissions.clone().acquire_owned().await else {
                break;
            };
            let inner = self.inner.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(error) = inner.add_input_value(input).await {
                    debug!(%error, "input rejected during fan-out");
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        self.finalize().await?;
        Ok(self.results()?.collect().await)
    }

    /// Runs many items through the pipeline and yields results lazily
    /// as they arrive.
    ///
    /// # Errors
    ///
    /// Any lifecycle error from the composed calls.
    pub async fn invoke_many<T, I>(&self, inputs: I) -> Result<ResultStream, PipelineError>
    where
        T: Send + Sync + 'static,
        I: IntoIterator<Item = T>,
    {
        self.start().await?;
        for input in inputs {
            self.add_input_value(input).await?;
        }
        self.finalize().await?;
        self.results()
    }

    /// Releases the run's resources: cancels the token, waits for the
    /// monitor, disposes every source and stage, and clears any
    /// unconsumed results. Safe to call more than once.
    pub async fn dispose(&self) {
        self.inner.token.cancel("pipeline disposed");

        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        for source in &self.inner.sources {
            source.dispose().await;
        }
        for stage in &self.inner.stages {
            stage.dispose().await;
        }
        self.inner.sink.dispose();
    }

    pub(crate) fn inner(&self) -> &Arc<PipelineInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("sources", &self.inner.sources.len())
            .field("stages", &self.inner.stages.len())
            .finish()
    }
}
