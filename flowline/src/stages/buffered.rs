//! Queued stage with bounded concurrency and backpressure.

use crate::context::ExecutionRequest;
use crate::pipeline::PipelineOptions;
use crate::stages::{Process, Stage, StageCore, StageKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Queue and flow-control state shared with the background worker.
struct BufferedInner {
    queue: Mutex<VecDeque<Arc<ExecutionRequest>>>,
    concurrency: Arc<Semaphore>,
    /// Producers currently suspended in, or passing through, `invoke`.
    adding: AtomicUsize,
    draining: AtomicBool,
    disposed: AtomicBool,
    options: PipelineOptions,
}

/// A stage that enqueues incoming requests and processes them from a
/// background worker loop with bounded concurrency.
///
/// `invoke` applies backpressure: once the queue holds
/// `max_queue_depth` requests the producer suspends (cooperative
/// polling) until a slot frees. The worker loop acquires one semaphore
/// permit per request and spawns an independent task that runs the
/// [`Process`] hook, forwards the request to the next stage, and then
/// releases the permit - so at most `max_concurrency` hook calls are
/// ever in flight.
///
/// A source is exactly this stage positioned as a chain entry point.
pub struct BufferedStage {
    core: StageCore,
    hook: Arc<dyn Process>,
    inner: Arc<BufferedInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedStage {
    /// Creates a buffered stage around a processing hook.
    #[must_use]
    pub fn new(hook: Arc<dyn Process>, options: PipelineOptions) -> Self {
        Self {
            core: StageCore::new(),
            hook,
            inner: Arc::new(BufferedInner {
                queue: Mutex::new(VecDeque::new()),
                concurrency: Arc::new(Semaphore::new(options.max_concurrency)),
                adding: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                options,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Number of requests waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let hook = self.hook.clone();
        let next = self.core.next();
        let name = self.core.name();
        let token = self.core.token();

        tokio::spawn(async move {
            let interval = inner.options.poll_interval();
            loop {
                if token.is_cancelled() || inner.disposed.load(Ordering::SeqCst) {
                    break;
                }

                if inner.queue.lock().is_empty() {
                    if inner.draining.load(Ordering::SeqCst)
                        && inner.adding.load(Ordering::SeqCst) == 0
                    {
                        break;
                    }
                    if !token.pause(interval).await {
                        break;
                    }
                    continue;
                }

                let permit = tokio::select! {
                    permit = inner.concurrency.clone().acquire_owned() => permit,
                    () = token.cancelled() => break,
                };
                let Ok(permit) = permit else { break };

                let Some(request) = inner.queue.lock().pop_front() else {
                    continue;
                };

                let hook = hook.clone();
                let next = next.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(error) = hook.process(request.clone()).await {
                        request.item().add_error(&name, error);
                    }
                    if let Some(next) = next {
                        next(request).await;
                    }
                    drop(permit);
                });
            }
            trace!(stage = %name, "worker loop exited");
        })
    }
}

#[async_trait]
impl Stage for BufferedStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn kind(&self) -> StageKind {
        StageKind::Buffered
    }

    /// Enqueues the request, suspending while the queue is at capacity.
    async fn invoke(&self, request: Arc<ExecutionRequest>) {
        let inner = &self.inner;
        let token = self.core.token();
        let interval = inner.options.poll_interval();

        inner.adding.fetch_add(1, Ordering::SeqCst);
        loop {
            {
                let mut queue = inner.queue.lock();
                if queue.len() < inner.options.max_queue_depth {
                    request.record_visit(&self.name());
                    queue.push_back(request);
                    break;
                }
            }
            if !token.pause(interval).await {
                // Cancelled while waiting for space; drop the request.
                break;
            }
        }
        inner.adding.fetch_sub(1, Ordering::SeqCst);
    }

    async fn start(&self) {
        debug!(stage = %self.name(), "starting buffered worker");
        *self.worker.lock() = Some(self.spawn_worker());
    }

    fn is_running(&self) -> bool {
        let inner = &self.inner;
        inner.adding.load(Ordering::SeqCst) > 0
            || !inner.queue.lock().is_empty()
            || inner.concurrency.available_permits() < inner.options.max_concurrency
    }

    fn supports_finalize(&self) -> bool {
        true
    }

    /// Marks the stage draining and waits until the queue is empty and
    /// all in-flight work has released its permit.
    async fn finalize(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        let token = self.core.token();
        let interval = self.inner.options.poll_interval();
        while self.is_running() {
            if !token.pause(interval).await {
                return;
            }
        }
    }

    async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.inner.queue.lock().clear();
    }
}

impl std::fmt::Debug for BufferedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedStage")
            .field("name", &self.name())
            .field("queued", &self.queue_len())
            .finish()
    }
}
