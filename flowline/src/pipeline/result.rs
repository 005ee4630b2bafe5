//! Push/pull bridge between the pipeline's sink and its consumer.

use crate::cancellation::CancellationToken;
use crate::context::Context;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ResultState {
    queue: Mutex<VecDeque<Arc<Context>>>,
    running: AtomicBool,
    token: CancellationToken,
    poll_interval: Duration,
}

/// Creates a connected sink/stream pair.
pub(crate) fn channel(
    token: CancellationToken,
    poll_interval: Duration,
) -> (ResultSink, ResultStream) {
    let state = Arc::new(ResultState {
        queue: Mutex::new(VecDeque::new()),
        running: AtomicBool::new(false),
        token,
        poll_interval,
    });
    (
        ResultSink {
            state: state.clone(),
        },
        ResultStream { state },
    )
}

/// The producer half: stages push completed item contexts here.
/// Thread-safe; cloned freely into terminal continuations.
#[derive(Clone)]
pub(crate) struct ResultSink {
    state: Arc<ResultState>,
}

impl ResultSink {
    pub(crate) fn start(&self) {
        self.state.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn push(&self, item: Arc<Context>) {
        self.state.queue.lock().push_back(item);
    }

    pub(crate) fn dispose(&self) {
        self.state.queue.lock().clear();
    }
}

/// The consumer half of the pipeline's output: an asynchronous sequence
/// of item contexts, in completion order.
///
/// Expected to have a single consumer. The sequence ends once the
/// pipeline has stopped and every remaining item has been drained; it
/// is not restartable after that.
pub struct ResultStream {
    state: Arc<ResultState>,
}

impl ResultStream {
    /// Produces the next item.
    ///
    /// Decision table, polled cooperatively:
    /// - queue non-empty: dequeue and yield immediately, regardless of
    ///   the running flag (remaining items drain even after stop);
    /// - not running and queue empty: the sequence ends;
    /// - running and queue empty: sleep one interval and retry until an
    ///   item appears or running flips off.
    pub async fn next(&mut self) -> Option<Arc<Context>> {
        loop {
            if let Some(item) = self.state.queue.lock().pop_front() {
                return Some(item);
            }
            if !self.state.running.load(Ordering::SeqCst) {
                return None;
            }
            if !self.state.token.pause(self.state.poll_interval).await {
                return None;
            }
        }
    }

    /// Drains the remainder of the sequence into a vector.
    pub async fn collect(mut self) -> Vec<Arc<Context>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }

    /// Adapts the sequence to a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Arc<Context>> {
        futures::stream::unfold(self, |mut results| async move {
            results.next().await.map(|item| (item, results))
        })
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("queued", &self.state.queue.lock().len())
            .field("running", &self.state.running.load(Ordering::SeqCst))
            .finish()
    }
}
