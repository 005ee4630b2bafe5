//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications.
type CancelCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<CancelCallback>>,
    notify: Notify,
}

/// A token for cooperative, run-wide cancellation.
///
/// Cloning is cheap and all clones observe the same state. Cancellation
/// is idempotent - only the first cancellation reason is kept. Waiters
/// suspended in [`CancellationToken::pause`] or
/// [`CancellationToken::cancelled`] are woken immediately when the token
/// fires.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled when `self` is cancelled.
    ///
    /// Used to derive a sub-pipeline's token from its parent's so that
    /// cancellation propagates transitively through nested chains.
    /// Cancelling the child does not cancel the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let linked = child.clone();
        self.on_cancel(move || linked.cancel("parent cancelled"));
        child
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept. Callbacks are
    /// invoked immediately; a panicking callback is logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .state
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.state.reason.write() = Some(reason.into());
            self.state.notify.notify_waiters();

            let callbacks = self.state.callbacks.read();
            for callback in callbacks.iter() {
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback();
                })) {
                    warn!("cancellation callback panicked: {:?}", e);
                }
            }
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback();
            })) {
                warn!("cancellation callback panicked: {:?}", e);
            }
        } else {
            self.state.callbacks.write().push(Box::new(callback));
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.reason.read().clone()
    }

    /// Suspends the caller until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register the waiter before re-checking the flag so a cancel
            // landing in between cannot be missed.
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `interval`, waking early if the token fires.
    ///
    /// Returns `true` if the full interval elapsed and `false` if the
    /// sleep was cut short by cancellation (or the token was already
    /// cancelled). Every cooperative polling loop in the engine sleeps
    /// through this method.
    pub async fn pause(&self, interval: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(interval) => true,
            () = self.cancelled() => false,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
