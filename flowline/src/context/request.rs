//! The per-item execution record passed between stages.

use crate::context::Context;
use crate::services::ServiceScope;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single item in flight through a pipeline.
///
/// Couples the run's global [`Context`], the item's own [`Context`], and
/// a per-item [`ServiceScope`], plus provenance: a stack of visited
/// stage names (diagnostics only, never control flow) and a completion
/// flag that transitions false to true exactly once - set either by a
/// Filter stage's negative decision or by reaching the terminal sink.
///
/// A recorded stage failure never destroys the request; it only
/// annotates the item context's error ledger.
#[derive(Debug)]
pub struct ExecutionRequest {
    global: Arc<Context>,
    item: Arc<Context>,
    services: ServiceScope,
    created: DateTime<Utc>,
    completed: AtomicBool,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    visited: Mutex<Vec<String>>,
}

impl ExecutionRequest {
    /// Creates a request for one item entering the pipeline.
    #[must_use]
    pub fn new(global: Arc<Context>, item: Arc<Context>, services: ServiceScope) -> Self {
        Self {
            global,
            item,
            services,
            created: Utc::now(),
            completed: AtomicBool::new(false),
            completed_at: RwLock::new(None),
            visited: Mutex::new(Vec::new()),
        }
    }

    /// The global context shared across all requests within the run.
    #[must_use]
    pub fn global(&self) -> &Arc<Context> {
        &self.global
    }

    /// The context of the item this request is being executed for.
    #[must_use]
    pub fn item(&self) -> &Arc<Context> {
        &self.item
    }

    /// The resolution scope minted for this request.
    #[must_use]
    pub fn services(&self) -> &ServiceScope {
        &self.services
    }

    /// When this request entered the pipeline.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created
    }

    /// When this request completed, if it has.
    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read()
    }

    /// Whether this request has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Marks the request complete. Idempotent: the flag and timestamp
    /// are set on the first call only.
    pub fn complete(&self) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.completed_at.write() = Some(Utc::now());
        }
    }

    /// Pushes a stage identifier onto the visited stack.
    pub fn record_visit(&self, stage_name: &str) {
        self.visited.lock().push(stage_name.to_string());
    }

    /// The stages this request has passed through, in visit order.
    #[must_use]
    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().clone()
    }
}
