//! Thread-safe typed value store with a per-stage error ledger.

use crate::errors::ContextError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

type StoredValue = Arc<dyn Any + Send + Sync>;
type StoredError = Arc<anyhow::Error>;

/// A thread-safe, append-only, multi-valued store keyed by value type,
/// plus a ledger of per-stage failures.
///
/// Two contexts exist per run: one "item context" per in-flight item,
/// living for that item's journey through the chain, and one "global
/// context" shared read/write by all items and stages for the whole run.
/// Both use the same type; all operations are safe for concurrent
/// callers.
///
/// Multiple values per type are permitted and insertion order is
/// preserved; "latest" is defined by insertion order, with concurrent
/// ties broken by store order.
pub struct Context {
    id: String,
    created: DateTime<Utc>,
    updated: RwLock<DateTime<Utc>>,
    values: DashMap<TypeId, Vec<StoredValue>>,
    errors: DashMap<String, Vec<StoredError>>,
}

impl Context {
    /// Creates a new empty context with a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created: now,
            updated: RwLock::new(now),
            values: DashMap::new(),
            errors: DashMap::new(),
        }
    }

    /// Creates a context pre-loaded with a single value.
    #[must_use]
    pub fn with_value<T: Send + Sync + 'static>(value: T) -> Self {
        let ctx = Self::new();
        ctx.add(value);
        ctx
    }

    /// The opaque unique identity of this context.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When this context was created.
    #[must_use]
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// When this context was last mutated.
    #[must_use]
    pub fn updated(&self) -> DateTime<Utc> {
        *self.updated.read()
    }

    /// Appends `value`, keyed by its runtime type.
    pub fn add<T: Send + Sync + 'static>(&self, value: T) {
        self.add_shared(Arc::new(value));
    }

    /// Appends an already-shared value, keyed by its runtime type.
    ///
    /// Useful when the same instance must be visible from more than one
    /// context (e.g. mirroring an item into the global context).
    pub fn add_shared<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.values
            .entry(TypeId::of::<T>())
            .or_default()
            .push(value);
        self.touch();
    }

    /// Appends a value that may be absent.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AbsentValue`] when `value` is `None`; an
    /// absent value can never enter the store.
    pub fn try_add<T: Send + Sync + 'static>(&self, value: Option<T>) -> Result<(), ContextError> {
        match value {
            Some(v) => {
                self.add(v);
                Ok(())
            }
            None => Err(ContextError::AbsentValue),
        }
    }

    /// Returns all values of type `T` in insertion order (empty if none).
    #[must_use]
    pub fn get_all<T: Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .map(|entry| {
                entry
                    .iter()
                    .filter_map(|v| v.clone().downcast::<T>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the most recently added value of type `T`, if any.
    #[must_use]
    pub fn try_latest<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.iter().rev().find_map(|v| v.clone().downcast::<T>().ok()))
    }

    /// Returns the most recently added value of type `T`, or its default.
    #[must_use]
    pub fn latest_or_default<T: Default + Send + Sync + 'static>(&self) -> Arc<T> {
        self.try_latest::<T>()
            .unwrap_or_else(|| Arc::new(T::default()))
    }

    /// Records a failure raised by the named stage while processing this
    /// context's item.
    ///
    /// The ledger preserves per-stage recording order. Recording never
    /// fails and never aborts the run; callers continue to the next
    /// stage afterward.
    pub fn add_error(&self, stage_name: &str, error: anyhow::Error) {
        warn!(stage = stage_name, error = %error, "stage error recorded");
        self.errors
            .entry(stage_name.to_string())
            .or_default()
            .push(Arc::new(error));
        self.touch();
    }

    /// Read-only snapshot of the error ledger, mapping stage name to its
    /// ordered failure list.
    #[must_use]
    pub fn errors(&self) -> HashMap<String, Vec<StoredError>> {
        self.errors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Total number of recorded failures across all stages.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.iter().map(|entry| entry.value().len()).sum()
    }

    /// True if any stage recorded a failure for this context.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Diagnostic JSON snapshot of the ledger: stage name to the display
    /// strings of its failures, in recording order.
    #[must_use]
    pub fn error_summary(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .errors
            .iter()
            .map(|entry| {
                let messages: Vec<serde_json::Value> = entry
                    .value()
                    .iter()
                    .map(|e| serde_json::Value::String(e.to_string()))
                    .collect();
                (entry.key().clone(), serde_json::Value::Array(messages))
            })
            .collect();
        serde_json::Value::Object(map)
    }

    fn touch(&self) {
        *self.updated.write() = Utc::now();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("types", &self.values.len())
            .field("errors", &self.error_count())
            .finish()
    }
}
