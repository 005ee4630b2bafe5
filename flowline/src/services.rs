//! Typed service registration and per-request resolution scopes.
//!
//! The builder owns a [`ServiceRegistry`]; each item entering a pipeline
//! is handed a [`ServiceScope`] minted from it. Registration is by value,
//! resolution is by type. This is deliberately small: flowline does not
//! ship a dependency-injection container, only a type-map that lets
//! stages share handles (clients, configuration, test probes) without
//! threading them through every constructor.

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

type Entry = Arc<dyn Any + Send + Sync>;

/// A registry of shared values keyed by type.
///
/// Cloning is cheap; clones share the underlying registrations.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    entries: Arc<RwLock<HashMap<TypeId, Entry>>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under its type. A later registration of the
    /// same type replaces the earlier one.
    pub fn register<T: Send + Sync + 'static>(&self, value: T) {
        self.register_shared(Arc::new(value));
    }

    /// Registers an already-shared value under its type.
    pub fn register_shared<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.entries.write().insert(TypeId::of::<T>(), value);
    }

    /// Mints a resolution scope for one request, capturing the
    /// registrations visible at this moment.
    #[must_use]
    pub fn scope(&self) -> ServiceScope {
        ServiceScope {
            entries: self.entries.read().clone(),
        }
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("len", &self.entries.read().len())
            .finish()
    }
}

/// The per-request view of the registry, carried by an
/// [`crate::context::ExecutionRequest`] for the item's whole journey.
#[derive(Clone)]
pub struct ServiceScope {
    entries: HashMap<TypeId, Entry>,
}

impl ServiceScope {
    /// Resolves a value of type `T`, if one was registered.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.clone().downcast::<T>().ok())
    }
}

impl std::fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceScope")
            .field("len", &self.entries.len())
            .finish()
    }
}
