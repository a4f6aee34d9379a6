//! Cross-run live-reload state
//!
//! One [`ReloadContext`] exists per logical application instance and is
//! threaded into every augmentation run of that instance as part of the
//! [`LiveReload`] initial item. Steps use it to cache state between
//! incremental rebuilds; a fresh application instance always starts with an
//! empty context.

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::item::BuildItem;

/// A mutable map surviving across successive augmentation runs, keyed by an
/// opaque type token.
#[derive(Default)]
pub struct ReloadContext {
    entries: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ReloadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a previously cached entry. The first run of an application
    /// never has prior entries; callers must treat absence as normal.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.lock().get(&TypeId::of::<T>()).map(|value| {
            Arc::clone(value)
                .downcast::<T>()
                .unwrap_or_else(|_| unreachable!("entries are keyed by TypeId"))
        })
    }

    pub fn put<T: Any + Send + Sync>(&self, value: T) {
        self.lock().insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.lock().remove(&TypeId::of::<T>()).map(|value| {
            value
                .downcast::<T>()
                .unwrap_or_else(|_| unreachable!("entries are keyed by TypeId"))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TypeId, Arc<dyn Any + Send + Sync>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Initial build item describing the nature of the current run.
///
/// A first run carries `is_reload == false` and an empty changed set; every
/// subsequent run of the same application carries the reload flag, the
/// changed resource identifiers, and the same context instance.
#[derive(Clone)]
pub struct LiveReload {
    is_reload: bool,
    changed_resources: BTreeSet<String>,
    context: Arc<ReloadContext>,
}

impl BuildItem for LiveReload {}

impl LiveReload {
    pub fn first_run(context: Arc<ReloadContext>) -> Self {
        Self {
            is_reload: false,
            changed_resources: BTreeSet::new(),
            context,
        }
    }

    pub fn reload(context: Arc<ReloadContext>, changed_resources: BTreeSet<String>) -> Self {
        Self {
            is_reload: true,
            changed_resources,
            context,
        }
    }

    pub fn is_reload(&self) -> bool {
        self.is_reload
    }

    pub fn changed_resources(&self) -> &BTreeSet<String> {
        &self.changed_resources
    }

    pub fn context(&self) -> &Arc<ReloadContext> {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScanCache(Vec<String>);

    #[test]
    fn test_entries_survive_across_runs_of_one_instance() {
        let context = Arc::new(ReloadContext::new());

        let first = LiveReload::first_run(Arc::clone(&context));
        assert!(!first.is_reload());
        assert!(first.context().get::<ScanCache>().is_none());
        first.context().put(ScanCache(vec!["a".into()]));

        let second = LiveReload::reload(
            Arc::clone(&context),
            BTreeSet::from(["src/a.rs".to_string()]),
        );
        assert!(second.is_reload());
        assert_eq!(second.changed_resources().len(), 1);
        let cached = second.context().get::<ScanCache>().unwrap();
        assert_eq!(cached.0, vec!["a".to_string()]);

        // same instance identity across runs
        assert!(Arc::ptr_eq(first.context(), second.context()));
    }

    #[test]
    fn test_fresh_instance_starts_empty() {
        let context = Arc::new(ReloadContext::new());
        context.put(ScanCache(vec!["stale".into()]));

        let other = Arc::new(ReloadContext::new());
        assert!(other.get::<ScanCache>().is_none());
        assert!(!Arc::ptr_eq(&context, &other));
    }

    #[test]
    fn test_remove_clears_an_entry() {
        let context = ReloadContext::new();
        context.put(ScanCache(Vec::new()));
        assert!(context.remove::<ScanCache>().is_some());
        assert!(context.is_empty());
    }
}
