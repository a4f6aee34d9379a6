//! Generation-scoped runtime resource loaders
//!
//! A [`RuntimeLoader`] holds one generation of generated artifacts as an
//! in-memory map from resource name to bytes, chained to an optional parent
//! for base/library resources. The backing maps live behind a single swapped
//! snapshot, so a reader racing a reset observes entirely the old generation
//! or entirely the new one, never a mix.

mod manager;

pub use manager::{ClassPathMode, InstalledGeneration, LoaderManager};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("resource `{name}` was generated as both an application and a framework resource")]
    ResourceConflict { name: String },

    #[error("loader `{name}` is closed")]
    Closed { name: String },
}

/// The generated artifacts of one augmentation run.
///
/// Application resources (the user's own recompiled code) and framework
/// resources (generated glue) are tracked separately: dev mode evicts and
/// replaces application resources on change while framework resources stay
/// stable. Transformed resources shadow both.
#[derive(Debug, Default, Clone)]
pub struct GeneratedArtifacts {
    transformed: HashMap<String, Vec<u8>>,
    application: HashMap<String, Vec<u8>>,
    framework: HashMap<String, Vec<u8>>,
}

impl GeneratedArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transformed(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.transformed.insert(name.into(), bytes);
    }

    pub fn add_application(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.application.insert(name.into(), bytes);
    }

    pub fn add_framework(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.framework.insert(name.into(), bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.transformed.is_empty() && self.application.is_empty() && self.framework.is_empty()
    }

    /// Build the loader snapshot, rejecting names generated as both an
    /// application and a framework resource. The snapshot is fully
    /// constructed before any loader is touched, so a conflict leaves the
    /// previously active generation intact.
    pub(crate) fn into_snapshot(self) -> Result<LoaderSnapshot, LoaderError> {
        for name in self.application.keys() {
            if self.framework.contains_key(name) {
                return Err(LoaderError::ResourceConflict { name: name.clone() });
            }
        }
        let intern = |map: HashMap<String, Vec<u8>>| {
            map.into_iter()
                .map(|(k, v)| (k, Arc::<[u8]>::from(v)))
                .collect()
        };
        Ok(LoaderSnapshot {
            transformed: intern(self.transformed),
            application: intern(self.application),
            framework: intern(self.framework),
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct LoaderSnapshot {
    transformed: HashMap<String, Arc<[u8]>>,
    application: HashMap<String, Arc<[u8]>>,
    framework: HashMap<String, Arc<[u8]>>,
}

impl LoaderSnapshot {
    fn lookup(&self, name: &str) -> Option<Arc<[u8]>> {
        self.transformed
            .get(name)
            .or_else(|| self.application.get(name))
            .or_else(|| self.framework.get(name))
            .cloned()
    }
}

/// One generation of runtime resources, chained to an optional parent.
pub struct RuntimeLoader {
    name: String,
    generation: u64,
    parent: Option<Arc<RuntimeLoader>>,
    snapshot: RwLock<Arc<LoaderSnapshot>>,
    closed: AtomicBool,
}

impl RuntimeLoader {
    pub(crate) fn new(
        name: impl Into<String>,
        generation: u64,
        parent: Option<Arc<RuntimeLoader>>,
        snapshot: LoaderSnapshot,
    ) -> Self {
        Self {
            name: name.into(),
            generation,
            parent,
            snapshot: RwLock::new(Arc::new(snapshot)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolve a resource by name: transformed, then application, then
    /// framework resources, then the parent chain.
    pub fn resource(&self, name: &str) -> Result<Option<Arc<[u8]>>, LoaderError> {
        if self.is_closed() {
            return Err(LoaderError::Closed {
                name: self.name.clone(),
            });
        }
        let snapshot = self.read_snapshot();
        if let Some(bytes) = snapshot.lookup(name) {
            return Ok(Some(bytes));
        }
        match &self.parent {
            Some(parent) => parent.resource(name),
            None => Ok(None),
        }
    }

    /// Whether `name` is an application resource of this generation (the
    /// parent chain is not consulted).
    pub fn is_application_resource(&self, name: &str) -> bool {
        self.read_snapshot().application.contains_key(name)
    }

    /// Names of the application resources of this generation, sorted.
    pub fn application_resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_snapshot().application.keys().cloned().collect();
        names.sort();
        names
    }

    /// Atomically replace this generation's backing maps. In-flight lookups
    /// see either the old snapshot or the new one.
    pub(crate) fn reset(&self, snapshot: LoaderSnapshot) -> Result<(), LoaderError> {
        if self.is_closed() {
            return Err(LoaderError::Closed {
                name: self.name.clone(),
            });
        }
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(snapshot);
        debug!(loader = %self.name, generation = self.generation, "loader reset");
        Ok(())
    }

    /// Mark this loader closed. Lookups fail afterwards; idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(loader = %self.name, generation = self.generation, "loader closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn read_snapshot(&self) -> Arc<LoaderSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for RuntimeLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeLoader")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifacts(app: &[(&str, &[u8])], fw: &[(&str, &[u8])]) -> GeneratedArtifacts {
        let mut artifacts = GeneratedArtifacts::new();
        for (name, bytes) in app {
            artifacts.add_application(*name, bytes.to_vec());
        }
        for (name, bytes) in fw {
            artifacts.add_framework(*name, bytes.to_vec());
        }
        artifacts
    }

    #[test]
    fn test_lookup_prefers_transformed_over_generated() {
        let mut a = artifacts(&[("com/app/Main.class", b"app")], &[]);
        a.add_transformed("com/app/Main.class", b"transformed".to_vec());
        let loader = RuntimeLoader::new("runtime", 1, None, a.into_snapshot().unwrap());
        let bytes = loader.resource("com/app/Main.class").unwrap().unwrap();
        assert_eq!(&bytes[..], b"transformed");
    }

    #[test]
    fn test_lookup_falls_back_to_parent() {
        let base = Arc::new(RuntimeLoader::new(
            "base",
            0,
            None,
            artifacts(&[], &[("lib/Util.class", b"lib")])
                .into_snapshot()
                .unwrap(),
        ));
        let child = RuntimeLoader::new(
            "runtime",
            1,
            Some(base),
            GeneratedArtifacts::new().into_snapshot().unwrap(),
        );
        assert!(child.resource("lib/Util.class").unwrap().is_some());
        assert!(child.resource("missing").unwrap().is_none());
    }

    #[test]
    fn test_application_and_framework_conflict_is_rejected() {
        let a = artifacts(&[("Dup.class", b"a")], &[("Dup.class", b"f")]);
        let err = a.into_snapshot().unwrap_err();
        assert!(matches!(err, LoaderError::ResourceConflict { .. }));
    }

    #[test]
    fn test_closed_loader_rejects_lookups() {
        let loader = RuntimeLoader::new(
            "runtime",
            1,
            None,
            GeneratedArtifacts::new().into_snapshot().unwrap(),
        );
        loader.close();
        assert!(matches!(
            loader.resource("anything").unwrap_err(),
            LoaderError::Closed { .. }
        ));
    }

    #[test]
    fn test_reset_swaps_the_whole_snapshot() {
        let loader = Arc::new(RuntimeLoader::new(
            "shared",
            1,
            None,
            artifacts(&[("a", b"1"), ("b", b"1")], &[]).into_snapshot().unwrap(),
        ));
        loader
            .reset(artifacts(&[("a", b"2")], &[]).into_snapshot().unwrap())
            .unwrap();
        assert_eq!(&loader.resource("a").unwrap().unwrap()[..], b"2");
        // "b" belonged to the old generation only
        assert!(loader.resource("b").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_readers_never_see_a_mixed_generation() {
        let loader = Arc::new(RuntimeLoader::new(
            "shared",
            1,
            None,
            artifacts(&[("x", b"old"), ("y", b"old")], &[])
                .into_snapshot()
                .unwrap(),
        ));

        let reader = {
            let loader = Arc::clone(&loader);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let x = loader.resource("x").unwrap().unwrap();
                    let y = loader.resource("y").unwrap();
                    // each lookup sees one whole snapshot; once x reads as
                    // the new generation, y cannot still resolve to the old
                    // one on a later lookup
                    if &x[..] == b"new" {
                        assert!(y.is_none(), "mixed generation observed");
                    } else if let Some(y) = y {
                        assert_eq!(&y[..], b"old");
                    }
                }
            })
        };

        loader
            .reset(artifacts(&[("x", b"new")], &[]).into_snapshot().unwrap())
            .unwrap();
        reader.join().unwrap();
    }
}
