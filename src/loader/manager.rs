//! Loader lifecycle across augmentation runs
//!
//! The manager owns the augmentation-time loader, the shared base runtime
//! loader, and the single active runtime generation. Augmentation-time code
//! never lands on the runtime side; every run installs its generated
//! artifacts either by resetting one shared loader in place (flat classpath)
//! or by creating a fresh generation chained to the base (isolated).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{GeneratedArtifacts, LoaderError, LoaderSnapshot, RuntimeLoader};

/// How runtime generations relate to the augmentation classpath.
///
/// An explicit, declared mode: flat for single-loader environments such as
/// test execution, isolated for dev-mode hot swap where old generations stay
/// loadable until closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassPathMode {
    /// One shared runtime loader, reset in place on every run.
    Flat,
    /// A fresh loader generation per run, chained to the shared base.
    Isolated,
}

/// The outcome of installing a generation: the now-active loader and the
/// generation it displaced, if any. The displaced generation stays usable
/// until whoever replaced it closes it.
pub struct InstalledGeneration {
    pub active: Arc<RuntimeLoader>,
    pub replaced: Option<Arc<RuntimeLoader>>,
}

pub struct LoaderManager {
    mode: ClassPathMode,
    base: Arc<RuntimeLoader>,
    augmentation: Arc<RuntimeLoader>,
    active: Mutex<Option<Arc<RuntimeLoader>>>,
    next_generation: AtomicU64,
}

impl LoaderManager {
    pub fn new(mode: ClassPathMode) -> Self {
        Self {
            mode,
            base: Arc::new(RuntimeLoader::new(
                "base runtime",
                0,
                None,
                LoaderSnapshot::default(),
            )),
            augmentation: Arc::new(RuntimeLoader::new(
                "augmentation",
                0,
                None,
                LoaderSnapshot::default(),
            )),
            active: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn mode(&self) -> ClassPathMode {
        self.mode
    }

    /// The shared base loader holding library resources.
    pub fn base(&self) -> Arc<RuntimeLoader> {
        Arc::clone(&self.base)
    }

    /// The augmentation-time loader. Steps run against this side; nothing in
    /// it is reachable from a runtime generation.
    pub fn augmentation(&self) -> Arc<RuntimeLoader> {
        Arc::clone(&self.augmentation)
    }

    /// The currently active runtime generation, if a run has completed.
    pub fn active(&self) -> Option<Arc<RuntimeLoader>> {
        self.lock_active().clone()
    }

    /// Seed the base loader with library resources. Intended for the outer
    /// bootstrap that curates the application's dependencies.
    pub fn seed_base(&self, resources: HashMap<String, Vec<u8>>) -> Result<(), LoaderError> {
        let mut artifacts = GeneratedArtifacts::new();
        for (name, bytes) in resources {
            artifacts.add_framework(name, bytes);
        }
        self.base.reset(artifacts.into_snapshot()?)
    }

    /// Install one run's generated artifacts as the active runtime
    /// generation. The snapshot is validated and fully built before any
    /// loader is mutated, so on error the previously active generation is
    /// untouched and still active.
    pub fn install_generation(
        &self,
        artifacts: GeneratedArtifacts,
    ) -> Result<InstalledGeneration, LoaderError> {
        let snapshot = artifacts.into_snapshot()?;
        match self.mode {
            ClassPathMode::Flat => {
                let mut active = self.lock_active();
                match active.as_ref() {
                    Some(shared) => {
                        shared.reset(snapshot)?;
                        info!(loader = %shared.name(), "flat classpath reset in place");
                        Ok(InstalledGeneration {
                            active: Arc::clone(shared),
                            replaced: None,
                        })
                    }
                    None => {
                        let shared = Arc::new(RuntimeLoader::new(
                            "flat runtime",
                            self.next_generation.fetch_add(1, Ordering::SeqCst),
                            Some(self.base()),
                            snapshot,
                        ));
                        *active = Some(Arc::clone(&shared));
                        info!(loader = %shared.name(), "flat classpath loader created");
                        Ok(InstalledGeneration {
                            active: shared,
                            replaced: None,
                        })
                    }
                }
            }
            ClassPathMode::Isolated => {
                let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                let loader = Arc::new(RuntimeLoader::new(
                    format!("runtime generation {generation}"),
                    generation,
                    Some(self.base()),
                    snapshot,
                ));
                let replaced = self.lock_active().replace(Arc::clone(&loader));
                info!(
                    loader = %loader.name(),
                    replaced = replaced.as_ref().map(|r| r.generation()),
                    "runtime generation installed"
                );
                Ok(InstalledGeneration {
                    active: loader,
                    replaced,
                })
            }
        }
    }

    /// Close every loader this manager owns. Used when tearing down the
    /// whole logical application (test mode, no reuse).
    pub fn close_all(&self) {
        if let Some(active) = self.lock_active().take() {
            active.close();
        }
        self.augmentation.close();
        self.base.close();
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Arc<RuntimeLoader>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_artifacts(pairs: &[(&str, &[u8])]) -> GeneratedArtifacts {
        let mut artifacts = GeneratedArtifacts::new();
        for (name, bytes) in pairs {
            artifacts.add_application(*name, bytes.to_vec());
        }
        artifacts
    }

    #[test]
    fn test_flat_mode_reuses_one_loader() {
        let manager = LoaderManager::new(ClassPathMode::Flat);
        let first = manager
            .install_generation(app_artifacts(&[("A", b"1")]))
            .unwrap();
        let second = manager
            .install_generation(app_artifacts(&[("A", b"2")]))
            .unwrap();
        assert!(Arc::ptr_eq(&first.active, &second.active));
        assert!(second.replaced.is_none());
        assert_eq!(&second.active.resource("A").unwrap().unwrap()[..], b"2");
    }

    #[test]
    fn test_isolated_mode_creates_fresh_generations() {
        let manager = LoaderManager::new(ClassPathMode::Isolated);
        let g1 = manager
            .install_generation(app_artifacts(&[("A", b"1")]))
            .unwrap();
        let g2 = manager
            .install_generation(app_artifacts(&[("A", b"2")]))
            .unwrap();

        assert!(!Arc::ptr_eq(&g1.active, &g2.active));
        let replaced = g2.replaced.expect("g1 should have been displaced");
        assert!(Arc::ptr_eq(&replaced, &g1.active));

        // the old generation stays loadable until explicitly closed
        assert_eq!(&g1.active.resource("A").unwrap().unwrap()[..], b"1");
        g1.active.close();
        assert!(g1.active.resource("A").is_err());

        // exactly one generation is active
        assert!(Arc::ptr_eq(&manager.active().unwrap(), &g2.active));
    }

    #[test]
    fn test_failed_install_leaves_active_generation_untouched() {
        let manager = LoaderManager::new(ClassPathMode::Isolated);
        let g1 = manager
            .install_generation(app_artifacts(&[("A", b"1")]))
            .unwrap();

        let mut conflicting = GeneratedArtifacts::new();
        conflicting.add_application("Dup", b"a".to_vec());
        conflicting.add_framework("Dup", b"f".to_vec());
        assert!(manager.install_generation(conflicting).is_err());

        let active = manager.active().unwrap();
        assert!(Arc::ptr_eq(&active, &g1.active));
        assert_eq!(&active.resource("A").unwrap().unwrap()[..], b"1");
    }

    #[test]
    fn test_generation_resources_chain_to_seeded_base() {
        let manager = LoaderManager::new(ClassPathMode::Isolated);
        manager
            .seed_base(HashMap::from([("lib/Dep".to_string(), b"lib".to_vec())]))
            .unwrap();
        let installed = manager.install_generation(app_artifacts(&[("A", b"1")])).unwrap();
        assert!(installed.active.resource("lib/Dep").unwrap().is_some());
    }
}
