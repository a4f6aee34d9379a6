//! Augmentation runs
//!
//! The [`Augmentor`] is the top-level facade: it owns the registered steps,
//! the loader manager, the shared worker pool, and the cross-run reload
//! context, and turns one augmentation run into a ready-to-start
//! [`StartupAction`]. Well-known item types connect steps to the runtime
//! side: steps emit [`GeneratedResource`]s and [`TransformedResource`]s that
//! become the installed generation's content, and exactly one step provides
//! the [`EntryPointItem`].

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::app::{
    ApplicationEntryPoint, LaunchMode, RetargetPolicy, ShutdownContext, StartupAction, WorkerPool,
};
use crate::chain::{ChainBuildError, ChainBuilder};
use crate::exec::{BuildResult, ExecutionBuilder, ExecutionError};
use crate::item::{BuildItem, ItemKind};
use crate::loader::{ClassPathMode, GeneratedArtifacts, LoaderError, LoaderManager};
use crate::reload::{LiveReload, ReloadContext};
use crate::step::StepBuilder;

/// A resource emitted by a step for the next runtime generation.
pub struct GeneratedResource {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Application resources shadow framework ones; the two sets may not
    /// both define the same name.
    pub application: bool,
}

impl BuildItem for GeneratedResource {
    const KIND: ItemKind = ItemKind::Multi;
}

impl GeneratedResource {
    pub fn application(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            application: true,
        }
    }

    pub fn framework(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            application: false,
        }
    }
}

/// A rewritten form of an existing resource. Takes precedence over both
/// generated sets at lookup time.
pub struct TransformedResource {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl BuildItem for TransformedResource {
    const KIND: ItemKind = ItemKind::Multi;
}

/// The application entry point, produced by exactly one step per run.
pub struct EntryPointItem(pub Arc<dyn ApplicationEntryPoint>);

impl BuildItem for EntryPointItem {}

/// Initial item giving steps the run's shutdown registry.
pub struct ShutdownContextItem(pub Arc<ShutdownContext>);

impl BuildItem for ShutdownContextItem {}

/// Initial item carrying the launch mode for steps that branch on it.
pub struct LaunchModeItem(pub LaunchMode);

impl BuildItem for LaunchModeItem {}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AugmentorConfig {
    pub class_path_mode: ClassPathMode,
    pub launch_mode: LaunchMode,
    /// Skip the outer loader teardown in test mode so one augmentor can
    /// serve several runs.
    pub keep_alive: bool,
    pub worker_threads: usize,
    pub retarget: RetargetPolicy,
}

impl Default for AugmentorConfig {
    fn default() -> Self {
        Self {
            class_path_mode: ClassPathMode::Isolated,
            launch_mode: LaunchMode::Normal,
            keep_alive: false,
            worker_threads: 4,
            retarget: RetargetPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AugmentError {
    #[error(transparent)]
    Chain(#[from] ChainBuildError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("augmentation produced no application entry point")]
    MissingEntryPoint,
}

type ChainCustomizer = Box<dyn FnOnce(ChainBuilder) -> ChainBuilder + Send>;
type InitialProvider =
    Box<dyn for<'c> FnOnce(ExecutionBuilder<'c>) -> Result<ExecutionBuilder<'c>, ExecutionError> + Send>;

/// Per-run additions to the chain: extra initial values and extra final
/// declarations on top of the augmentor's registered steps.
#[derive(Default)]
pub struct AugmentRequest {
    customizers: Vec<ChainCustomizer>,
    providers: Vec<InitialProvider>,
}

impl AugmentRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an initial item and supply its value for this run.
    pub fn add_initial<T: BuildItem>(mut self, value: T) -> Self {
        self.customizers
            .push(Box::new(|builder| builder.add_initial::<T>()));
        self.providers
            .push(Box::new(move |exec| exec.provide(value)));
        self
    }

    pub fn add_final<T: BuildItem>(mut self) -> Self {
        self.customizers
            .push(Box::new(|builder| builder.add_final::<T>()));
        self
    }

    /// Arbitrary chain customization, applied after the standard
    /// declarations.
    pub fn customize_chain(
        mut self,
        f: impl FnOnce(ChainBuilder) -> ChainBuilder + Send + 'static,
    ) -> Self {
        self.customizers.push(Box::new(f));
        self
    }
}

/// One logical application's augmentation pipeline, reusable across runs.
pub struct Augmentor {
    id: Uuid,
    config: AugmentorConfig,
    steps: Vec<StepBuilder>,
    loaders: Arc<LoaderManager>,
    reload: Arc<ReloadContext>,
    worker_pool: Arc<WorkerPool>,
}

impl Augmentor {
    pub fn new(config: AugmentorConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            loaders: Arc::new(LoaderManager::new(config.class_path_mode)),
            reload: Arc::new(ReloadContext::new()),
            worker_pool: Arc::new(WorkerPool::new(config.worker_threads)),
            steps: Vec::new(),
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AugmentorConfig {
        &self.config
    }

    pub fn loaders(&self) -> &Arc<LoaderManager> {
        &self.loaders
    }

    /// The context carried into every run of this augmentor. Dropping the
    /// augmentor drops any state cached across reloads.
    pub fn reload_context(&self) -> &Arc<ReloadContext> {
        &self.reload
    }

    pub fn add_step(&mut self, step: StepBuilder) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// First augmentation run: execute the chain, install the generated
    /// artifacts as a runtime generation, and package the result for start.
    pub async fn augment(&self) -> Result<StartupAction, AugmentError> {
        let live = LiveReload::first_run(Arc::clone(&self.reload));
        self.augment_run(live).await
    }

    /// Incremental re-run after `changed_resources` changed on disk. Steps
    /// see the same [`ReloadContext`] instance as every earlier run.
    pub async fn reload(
        &self,
        changed_resources: BTreeSet<String>,
    ) -> Result<StartupAction, AugmentError> {
        let live = LiveReload::reload(Arc::clone(&self.reload), changed_resources);
        self.augment_run(live).await
    }

    /// Run the registered steps with caller-chosen initials and finals,
    /// without installing a generation. For build-only tooling that wants
    /// chain outputs rather than a runnable application.
    pub async fn run_custom(&self, request: AugmentRequest) -> Result<BuildResult, AugmentError> {
        let live = LiveReload::first_run(Arc::clone(&self.reload));
        let shutdown = Arc::new(ShutdownContext::new());
        let (result, _) = self.execute_chain(live, shutdown, request).await?;
        Ok(result)
    }

    /// Shut down the shared worker pool and close every loader. The
    /// augmentor is unusable afterwards.
    pub fn close(&self) {
        self.worker_pool.shutdown();
        self.loaders.close_all();
    }

    async fn augment_run(&self, live: LiveReload) -> Result<StartupAction, AugmentError> {
        let is_reload = live.is_reload();
        let shutdown = Arc::new(ShutdownContext::new());
        let request = AugmentRequest::new()
            .add_final::<GeneratedResource>()
            .add_final::<TransformedResource>()
            .add_final::<EntryPointItem>();
        let (result, shutdown) = self.execute_chain(live, shutdown, request).await?;

        let mut artifacts = GeneratedArtifacts::new();
        for resource in result.consume_multi::<GeneratedResource>()? {
            if resource.application {
                artifacts.add_application(resource.name.clone(), resource.bytes.clone());
            } else {
                artifacts.add_framework(resource.name.clone(), resource.bytes.clone());
            }
        }
        for transformed in result.consume_multi::<TransformedResource>()? {
            artifacts.add_transformed(transformed.name.clone(), transformed.bytes.clone());
        }
        let entry = result
            .consume_optional::<EntryPointItem>()?
            .ok_or(AugmentError::MissingEntryPoint)?;

        let installed = self.loaders.install_generation(artifacts)?;
        info!(
            augmentor = %self.id,
            is_reload,
            loader = %installed.active.name(),
            "augmentation run complete"
        );

        Ok(StartupAction::new(Arc::clone(&entry.0), installed.active)
            .with_replaced(installed.replaced)
            .with_shutdown(shutdown)
            .with_worker_pool(Arc::clone(&self.worker_pool), self.config.retarget)
            .with_launch_mode(self.config.launch_mode)
            .with_manager(Arc::clone(&self.loaders), self.config.keep_alive))
    }

    async fn execute_chain(
        &self,
        live: LiveReload,
        shutdown: Arc<ShutdownContext>,
        request: AugmentRequest,
    ) -> Result<(BuildResult, Arc<ShutdownContext>), AugmentError> {
        let mut builder = ChainBuilder::new()
            .add_initial::<LiveReload>()
            .add_initial::<ShutdownContextItem>()
            .add_initial::<LaunchModeItem>();
        for step in &self.steps {
            builder = builder.add_step(step.clone());
        }
        for customize in request.customizers {
            builder = customize(builder);
        }
        let chain = builder.build()?;
        debug!(augmentor = %self.id, steps = chain.len(), "executing augmentation chain");

        let mut execution = chain
            .execution()
            .provide(live)?
            .provide(ShutdownContextItem(Arc::clone(&shutdown)))?
            .provide(LaunchModeItem(self.config.launch_mode))?;
        for provide in request.providers {
            execution = provide(execution)?;
        }
        let result = execution.execute().await?;
        Ok((result, shutdown))
    }
}
