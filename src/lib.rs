//! reforge - build-time application augmentation engine
//!
//! This library runs an application's build-time augmentation: a set of
//! build steps, wired into a dependency graph by the items they produce and
//! consume, executes concurrently and emits the resources of the next
//! runtime generation. The generation is installed behind an isolation
//! boundary and started as a hosted application; on a code change the whole
//! cycle repeats against the same live-reload context.
//!
//! # Core Concepts
//!
//! - **Build items**: Typed values exchanged between steps. Single-valued,
//!   multi-valued, or valueless markers; the item type is the contract.
//! - **Build steps**: Units of work declaring what they consume and
//!   produce. Steps never name each other; the chain builder derives the
//!   execution order from the declarations alone.
//! - **Generations**: Each augmentation run installs its output as a fresh
//!   runtime loader generation (or resets a shared one, on a flat
//!   classpath) without ever tearing the previous application down first.
//!
//! # Example Usage
//!
//! ```ignore
//! use reforge::{Augmentor, AugmentorConfig, EntryPointItem, StepBuilder};
//!
//! let mut augmentor = Augmentor::new(AugmentorConfig::default());
//! augmentor.add_step(
//!     StepBuilder::from_fn("entry_point", |cx| async move {
//!         cx.produce(EntryPointItem(my_entry_point()))?;
//!         Ok(())
//!     })
//!     .produces::<EntryPointItem>(),
//! );
//!
//! let action = augmentor.augment().await?;
//! let app = action.start()?;
//! // ... later
//! app.stop();
//! ```
//!
//! # Project Structure
//!
//! - [`item`]: typed build-item identities
//! - [`step`]: the step contract and declaration builder
//! - [`chain`]: graph validation and deterministic ordering
//! - [`exec`]: the concurrent execution engine
//! - [`loader`]: runtime loader generations and their lifecycle
//! - [`app`]: application start/stop orchestration
//! - [`reload`]: state carried across live-reload runs
//! - [`augment`]: the top-level facade tying the above together

pub mod app;
pub mod augment;
pub mod chain;
pub mod exec;
pub mod item;
pub mod loader;
pub mod reload;
pub mod step;
pub mod util;

// Re-export key types for convenient access
pub use app::{
    ApplicationEntryPoint, AppState, LaunchMode, RetargetOutcome, RetargetPolicy, RunningApp,
    RuntimeContext, ShutdownContext, StartupAction, StartupError, WorkerPool,
};
pub use augment::{
    AugmentError, AugmentRequest, Augmentor, AugmentorConfig, EntryPointItem, GeneratedResource,
    LaunchModeItem, ShutdownContextItem, TransformedResource,
};
pub use chain::{BuildChain, ChainBuildError, ChainBuilder};
pub use exec::{BuildResult, ExecutionError, StepContext};
pub use item::{BuildItem, ItemId, ItemKind};
pub use loader::{ClassPathMode, GeneratedArtifacts, LoaderError, LoaderManager, RuntimeLoader};
pub use reload::{LiveReload, ReloadContext};
pub use step::{BuildStep, StepBuilder};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
