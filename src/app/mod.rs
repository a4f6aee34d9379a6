//! Application lifecycle orchestration
//!
//! A [`StartupAction`] packages one installed runtime generation with the
//! application's entry point and everything needed to run it: the shutdown
//! registry, the shared worker pool, and the launch mode. Starting it hosts
//! the entry point on a dedicated thread and hands back a [`RunningApp`]
//! once the application signals readiness; stopping is idempotent and runs
//! every registered teardown task exactly once.
//!
//! The caller blocks on the start signal with no timeout: a hung startup
//! surfaces as a hung caller, never as a silent failure.

mod shutdown;
mod worker_pool;

pub use shutdown::ShutdownContext;
pub use worker_pool::{RetargetOutcome, RetargetPolicy, WorkerPool};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::loader::{LoaderManager, RuntimeLoader};

/// Resource consulted for best-effort diagnostics when startup fails.
const DIAGNOSTIC_CONFIG_RESOURCE: &str = "application.properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    Normal,
    Development,
    Test,
}

/// Lifecycle of one started application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum StartupError {
    /// The entry point terminated or failed before signalling start.
    /// `diagnostics` carries a best-effort read of the runtime configuration
    /// resource; a failure in that read lands in `diagnostics_error` and
    /// never masks the primary cause.
    #[error("application failed to start: {cause:#}")]
    Startup {
        cause: anyhow::Error,
        diagnostics: Option<String>,
        diagnostics_error: Option<String>,
    },

    /// The application signalled start and then failed.
    #[error("application crashed after start: {cause:#}")]
    Crashed { cause: anyhow::Error },
}

/// The narrow interface the runtime side implements. The orchestrator never
/// looks anything up by name across the loader boundary; steps hand an
/// implementation of this trait across instead.
pub trait ApplicationEntryPoint: Send + Sync + 'static {
    /// Host the application. Blocks for the application's lifetime and
    /// returns its exit code. Implementations must call
    /// [`RuntimeContext::notify_started`] once ready to serve.
    fn run(&self, context: RuntimeContext) -> anyhow::Result<i32>;
}

enum GateState {
    Waiting,
    Started,
    Failed,
}

struct Latch {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = self.cv.wait(open).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct AppShared {
    id: Uuid,
    loader: Arc<RuntimeLoader>,
    shutdown: Arc<ShutdownContext>,
    close_tasks: ShutdownContext,
    launch_mode: LaunchMode,
    keep_alive: bool,
    manager: Option<Arc<LoaderManager>>,
    state: Mutex<AppState>,
    state_cv: Condvar,
    gate: Mutex<GateState>,
    gate_cv: Condvar,
    app_error: Mutex<Option<anyhow::Error>>,
    stop_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    exit_code: Mutex<Option<i32>>,
    app_thread_id: Mutex<Option<ThreadId>>,
    app_join: Mutex<Option<JoinHandle<()>>>,
    retarget_outcome: Mutex<Option<RetargetOutcome>>,
    teardown_done: Latch,
}

impl AppShared {
    fn set_state(&self, next: AppState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
        self.state_cv.notify_all();
    }

    fn state(&self) -> AppState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the start gate if it is still waiting. Later calls are no-ops,
    /// so a post-start crash cannot rewrite a successful start.
    fn open_gate(&self, started: bool) {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*gate, GateState::Waiting) {
            *gate = if started {
                GateState::Started
            } else {
                GateState::Failed
            };
            self.gate_cv.notify_all();
        }
    }

    /// Block, with no timeout, until the gate opens. Returns whether the
    /// application started.
    fn wait_gate(&self) -> bool {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        while matches!(*gate, GateState::Waiting) {
            gate = self.gate_cv.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
        matches!(*gate, GateState::Started)
    }

    fn gate_started(&self) -> bool {
        matches!(
            *self.gate.lock().unwrap_or_else(PoisonError::into_inner),
            GateState::Started
        )
    }

    fn record_error(&self, error: anyhow::Error) {
        *self
            .app_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn take_error(&self) -> Option<anyhow::Error> {
        self.app_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Handle the hosted application uses to reach back across the boundary.
#[derive(Clone)]
pub struct RuntimeContext {
    shared: Arc<AppShared>,
}

impl RuntimeContext {
    /// The runtime loader generation this application runs against.
    pub fn loader(&self) -> Arc<RuntimeLoader> {
        Arc::clone(&self.shared.loader)
    }

    pub fn shutdown(&self) -> Arc<ShutdownContext> {
        Arc::clone(&self.shared.shutdown)
    }

    /// Signal that the application is up. Unblocks the caller of
    /// [`StartupAction::start`].
    pub fn notify_started(&self) {
        self.shared.open_gate(true);
    }

    /// Register the application's own stop hook. Invoked first during the
    /// shutdown sequence, before any registered shutdown task.
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        *self
            .shared
            .stop_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn is_stop_requested(&self) -> bool {
        matches!(self.shared.state(), AppState::Stopping | AppState::Stopped)
    }
}

fn host_entry(shared: Arc<AppShared>, entry: Arc<dyn ApplicationEntryPoint>) {
    let context = RuntimeContext {
        shared: Arc::clone(&shared),
    };
    match entry.run(context) {
        Ok(code) => {
            *shared
                .exit_code
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(code);
            // an application that completes without ever signalling ran to
            // completion; that counts as a (very short) successful start
            shared.open_gate(true);
        }
        Err(e) => {
            let started = shared.gate_started();
            shared.record_error(e);
            if started {
                error!(app = %shared.id, "application failed after start");
            } else {
                shared.open_gate(false);
            }
        }
    }
}

fn read_diagnostics(loader: &RuntimeLoader) -> (Option<String>, Option<String>) {
    match loader.resource(DIAGNOSTIC_CONFIG_RESOURCE) {
        Ok(Some(bytes)) => (Some(String::from_utf8_lossy(&bytes).into_owned()), None),
        Ok(None) => (None, None),
        Err(e) => (None, Some(e.to_string())),
    }
}

/// A ready-to-start application: one installed generation plus its entry
/// point and teardown wiring.
pub struct StartupAction {
    id: Uuid,
    entry: Arc<dyn ApplicationEntryPoint>,
    loader: Arc<RuntimeLoader>,
    replaced: Option<Arc<RuntimeLoader>>,
    shutdown: Arc<ShutdownContext>,
    close_tasks: ShutdownContext,
    worker_pool: Option<Arc<WorkerPool>>,
    retarget: RetargetPolicy,
    launch_mode: LaunchMode,
    keep_alive: bool,
    manager: Option<Arc<LoaderManager>>,
}

impl std::fmt::Debug for StartupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupAction")
            .field("id", &self.id)
            .field("launch_mode", &self.launch_mode)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl StartupAction {
    pub fn new(entry: Arc<dyn ApplicationEntryPoint>, loader: Arc<RuntimeLoader>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry,
            loader,
            replaced: None,
            shutdown: Arc::new(ShutdownContext::new()),
            close_tasks: ShutdownContext::new(),
            worker_pool: None,
            retarget: RetargetPolicy::default(),
            launch_mode: LaunchMode::Normal,
            keep_alive: false,
            manager: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownContext>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_worker_pool(mut self, pool: Arc<WorkerPool>, policy: RetargetPolicy) -> Self {
        self.worker_pool = Some(pool);
        self.retarget = policy;
        self
    }

    pub fn with_launch_mode(mut self, mode: LaunchMode) -> Self {
        self.launch_mode = mode;
        self
    }

    /// Attach the loader manager for outer teardown. `keep_alive` suppresses
    /// the outer close in test mode so the augmentor can be reused.
    pub fn with_manager(mut self, manager: Arc<LoaderManager>, keep_alive: bool) -> Self {
        self.manager = Some(manager);
        self.keep_alive = keep_alive;
        self
    }

    /// The generation this action displaced; closed once the replacement
    /// application has started.
    pub fn with_replaced(mut self, replaced: Option<Arc<RuntimeLoader>>) -> Self {
        self.replaced = replaced;
        self
    }

    pub fn add_close_task(&self, name: impl Into<String>, task: impl FnOnce() + Send + 'static) {
        self.close_tasks.register(name, task);
    }

    pub fn loader(&self) -> &Arc<RuntimeLoader> {
        &self.loader
    }

    fn prepare(self) -> (Arc<AppShared>, Arc<dyn ApplicationEntryPoint>, Option<Arc<RuntimeLoader>>) {
        let retarget_outcome = self
            .worker_pool
            .as_ref()
            .map(|pool| pool.retarget(&self.loader, &self.retarget));
        let shared = Arc::new(AppShared {
            id: self.id,
            loader: self.loader,
            shutdown: self.shutdown,
            close_tasks: self.close_tasks,
            launch_mode: self.launch_mode,
            keep_alive: self.keep_alive,
            manager: self.manager,
            state: Mutex::new(AppState::Created),
            state_cv: Condvar::new(),
            gate: Mutex::new(GateState::Waiting),
            gate_cv: Condvar::new(),
            app_error: Mutex::new(None),
            stop_hook: Mutex::new(None),
            exit_code: Mutex::new(None),
            app_thread_id: Mutex::new(None),
            app_join: Mutex::new(None),
            retarget_outcome: Mutex::new(retarget_outcome),
            teardown_done: Latch::new(),
        });
        (shared, self.entry, self.replaced)
    }

    /// Launch the entry point on a dedicated thread and block until the
    /// application signals start (or terminates without doing so).
    pub fn start(self) -> Result<RunningApp, StartupError> {
        let (shared, entry, replaced) = self.prepare();
        shared.set_state(AppState::Starting);
        debug!(app = %shared.id, loader = %shared.loader.name(), "starting application");

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("app-main".to_string())
            .spawn(move || host_entry(thread_shared, entry))
            .map_err(|e| StartupError::Startup {
                cause: anyhow!(e).context("failed to spawn application thread"),
                diagnostics: None,
                diagnostics_error: None,
            })?;
        *shared
            .app_thread_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle.thread().id());
        *shared
            .app_join
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        if shared.wait_gate() {
            shared.set_state(AppState::Running);
            if let Some(old) = replaced {
                old.close();
            }
            info!(app = %shared.id, "application started");
            Ok(RunningApp { shared })
        } else {
            let cause = shared
                .take_error()
                .unwrap_or_else(|| anyhow!("entry point terminated before signalling start"));
            let (diagnostics, diagnostics_error) = read_diagnostics(&shared.loader);
            // the entry thread has terminated; reclaim it before cleanup
            if let Some(handle) = shared
                .app_join
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                let _ = handle.join();
            }
            shared.shutdown.run_all();
            shared.close_tasks.run_all();
            shared.loader.close();
            shared.set_state(AppState::Stopped);
            Err(StartupError::Startup {
                cause,
                diagnostics,
                diagnostics_error,
            })
        }
    }

    /// Run the entry point on the calling thread and return the
    /// application's exit code once it fully completes. The shutdown
    /// sequence runs before returning.
    pub fn run_blocking(self) -> Result<i32, StartupError> {
        let (shared, entry, replaced) = self.prepare();
        shared.set_state(AppState::Starting);
        *shared
            .app_thread_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());

        let context = RuntimeContext {
            shared: Arc::clone(&shared),
        };
        let result = entry.run(context);
        match result {
            Ok(code) => {
                *shared
                    .exit_code
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(code);
                shared.open_gate(true);
                shared.set_state(AppState::Running);
                if let Some(old) = replaced {
                    old.close();
                }
                let app = RunningApp { shared };
                app.stop();
                Ok(code)
            }
            Err(e) => {
                if shared.gate_started() {
                    shared.set_state(AppState::Running);
                    let app = RunningApp {
                        shared: Arc::clone(&shared),
                    };
                    app.stop();
                    Err(StartupError::Crashed { cause: e })
                } else {
                    let (diagnostics, diagnostics_error) = read_diagnostics(&shared.loader);
                    shared.shutdown.run_all();
                    shared.close_tasks.run_all();
                    shared.loader.close();
                    shared.set_state(AppState::Stopped);
                    Err(StartupError::Startup {
                        cause: e,
                        diagnostics,
                        diagnostics_error,
                    })
                }
            }
        }
    }
}

/// Handle to a started application. Cloneable; all clones share the same
/// underlying application.
#[derive(Clone)]
pub struct RunningApp {
    shared: Arc<AppShared>,
}

impl std::fmt::Debug for RunningApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningApp")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RunningApp {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> AppState {
        self.shared.state()
    }

    /// The active runtime loader, exposed so external tooling can
    /// interrogate the running application without linking against
    /// runtime-only types.
    pub fn loader(&self) -> Arc<RuntimeLoader> {
        Arc::clone(&self.shared.loader)
    }

    pub fn add_close_task(&self, name: impl Into<String>, task: impl FnOnce() + Send + 'static) {
        self.shared.close_tasks.register(name, task);
    }

    /// The worker-pool retarget outcome recorded during startup, if a pool
    /// was attached.
    pub fn retarget_outcome(&self) -> Option<RetargetOutcome> {
        *self
            .shared
            .retarget_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self
            .shared
            .exit_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A failure the entry point reported after signalling start.
    pub fn take_runtime_failure(&self) -> Option<anyhow::Error> {
        self.shared.take_error()
    }

    /// Block until the application reaches `Stopped`.
    pub fn wait_for_stopped(&self) {
        self.shared.teardown_done.wait();
    }

    /// Perform the shutdown sequence exactly once. Concurrent and repeated
    /// calls are no-ops that return once teardown has completed. Safe to
    /// call from the hosted application's own thread.
    pub fn stop(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                AppState::Stopping | AppState::Stopped => {
                    drop(state);
                    self.shared.teardown_done.wait();
                    return;
                }
                _ => *state = AppState::Stopping,
            }
            self.shared.state_cv.notify_all();
        }
        info!(app = %self.shared.id, "stopping application");

        let self_stop = *self
            .shared
            .app_thread_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(thread::current().id());
        if self_stop {
            // delegate to a dedicated thread so the app's own thread is not
            // self-joining; the caller still blocks on the latch below
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("app-teardown".to_string())
                .spawn(move || teardown(&shared, false));
            if spawned.is_err() {
                teardown(&self.shared, false);
            }
        } else {
            teardown(&self.shared, true);
        }
        self.shared.teardown_done.wait();
    }
}

fn teardown(shared: &Arc<AppShared>, join_app_thread: bool) {
    if let Some(hook) = shared
        .stop_hook
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    {
        if catch_unwind(AssertUnwindSafe(hook)).is_err() {
            error!(app = %shared.id, "application stop hook failed");
        }
    }

    let handle = shared
        .app_join
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(handle) = handle {
        if join_app_thread && handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }

    shared.shutdown.run_all();
    shared.close_tasks.run_all();
    shared.loader.close();

    if shared.launch_mode == LaunchMode::Test && !shared.keep_alive {
        if let Some(manager) = &shared.manager {
            manager.close_all();
        }
    }

    shared.set_state(AppState::Stopped);
    info!(app = %shared.id, "application stopped");
    shared.teardown_done.open();
}
