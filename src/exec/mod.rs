//! Concurrent step execution engine
//!
//! Runs a built chain: steps with no outstanding producers are spawned
//! immediately, and each completion releases its dependents. There is no
//! mid-run cancellation; the first failing step aborts the run (no further
//! steps start, in-flight steps finish) and the failure is attributed to that
//! step. Partial results are never returned.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::chain::BuildChain;
use crate::item::{BuildItem, ItemId, ItemKind};
use crate::step::ConsumeDecl;

type Value = Arc<dyn Any + Send + Sync>;

/// Errors raised while executing a chain or querying its result.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("step `{step}` failed: {cause:#}")]
    StepFailed { step: String, cause: anyhow::Error },

    #[error("step task aborted: {0}")]
    TaskFailure(String),

    #[error("step `{step}` consumed undeclared item `{item}`")]
    UndeclaredConsume { step: String, item: String },

    #[error("step `{step}` produced undeclared item `{item}`")]
    UndeclaredProduce { step: String, item: String },

    #[error("step `{step}` produced single-valued item `{item}` more than once")]
    DuplicateProduce { step: String, item: String },

    #[error("item `{item}` is not declared as an initial item of this chain")]
    NotInitial { item: String },

    #[error("initial item `{item}` was provided more than once")]
    DuplicateInitial { item: String },

    #[error("item `{item}` is not declared as a final item of this chain")]
    NotFinal { item: String },

    #[error("no value was produced for item `{item}`")]
    Missing { item: String },

    #[error("item `{item}` is a marker and carries no value")]
    MarkerHasNoValue { item: String },
}

enum Slot {
    Single(Value),
    /// Values tagged with a source key: 0 for initial values, the producing
    /// step's scheduled position + 1 otherwise. Sorting by key yields the
    /// documented deterministic multi-item order.
    Multi(Vec<(usize, Value)>),
    Marker,
}

struct ExecState {
    items: Mutex<HashMap<ItemId, Slot>>,
}

impl ExecState {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ItemId, Slot>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn downcast<T: Any + Send + Sync>(value: Value) -> Arc<T> {
    value
        .downcast::<T>()
        .unwrap_or_else(|_| unreachable!("item slots are keyed by TypeId"))
}

/// The handle a running step uses to read consumed items and publish
/// produced ones. Cheap to clone; all clones share the run's item store.
#[derive(Clone)]
pub struct StepContext {
    name: Arc<str>,
    index: usize,
    consumes: Arc<Vec<ConsumeDecl>>,
    produces: Arc<Vec<ItemId>>,
    state: Arc<ExecState>,
}

impl StepContext {
    pub fn step_name(&self) -> &str {
        &self.name
    }

    /// Read the single value of `T`. Fails if this step did not declare the
    /// consumption or no value was produced.
    pub fn consume<T: BuildItem>(&self) -> Result<Arc<T>, ExecutionError> {
        let id = self.check_consume::<T>()?;
        match self.state.lock().get(&id) {
            Some(Slot::Single(v)) => Ok(downcast(v.clone())),
            _ => Err(ExecutionError::Missing {
                item: id.to_string(),
            }),
        }
    }

    /// Read the single value of `T` if one was produced.
    pub fn consume_optional<T: BuildItem>(&self) -> Result<Option<Arc<T>>, ExecutionError> {
        let id = self.check_consume::<T>()?;
        match self.state.lock().get(&id) {
            Some(Slot::Single(v)) => Ok(Some(downcast(v.clone()))),
            _ => Ok(None),
        }
    }

    /// Read all values of the multi item `T`, ordered by producing step.
    pub fn consume_multi<T: BuildItem>(&self) -> Result<Vec<Arc<T>>, ExecutionError> {
        let id = self.check_consume_any::<T>()?;
        match self.state.lock().get(&id) {
            Some(Slot::Multi(values)) => {
                let mut values = values.clone();
                values.sort_by_key(|(source, _)| *source);
                Ok(values.into_iter().map(|(_, v)| downcast(v)).collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Publish a produced value of `T`. Fails if the production was not
    /// declared, or a single-valued item is produced twice.
    pub fn produce<T: BuildItem>(&self, value: T) -> Result<(), ExecutionError> {
        let id = ItemId::of::<T>();
        if !self.produces.contains(&id) {
            return Err(ExecutionError::UndeclaredProduce {
                step: self.name.to_string(),
                item: id.to_string(),
            });
        }
        let mut items = self.state.lock();
        match T::KIND {
            ItemKind::Single => {
                if items.contains_key(&id) {
                    return Err(ExecutionError::DuplicateProduce {
                        step: self.name.to_string(),
                        item: id.to_string(),
                    });
                }
                items.insert(id, Slot::Single(Arc::new(value)));
            }
            ItemKind::Multi => {
                let slot = items.entry(id).or_insert_with(|| Slot::Multi(Vec::new()));
                if let Slot::Multi(values) = slot {
                    values.push((self.index + 1, Arc::new(value)));
                }
            }
            ItemKind::Marker => {
                items.insert(id, Slot::Marker);
            }
        }
        Ok(())
    }

    fn check_consume<T: BuildItem>(&self) -> Result<ItemId, ExecutionError> {
        let id = self.check_consume_any::<T>()?;
        if id.is_marker() {
            return Err(ExecutionError::MarkerHasNoValue {
                item: id.to_string(),
            });
        }
        Ok(id)
    }

    fn check_consume_any<T: BuildItem>(&self) -> Result<ItemId, ExecutionError> {
        let id = ItemId::of::<T>();
        if !self.consumes.iter().any(|c| c.id == id) {
            return Err(ExecutionError::UndeclaredConsume {
                step: self.name.to_string(),
                item: id.to_string(),
            });
        }
        Ok(id)
    }
}

/// Injects initial item values and runs the chain.
pub struct ExecutionBuilder<'c> {
    chain: &'c BuildChain,
    items: HashMap<ItemId, Slot>,
}

impl std::fmt::Debug for ExecutionBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionBuilder")
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl<'c> ExecutionBuilder<'c> {
    pub(crate) fn new(chain: &'c BuildChain) -> Self {
        Self {
            chain,
            items: HashMap::new(),
        }
    }

    /// Provide the value of a declared initial item. Repeated provision is
    /// only valid for multi items.
    pub fn provide<T: BuildItem>(mut self, value: T) -> Result<Self, ExecutionError> {
        let id = ItemId::of::<T>();
        if !self.chain.initial.contains(&id) {
            return Err(ExecutionError::NotInitial {
                item: id.to_string(),
            });
        }
        match T::KIND {
            ItemKind::Single => {
                if self.items.contains_key(&id) {
                    return Err(ExecutionError::DuplicateInitial {
                        item: id.to_string(),
                    });
                }
                self.items.insert(id, Slot::Single(Arc::new(value)));
            }
            ItemKind::Multi => {
                let slot = self.items.entry(id).or_insert_with(|| Slot::Multi(Vec::new()));
                if let Slot::Multi(values) = slot {
                    values.push((0, Arc::new(value)));
                }
            }
            ItemKind::Marker => {
                self.items.insert(id, Slot::Marker);
            }
        }
        Ok(self)
    }

    /// Run every step of the chain exactly once, honoring the computed order.
    /// Mutually independent steps run concurrently.
    pub async fn execute(self) -> Result<BuildResult, ExecutionError> {
        let chain = self.chain;
        let state = Arc::new(ExecState {
            items: Mutex::new(self.items),
        });
        let run_started = Instant::now();

        let mut remaining: Vec<usize> = chain.steps.iter().map(|s| s.dependencies).collect();
        let mut join: JoinSet<(usize, anyhow::Result<()>, Duration)> = JoinSet::new();

        let spawn_step = |idx: usize, join: &mut JoinSet<(usize, anyhow::Result<()>, Duration)>| {
            let node = &chain.steps[idx];
            let step = Arc::clone(&node.step);
            let cx = StepContext {
                name: Arc::from(node.name.as_str()),
                index: idx,
                consumes: Arc::new(node.consumes.clone()),
                produces: Arc::new(node.produces.clone()),
                state: Arc::clone(&state),
            };
            join.spawn(async move {
                let started = Instant::now();
                let result = step.execute(&cx).await;
                (idx, result, started.elapsed())
            });
        };

        for idx in 0..chain.steps.len() {
            if remaining[idx] == 0 {
                spawn_step(idx, &mut join);
            }
        }

        let mut failure: Option<ExecutionError> = None;
        while let Some(joined) = join.join_next().await {
            match joined {
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(ExecutionError::TaskFailure(e.to_string()));
                    } else {
                        error!(error = %e, "additional step task failure after abort");
                    }
                }
                Ok((idx, Err(e), elapsed)) => {
                    let name = &chain.steps[idx].name;
                    if failure.is_none() {
                        failure = Some(ExecutionError::StepFailed {
                            step: name.clone(),
                            cause: e,
                        });
                    } else {
                        error!(step = %name, ?elapsed, "additional step failure after abort: {e:#}");
                    }
                }
                Ok((idx, Ok(()), elapsed)) => {
                    let node = &chain.steps[idx];
                    debug!(step = %node.name, ?elapsed, "step complete");
                    if failure.is_none() {
                        for &dependent in &node.dependents {
                            remaining[dependent] -= 1;
                            if remaining[dependent] == 0 {
                                spawn_step(dependent, &mut join);
                            }
                        }
                    }
                }
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }
        debug!(elapsed = ?run_started.elapsed(), steps = chain.steps.len(), "chain run complete");

        let raw = std::mem::take(&mut *state.lock());
        let mut items = HashMap::with_capacity(raw.len());
        for (id, slot) in raw {
            let resolved = match slot {
                Slot::Single(v) => Resolved::Single(v),
                Slot::Marker => Resolved::Marker,
                Slot::Multi(mut values) => {
                    values.sort_by_key(|(source, _)| *source);
                    Resolved::Multi(values.into_iter().map(|(_, v)| v).collect())
                }
            };
            items.insert(id, resolved);
        }
        Ok(BuildResult {
            items,
            finals: chain.finals.clone(),
        })
    }
}

enum Resolved {
    Single(Value),
    Multi(Vec<Value>),
    Marker,
}

/// The item values of a completed run, queryable by final-output types only.
pub struct BuildResult {
    items: HashMap<ItemId, Resolved>,
    finals: Vec<ItemId>,
}

impl std::fmt::Debug for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildResult")
            .field("finals", &self.finals)
            .finish_non_exhaustive()
    }
}

impl BuildResult {
    /// Read the single value of the final item `T`. Fails loudly if `T` was
    /// never declared final or no value was produced.
    pub fn consume<T: BuildItem>(&self) -> Result<Arc<T>, ExecutionError> {
        let id = self.check_final::<T>()?;
        match self.items.get(&id) {
            Some(Resolved::Single(v)) => Ok(downcast(v.clone())),
            _ => Err(ExecutionError::Missing {
                item: id.to_string(),
            }),
        }
    }

    pub fn consume_optional<T: BuildItem>(&self) -> Result<Option<Arc<T>>, ExecutionError> {
        let id = self.check_final::<T>()?;
        match self.items.get(&id) {
            Some(Resolved::Single(v)) => Ok(Some(downcast(v.clone()))),
            _ => Ok(None),
        }
    }

    /// All values of the final multi item `T`, possibly empty.
    pub fn consume_multi<T: BuildItem>(&self) -> Result<Vec<Arc<T>>, ExecutionError> {
        let id = self.check_final_any::<T>()?;
        match self.items.get(&id) {
            Some(Resolved::Multi(values)) => {
                Ok(values.iter().cloned().map(downcast).collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Whether any value (or marker) of `T` was produced.
    pub fn contains<T: BuildItem>(&self) -> bool {
        self.items.contains_key(&ItemId::of::<T>())
    }

    fn check_final<T: BuildItem>(&self) -> Result<ItemId, ExecutionError> {
        let id = self.check_final_any::<T>()?;
        if id.is_marker() {
            return Err(ExecutionError::MarkerHasNoValue {
                item: id.to_string(),
            });
        }
        Ok(id)
    }

    fn check_final_any<T: BuildItem>(&self) -> Result<ItemId, ExecutionError> {
        let id = ItemId::of::<T>();
        if !self.finals.contains(&id) {
            return Err(ExecutionError::NotFinal {
                item: id.to_string(),
            });
        }
        Ok(id)
    }
}
