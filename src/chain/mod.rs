//! Step graph builder
//!
//! Collects step declarations, validates the producer/consumer graph and
//! computes a deterministic execution order. All validation happens here,
//! before any step runs: ambiguous producers, unsatisfied required
//! consumptions, steps producing initial items, and dependency cycles are all
//! reported as [`ChainBuildError`]s naming the offending steps and item types.

mod graph;

pub use graph::{ChainGraph, GraphStep};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::exec::ExecutionBuilder;
use crate::item::{BuildItem, ItemId, ItemKind};
use crate::step::{BuildStep, ConsumeDecl, StepBuilder};

/// Environment variable naming a file to receive a Graphviz dump of every
/// successfully built chain.
pub const GRAPH_OUTPUT_ENV: &str = "REFORGE_GRAPH_OUTPUT";

/// Errors detected while wiring the step graph, before any step executes.
#[derive(Debug, Error)]
pub enum ChainBuildError {
    #[error("no producer for required item `{item}` consumed by step `{step}`, and it is not an initial item")]
    UnsatisfiedDependency { item: String, step: String },

    #[error("multiple producers of single-valued item `{item}`: `{first}` and `{second}`")]
    AmbiguousProducer {
        item: String,
        first: String,
        second: String,
    },

    #[error("step `{step}` produces `{item}`, which is declared as an initial item")]
    ProducesInitialItem { step: String, item: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// One step of a built chain, with its scheduling metadata.
pub(crate) struct StepNode {
    pub(crate) name: String,
    pub(crate) step: Arc<dyn BuildStep>,
    pub(crate) consumes: Vec<ConsumeDecl>,
    pub(crate) produces: Vec<ItemId>,
    /// Number of distinct producer steps this step waits on.
    pub(crate) dependencies: usize,
    /// Topological indices of the steps consuming this step's output.
    pub(crate) dependents: Vec<usize>,
}

/// Collects steps plus initial/final item declarations for one chain.
///
/// Every method consumes `self`; a chain configuration is assembled as a
/// value and validated once by [`ChainBuilder::build`].
#[derive(Default)]
pub struct ChainBuilder {
    steps: Vec<StepBuilder>,
    initial: Vec<ItemId>,
    finals: Vec<ItemId>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(mut self, step: StepBuilder) -> Self {
        self.steps.push(step);
        self
    }

    /// Declare an item that is injected before any step runs. No step may
    /// produce a single-valued initial item.
    pub fn add_initial<T: BuildItem>(mut self) -> Self {
        let id = ItemId::of::<T>();
        if !self.initial.contains(&id) {
            self.initial.push(id);
        }
        self
    }

    /// Declare an item the caller wants produced. Only final items are
    /// consumable from the run's [`crate::exec::BuildResult`].
    pub fn add_final<T: BuildItem>(mut self) -> Self {
        let id = ItemId::of::<T>();
        if !self.finals.contains(&id) {
            self.finals.push(id);
        }
        self
    }

    /// Validate the graph and compute the execution order.
    pub fn build(self) -> Result<BuildChain, ChainBuildError> {
        let producers = self.index_producers()?;
        let (included, deps) = self.include_steps(&producers)?;
        self.detect_cycles(&included, &deps)?;
        let chain = self.order_steps(&included, &deps);

        debug!(
            steps = chain.steps.len(),
            registered = included.len(),
            "build chain assembled"
        );

        if let Ok(path) = std::env::var(GRAPH_OUTPUT_ENV) {
            if !path.is_empty() {
                if let Err(e) = chain.graph().write_dot(Path::new(&path)) {
                    warn!(path, error = %e, "failed to write chain graph dump");
                }
            }
        }

        Ok(chain)
    }

    /// Index producers by item id, rejecting ambiguous single-item producers
    /// and producers of initial items. Runs over every registered step, so an
    /// ambiguity is reported even when one of the producers is unreachable.
    fn index_producers(&self) -> Result<HashMap<ItemId, Vec<usize>>, ChainBuildError> {
        let mut producers: HashMap<ItemId, Vec<usize>> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            for id in &step.produces {
                if id.kind() == ItemKind::Single {
                    if self.initial.contains(id) {
                        return Err(ChainBuildError::ProducesInitialItem {
                            step: step.name.clone(),
                            item: id.to_string(),
                        });
                    }
                    if let Some(first) = producers.get(id).and_then(|v| v.first()) {
                        return Err(ChainBuildError::AmbiguousProducer {
                            item: id.to_string(),
                            first: self.steps[*first].name.clone(),
                            second: step.name.clone(),
                        });
                    }
                }
                producers.entry(*id).or_default().push(i);
            }
        }
        Ok(producers)
    }

    /// Walk backwards from the final items, including every transitively
    /// required producer and validating required consumptions along the way.
    /// Steps never reached here are dead and will not execute.
    #[allow(clippy::type_complexity)]
    fn include_steps(
        &self,
        producers: &HashMap<ItemId, Vec<usize>>,
    ) -> Result<(Vec<usize>, Vec<Vec<usize>>), ChainBuildError> {
        let n = self.steps.len();
        let mut included = vec![false; n];
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut queue = VecDeque::new();

        let mut enqueue = |i: usize, included: &mut Vec<bool>, queue: &mut VecDeque<usize>| {
            if !included[i] {
                included[i] = true;
                queue.push_back(i);
            }
        };

        for id in &self.finals {
            if let Some(list) = producers.get(id) {
                for &p in list {
                    enqueue(p, &mut included, &mut queue);
                }
            }
        }

        while let Some(i) = queue.pop_front() {
            let step = &self.steps[i];
            for consume in &step.consumes {
                let produced = producers.contains_key(&consume.id);
                let initial = self.initial.contains(&consume.id);
                let required = !consume.optional && consume.id.kind() != ItemKind::Multi;
                if required && !produced && !initial {
                    return Err(ChainBuildError::UnsatisfiedDependency {
                        item: consume.id.to_string(),
                        step: step.name.clone(),
                    });
                }
                if let Some(list) = producers.get(&consume.id) {
                    for &p in list {
                        enqueue(p, &mut included, &mut queue);
                        if !deps[i].contains(&p) {
                            deps[i].push(p);
                        }
                    }
                }
            }
        }

        let included: Vec<usize> = (0..n).filter(|&i| included[i]).collect();
        Ok((included, deps))
    }

    fn detect_cycles(
        &self,
        included: &[usize],
        deps: &[Vec<usize>],
    ) -> Result<(), ChainBuildError> {
        const IN_STACK: u8 = 1;
        const DONE: u8 = 2;

        fn visit(
            i: usize,
            steps: &[StepBuilder],
            deps: &[Vec<usize>],
            state: &mut [u8],
            path: &mut Vec<usize>,
        ) -> Result<(), ChainBuildError> {
            if state[i] == DONE {
                return Ok(());
            }
            if state[i] == IN_STACK {
                let start = path.iter().position(|&x| x == i).unwrap_or(0);
                let mut members: Vec<String> =
                    path[start..].iter().map(|&x| steps[x].name.clone()).collect();
                members.push(steps[i].name.clone());
                return Err(ChainBuildError::Cycle { path: members });
            }
            state[i] = IN_STACK;
            path.push(i);
            for &d in &deps[i] {
                visit(d, steps, deps, state, path)?;
            }
            path.pop();
            state[i] = DONE;
            Ok(())
        }

        let mut state = vec![0u8; self.steps.len()];
        let mut path = Vec::new();
        for &i in included {
            visit(i, &self.steps, deps, &mut state, &mut path)?;
        }
        Ok(())
    }

    /// Kahn's algorithm over the included steps, breaking ties by declaration
    /// index so the order is reproducible for a fixed step set.
    fn order_steps(self, included: &[usize], deps: &[Vec<usize>]) -> BuildChain {
        let mut remaining: HashMap<usize, usize> = HashMap::new();
        let mut dependents_of: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in included {
            remaining.insert(i, deps[i].len());
            for &p in &deps[i] {
                dependents_of.entry(p).or_default().push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = included
            .iter()
            .filter(|&&i| remaining[&i] == 0)
            .map(|&i| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(included.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &d in dependents_of.get(&i).map(Vec::as_slice).unwrap_or(&[]) {
                let count = remaining
                    .get_mut(&d)
                    .unwrap_or_else(|| unreachable!("dependent steps are always included"));
                *count -= 1;
                if *count == 0 {
                    ready.push(Reverse(d));
                }
            }
        }

        let topo_of: HashMap<usize, usize> =
            order.iter().enumerate().map(|(t, &i)| (i, t)).collect();

        let mut steps = Vec::with_capacity(order.len());
        let mut builders: Vec<Option<StepBuilder>> = self.steps.into_iter().map(Some).collect();
        for &i in &order {
            let builder = builders[i]
                .take()
                .unwrap_or_else(|| unreachable!("each step is ordered exactly once"));
            let mut dependents: Vec<usize> = dependents_of
                .get(&i)
                .map(Vec::as_slice)
                .unwrap_or(&[])
                .iter()
                .map(|d| topo_of[d])
                .collect();
            dependents.sort_unstable();
            steps.push(StepNode {
                name: builder.name,
                step: builder.step,
                consumes: builder.consumes,
                produces: builder.produces,
                dependencies: deps[i].len(),
                dependents,
            });
        }

        BuildChain {
            steps,
            initial: self.initial,
            finals: self.finals,
        }
    }
}

/// A validated, ordered set of steps plus initial/final item declarations.
pub struct BuildChain {
    pub(crate) steps: Vec<StepNode>,
    pub(crate) initial: Vec<ItemId>,
    pub(crate) finals: Vec<ItemId>,
}

impl std::fmt::Debug for BuildChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildChain")
            .field("steps", &self.step_names())
            .field("initial", &self.initial)
            .field("finals", &self.finals)
            .finish()
    }
}

impl BuildChain {
    /// Begin an execution of this chain.
    pub fn execution(&self) -> ExecutionBuilder<'_> {
        ExecutionBuilder::new(self)
    }

    /// Step names in execution order. Dead steps are absent.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
