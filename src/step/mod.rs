//! Build step contract and declaration builder
//!
//! A build step is an opaque unit of work with a declared set of produced and
//! consumed item types. Steps never interpret each other's payloads; the chain
//! builder orders them purely from the declarations collected here.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::exec::StepContext;
use crate::item::{BuildItem, ItemId, ItemKind};

/// A unit of build work. Executes at most once per pipeline run.
///
/// Steps read consumed items and publish produced items through the
/// [`StepContext`] they are handed; everything else about them is opaque to
/// the engine.
#[async_trait]
pub trait BuildStep: Send + Sync + 'static {
    async fn execute(&self, cx: &StepContext) -> Result<()>;
}

/// One consume declaration of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConsumeDecl {
    pub id: ItemId,
    pub optional: bool,
}

/// Declares a step's name, produced item types and consumed item types.
///
/// The builder is immutable in style: every method consumes `self`, so a
/// fully configured step declaration is a plain value that can be cloned into
/// any number of chains.
#[derive(Clone)]
pub struct StepBuilder {
    pub(crate) name: String,
    pub(crate) step: Arc<dyn BuildStep>,
    pub(crate) produces: Vec<ItemId>,
    pub(crate) consumes: Vec<ConsumeDecl>,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>, step: impl BuildStep) -> Self {
        Self {
            name: name.into(),
            step: Arc::new(step),
            produces: Vec::new(),
            consumes: Vec::new(),
        }
    }

    /// Wrap an async closure as a step. The closure receives an owned
    /// [`StepContext`] handle for the current run.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(name, FnStep(f))
    }

    /// Declare that this step produces `T`.
    pub fn produces<T: BuildItem>(mut self) -> Self {
        let id = ItemId::of::<T>();
        if !self.produces.contains(&id) {
            self.produces.push(id);
        }
        self
    }

    /// Declare a required consumption of `T`.
    pub fn consumes<T: BuildItem>(self) -> Self {
        self.add_consume(ItemId::of::<T>(), false)
    }

    /// Declare an optional consumption of `T`. Absence of a producer is not a
    /// validation error. Multi items are always effectively optional, so the
    /// flag is normalized away for them.
    pub fn consumes_optional<T: BuildItem>(self) -> Self {
        let id = ItemId::of::<T>();
        let optional = id.kind() != ItemKind::Multi;
        self.add_consume(id, optional)
    }

    fn add_consume(mut self, id: ItemId, optional: bool) -> Self {
        match self.consumes.iter_mut().find(|c| c.id == id) {
            // a required declaration wins over an optional one
            Some(existing) => existing.optional = existing.optional && optional,
            None => self.consumes.push(ConsumeDecl { id, optional }),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for StepBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepBuilder")
            .field("name", &self.name)
            .field("produces", &self.produces)
            .field("consumes", &self.consumes)
            .finish()
    }
}

struct FnStep<F>(F);

#[async_trait]
impl<F, Fut> BuildStep for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn execute(&self, cx: &StepContext) -> Result<()> {
        (self.0)(cx.clone()).await
    }
}
