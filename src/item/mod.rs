//! Build item type system
//!
//! Build items are the typed tokens that flow between build steps. A step
//! declares which item types it produces and consumes; the chain builder wires
//! steps together purely from those declarations. Item identity is the Rust
//! type itself, captured at runtime as an [`ItemId`].

use std::any::{Any, TypeId};
use std::fmt;

/// Cardinality of a build item type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    /// Exactly one producer, one value, consumed by direct lookup.
    Single,
    /// Zero or more producers, consumed as an ordered collection.
    Multi,
    /// Zero-payload synchronization token; any number of producers.
    Marker,
}

/// A typed value produced by build steps and consumed by later ones.
///
/// Items are immutable once produced; consumers receive shared `Arc` handles.
/// The cardinality of a type is fixed by its `KIND` constant and defaults to
/// [`ItemKind::Single`].
pub trait BuildItem: Any + Send + Sync + 'static {
    const KIND: ItemKind = ItemKind::Single;
}

/// Runtime identity of a build item type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId {
    type_id: TypeId,
    name: &'static str,
    kind: ItemKind,
}

impl ItemId {
    pub fn of<T: BuildItem>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            kind: T::KIND,
        }
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn is_multi(&self) -> bool {
        self.kind == ItemKind::Multi
    }

    pub fn is_marker(&self) -> bool {
        self.kind == ItemKind::Marker
    }

    /// The bare type name, without its module path.
    pub fn name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }

    /// The fully qualified type name.
    pub fn full_name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({}, {:?})", self.name(), self.kind)
    }
}
