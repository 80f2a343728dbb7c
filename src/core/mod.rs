//! Core domain models: work items, worker identities and step graphs.

pub mod dag;
pub mod identity;
pub mod item;

pub use dag::{StepGraph, StepNode};
pub use identity::{AgentIdentity, Role};
pub use item::{
    Dependency, DependencyKind, Direction, ItemStatus, ItemType, ItemUpdate, ListFilter, NewItem,
    WorkItem,
};
