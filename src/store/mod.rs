//! Store client port.
//!
//! All durable state lives in an external issue store. The engine talks to
//! it only through [`StoreClient`]; [`BdStore`] drives the `bd` CLI and
//! [`MemoryStore`] keeps everything in process for tests and embedding.

mod bd;
mod memory;

pub use bd::BdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::core::item::{
    Dependency, DependencyKind, Direction, ItemUpdate, ListFilter, NewItem, WorkItem,
};
use crate::{glog_debug, glog_warn, Result};

/// Typed CRUD and dependency queries over work items.
///
/// Every call crosses a process boundary in production and may fail
/// transiently. `list` results carry no dependency edges; use `show` for
/// the full record.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn create(&self, item: NewItem) -> Result<WorkItem>;

    /// Full record including dependency edges. `Error::NotFound` if absent.
    async fn show(&self, id: &str) -> Result<WorkItem>;

    /// Batched `show`. Ids that do not resolve are omitted from the map.
    async fn show_multiple(&self, ids: &[String]) -> Result<HashMap<String, WorkItem>>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<WorkItem>>;

    /// Apply every field of `update` in one store write.
    async fn update(&self, id: &str, update: &ItemUpdate) -> Result<()>;

    async fn close(&self, id: &str, reason: &str) -> Result<()>;

    /// Only used to discard orphans the dispatcher itself just created.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Record that `from` depends on `to` with the given kind.
    async fn dependency_add(&self, from: &str, to: &str, kind: DependencyKind) -> Result<()>;

    async fn dependency_list(
        &self,
        id: &str,
        direction: Direction,
        kind: Option<DependencyKind>,
    ) -> Result<Vec<Dependency>>;
}

/// Result of a fresh multi-item fetch.
#[derive(Debug, Default)]
pub struct FreshFetch {
    pub items: HashMap<String, WorkItem>,
    /// Ids neither the batch nor the per-id fallback could resolve.
    pub missing: Vec<String>,
}

/// Fetch live records for `ids`, batched when possible.
///
/// A failed batch falls back to per-id `show` for every id; a partial batch
/// falls back only for the ids it did not return. Per-id failures are
/// logged and reported in `missing` rather than failing the whole fetch.
pub async fn fetch_fresh(store: &dyn StoreClient, ids: &[String]) -> FreshFetch {
    let mut fetch = FreshFetch::default();
    if ids.is_empty() {
        return fetch;
    }

    match store.show_multiple(ids).await {
        Ok(items) => fetch.items = items,
        Err(e) => {
            glog_warn!(
                "batched show of {} ids failed, falling back per id: {}",
                ids.len(),
                e
            );
        }
    }

    for id in ids {
        if fetch.items.contains_key(id) {
            continue;
        }
        match store.show(id).await {
            Ok(item) => {
                fetch.items.insert(id.clone(), item);
            }
            Err(e) => {
                glog_debug!("fresh fetch of {} failed: {}", id, e);
                fetch.missing.push(id.clone());
            }
        }
    }
    fetch
}
