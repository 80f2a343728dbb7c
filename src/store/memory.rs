//! In-process store.
//!
//! Behaves like the external store where the engine can observe it:
//! `list` drops dependency edges, edge statuses are snapshots taken when the
//! edge was added and are never refreshed, and batched reads omit unknown
//! ids. Failure injection hooks let tests exercise fallback and rollback.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::StoreClient;
use crate::core::item::{
    Dependency, DependencyKind, Direction, ItemStatus, ItemUpdate, ListFilter, NewItem, WorkItem,
};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    /// Insertion order is list order.
    items: Vec<WorkItem>,
    counters: HashMap<String, u64>,
    close_reasons: HashMap<String, String>,
    calls: HashMap<&'static str, usize>,
    mutations: usize,
    fail_show_multiple: bool,
    fail_updates: HashMap<String, u32>,
    fail_dependency_kinds: HashSet<DependencyKind>,
    fail_creates: bool,
}

impl State {
    fn find(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    fn record(&mut self, op: &'static str) {
        *self.calls.entry(op).or_insert(0) += 1;
    }

    fn next_id(&mut self, prefix: &str, parent: Option<&str>) -> String {
        match parent {
            Some(parent) => {
                let n = self.counters.entry(format!("{}.", parent)).or_insert(0);
                *n += 1;
                format!("{}.{}", parent, n)
            }
            None => {
                let n = self.counters.entry(prefix.to_string()).or_insert(0);
                *n += 1;
                format!("{}-{}", prefix, n)
            }
        }
    }
}

/// In-memory [`StoreClient`].
pub struct MemoryStore {
    prefix: String,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an item as-is, replacing any item with the same id.
    pub fn insert(&self, item: WorkItem) {
        let mut state = self.lock();
        state.items.retain(|i| i.id != item.id);
        state.items.push(item);
    }

    /// Current record, bypassing call accounting.
    pub fn get(&self, id: &str) -> Option<WorkItem> {
        self.lock().find(id).cloned()
    }

    pub fn all(&self) -> Vec<WorkItem> {
        self.lock().items.clone()
    }

    pub fn close_reason(&self, id: &str) -> Option<String> {
        self.lock().close_reasons.get(id).cloned()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Number of mutating calls that reached the store.
    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    pub fn fail_show_multiple(&self, fail: bool) {
        self.lock().fail_show_multiple = fail;
    }

    /// Fail the next `times` updates of `id` with a transient error.
    pub fn fail_updates(&self, id: &str, times: u32) {
        self.lock().fail_updates.insert(id.to_string(), times);
    }

    pub fn fail_dependency_kind(&self, kind: DependencyKind) {
        self.lock().fail_dependency_kinds.insert(kind);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn create(&self, new: NewItem) -> Result<WorkItem> {
        let mut state = self.lock();
        state.record("create");
        if state.fail_creates {
            return Err(Error::Store("create rejected".to_string()));
        }
        let id = match new.id {
            Some(id) => {
                if state.find(&id).is_some() {
                    return Err(Error::Validation(format!("item {} already exists", id)));
                }
                id
            }
            None => {
                let prefix = new.prefix.clone().unwrap_or_else(|| self.prefix.clone());
                state.next_id(&prefix, new.parent.as_deref())
            }
        };
        let mut item = WorkItem::new(id, new.title);
        item.description = new.description;
        item.item_type = new.item_type;
        item.parent = new.parent;
        item.assignee = new.assignee;
        item.labels = new.labels;
        item.metadata = new.metadata;
        item.created_at = Some(chrono::Utc::now());
        state.items.push(item.clone());
        state.mutations += 1;
        Ok(item)
    }

    async fn show(&self, id: &str) -> Result<WorkItem> {
        let mut state = self.lock();
        state.record("show");
        state
            .find(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn show_multiple(&self, ids: &[String]) -> Result<HashMap<String, WorkItem>> {
        let mut state = self.lock();
        state.record("show_multiple");
        if state.fail_show_multiple {
            return Err(Error::Store("batched show unavailable".to_string()));
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.find(id).map(|i| (id.clone(), i.clone())))
            .collect())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<WorkItem>> {
        let mut state = self.lock();
        state.record("list");
        Ok(state
            .items
            .iter()
            .filter(|i| filter.matches(i))
            .map(|i| {
                let mut summary = i.clone();
                summary.dependencies.clear();
                summary
            })
            .collect())
    }

    async fn update(&self, id: &str, update: &ItemUpdate) -> Result<()> {
        let mut state = self.lock();
        state.record("update");
        if let Some(remaining) = state.fail_updates.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Store(format!("update of {} timed out", id)));
            }
        }
        let item = state
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        update.apply_to(item);
        item.updated_at = Some(chrono::Utc::now());
        state.mutations += 1;
        Ok(())
    }

    async fn close(&self, id: &str, reason: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("close");
        let item = state
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        item.status = ItemStatus::Closed;
        state.close_reasons.insert(id.to_string(), reason.to_string());
        state.mutations += 1;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("delete");
        let before = state.items.len();
        state.items.retain(|i| i.id != id);
        if state.items.len() == before {
            return Err(Error::NotFound(id.to_string()));
        }
        state.mutations += 1;
        Ok(())
    }

    async fn dependency_add(&self, from: &str, to: &str, kind: DependencyKind) -> Result<()> {
        let mut state = self.lock();
        state.record("dependency_add");
        if state.fail_dependency_kinds.contains(&kind) {
            return Err(Error::Store(format!(
                "adding {} edge {} -> {} failed",
                kind, from, to
            )));
        }
        // Targets may live in another domain; snapshot what is visible now.
        let (status, title) = match state.find(to) {
            Some(target) => (Some(target.status), Some(target.title.clone())),
            None => (None, None),
        };
        let item = state
            .find_mut(from)
            .ok_or_else(|| Error::NotFound(from.to_string()))?;
        if !item.dependencies.iter().any(|d| d.id == to && d.kind == kind) {
            item.dependencies.push(Dependency {
                id: to.to_string(),
                kind,
                status,
                title,
            });
        }
        state.mutations += 1;
        Ok(())
    }

    async fn dependency_list(
        &self,
        id: &str,
        direction: Direction,
        kind: Option<DependencyKind>,
    ) -> Result<Vec<Dependency>> {
        let mut state = self.lock();
        state.record("dependency_list");
        let keep = |k: DependencyKind| kind.map(|want| want == k).unwrap_or(true);
        match direction {
            Direction::Down => {
                let item = state
                    .find(id)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                Ok(item
                    .dependencies
                    .iter()
                    .filter(|d| keep(d.kind))
                    .cloned()
                    .collect())
            }
            Direction::Up => Ok(state
                .items
                .iter()
                .flat_map(|source| {
                    source
                        .dependencies
                        .iter()
                        .filter(|d| d.id == id && keep(d.kind))
                        .map(|d| Dependency {
                            id: source.id.clone(),
                            kind: d.kind,
                            status: Some(source.status),
                            title: Some(source.title.clone()),
                        })
                })
                .collect()),
        }
    }
}
