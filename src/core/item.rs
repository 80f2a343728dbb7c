//! Work item data model.
//!
//! Work items live in an external store. Everything here mirrors the store's
//! JSON shape closely enough to deserialize its output directly, while
//! giving the engine typed statuses and dependency kinds to match on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Open,
    InProgress,
    Pinned,
    Hooked,
    Closed,
    Tombstone,
}

impl ItemStatus {
    /// Closed and tombstoned items never come back through normal flow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Closed | ItemStatus::Tombstone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Open => "open",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Pinned => "pinned",
            ItemStatus::Hooked => "hooked",
            ItemStatus::Closed => "closed",
            ItemStatus::Tombstone => "tombstone",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(ItemStatus::Open),
            "in_progress" => Ok(ItemStatus::InProgress),
            "pinned" => Ok(ItemStatus::Pinned),
            "hooked" => Ok(ItemStatus::Hooked),
            "closed" => Ok(ItemStatus::Closed),
            "tombstone" => Ok(ItemStatus::Tombstone),
            other => Err(crate::Error::Validation(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

/// Kind of a dependency edge.
///
/// Only `Blocks` gates readiness. `Tracks` is observational (convoys) and
/// `ParentChild` groups without gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    #[default]
    Blocks,
    Tracks,
    ParentChild,
    #[serde(other)]
    Related,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Blocks => "blocks",
            DependencyKind::Tracks => "tracks",
            DependencyKind::ParentChild => "parent-child",
            DependencyKind::Related => "related",
        }
    }

    pub fn gates(&self) -> bool {
        matches!(self, DependencyKind::Blocks)
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    #[default]
    Task,
    Bug,
    Feature,
    Epic,
    Convoy,
    Molecule,
    Step,
    Agent,
    #[serde(other)]
    Other,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Task => "task",
            ItemType::Bug => "bug",
            ItemType::Feature => "feature",
            ItemType::Epic => "epic",
            ItemType::Convoy => "convoy",
            ItemType::Molecule => "molecule",
            ItemType::Step => "step",
            ItemType::Agent => "agent",
            ItemType::Other => "other",
        }
    }
}

/// One dependency edge as the store reports it.
///
/// `status` is the store's cached view of the target. When the target lives
/// in another storage domain it can be stale and must not drive decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    #[serde(alias = "dependency_type", alias = "type", default)]
    pub kind: DependencyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Dependency {
    pub fn new(id: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: None,
            title: None,
        }
    }
}

/// A work item record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, alias = "issue_type", rename = "type")]
    pub item_type: ItemType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, alias = "blocked_by", skip_serializing_if = "Option::is_none")]
    pub blocked_by_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: ItemStatus::Open,
            assignee: None,
            parent: None,
            item_type: ItemType::Task,
            labels: Vec::new(),
            metadata: BTreeMap::new(),
            blocked_by_count: None,
            dependencies: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Domain prefix of the id (`gt-abc12` -> `gt`).
    pub fn domain(&self) -> &str {
        crate::util::id_prefix(&self.id)
    }

    pub fn deps_of_kind(&self, kind: DependencyKind) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(move |d| d.kind == kind)
    }

    pub fn blocking_deps(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| d.kind.gates())
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Fields for creating a new item. The store assigns the id unless one is
/// requested explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub id: Option<String>,
    /// Id prefix to allocate under when `id` is unset.
    pub prefix: Option<String>,
    pub title: String,
    pub description: String,
    pub item_type: ItemType,
    pub parent: Option<String>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl NewItem {
    pub fn new(title: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            title: title.into(),
            item_type,
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A field-level update applied atomically by the store.
///
/// `assignee: Some(None)` clears the assignee. Metadata entries with `None`
/// values are removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub status: Option<ItemStatus>,
    pub assignee: Option<Option<String>>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub metadata: BTreeMap<String, Option<String>>,
}

impl ItemUpdate {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_assignee(mut self, assignee: Option<String>) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), Some(value.into()));
        self
    }

    pub fn without_meta(mut self, key: &str) -> Self {
        self.metadata.insert(key.to_string(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assignee.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.metadata.is_empty()
    }

    /// Apply to an in-memory copy of the item.
    pub fn apply_to(&self, item: &mut WorkItem) {
        if let Some(status) = self.status {
            item.status = status;
        }
        if let Some(assignee) = &self.assignee {
            item.assignee = assignee.clone();
        }
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        if let Some(description) = &self.description {
            item.description = description.clone();
        }
        for (key, value) in &self.metadata {
            match value {
                Some(v) => {
                    item.metadata.insert(key.clone(), v.clone());
                }
                None => {
                    item.metadata.remove(key);
                }
            }
        }
    }
}

/// Filter for list queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilter {
    pub parent: Option<String>,
    pub status: Option<ItemStatus>,
    pub item_type: Option<ItemType>,
    pub assignee: Option<String>,
    /// Include closed and tombstoned items. Ignored when `status` is set.
    pub include_closed: bool,
}

impl ListFilter {
    pub fn children_of(parent: &str) -> Self {
        Self {
            parent: Some(parent.to_string()),
            include_closed: true,
            ..Default::default()
        }
    }

    pub fn open_of_type(item_type: ItemType) -> Self {
        Self {
            item_type: Some(item_type),
            ..Default::default()
        }
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        if let Some(parent) = &self.parent {
            if item.parent.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        if let Some(item_type) = self.item_type {
            if item.item_type != item_type {
                return false;
            }
        }
        if let Some(assignee) = &self.assignee {
            if item.assignee.as_deref() != Some(assignee.as_str()) {
                return false;
            }
        }
        match self.status {
            Some(status) => item.status == status,
            None => self.include_closed || !item.is_terminal(),
        }
    }
}

/// Direction of a dependency query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges from the item to what it depends on.
    Down,
    /// Edges from other items onto this one.
    Up,
}
