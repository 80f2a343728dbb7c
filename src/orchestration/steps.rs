//! DAG step executor.
//!
//! Walks one work group (every item sharing a `parent`) and decides which
//! steps may run next. Readiness only ever looks at `blocks` edges; a
//! blocker outside the group never counts as closed.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::dag::{StepGraph, StepNode};
use crate::core::item::{ItemStatus, ItemUpdate, ListFilter, WorkItem};
use crate::store::{fetch_fresh, StoreClient};
use crate::{glog, glog_debug, glog_warn, Error, Result};

/// Close reason recorded on completed steps.
pub const STEP_DONE_REASON: &str = "step complete";
pub const GROUP_DONE_REASON: &str = "all steps complete";

/// Readiness of one group.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyLevel {
    pub group_id: String,
    pub ready: Vec<WorkItem>,
    pub all_complete: bool,
}

impl ReadyLevel {
    fn complete(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            ready: Vec::new(),
            all_complete: true,
        }
    }

    fn waiting(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            ready: Vec::new(),
            all_complete: false,
        }
    }

    pub fn ready_ids(&self) -> Vec<&str> {
        self.ready.iter().map(|i| i.id.as_str()).collect()
    }
}

/// What happens after a step closes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "advance", rename_all = "snake_case")]
pub enum StepAdvance {
    /// Every step is closed; the group itself is done.
    GroupComplete { group_id: String },
    /// One step is ready; the same worker carries on with it.
    Continue { group_id: String, next: WorkItem },
    /// Several steps are ready and have been marked in progress.
    FanOut { group_id: String, ready: Vec<WorkItem> },
    /// Nothing ready yet, some steps still open elsewhere.
    Blocked { group_id: String },
}

impl StepAdvance {
    pub fn group_id(&self) -> &str {
        match self {
            StepAdvance::GroupComplete { group_id }
            | StepAdvance::Continue { group_id, .. }
            | StepAdvance::FanOut { group_id, .. }
            | StepAdvance::Blocked { group_id } => group_id,
        }
    }
}

/// Group id for a step: the `parent` field, or the `<group>.<n>` id shape.
pub fn group_of(step: &WorkItem) -> Option<String> {
    if let Some(parent) = step.parent.as_deref().filter(|p| !p.is_empty()) {
        return Some(parent.to_string());
    }
    let (group, n) = step.id.rsplit_once('.')?;
    (!group.is_empty() && !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .then(|| group.to_string())
}

pub struct StepExecutor {
    store: Arc<dyn StoreClient>,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    pub async fn ready_level(&self, group_id: &str) -> Result<ReadyLevel> {
        self.evaluate(group_id, None).await
    }

    /// Readiness of `group_id`, optionally pretending `assume_closed` is
    /// already closed.
    async fn evaluate(&self, group_id: &str, assume_closed: Option<&str>) -> Result<ReadyLevel> {
        let mut members = self.store.list(&ListFilter::children_of(group_id)).await?;
        if let Some(id) = assume_closed {
            for member in members.iter_mut().filter(|m| m.id == id) {
                member.status = ItemStatus::Closed;
            }
        }
        if members.is_empty() {
            glog_debug!("group {} has no steps", group_id);
            return Ok(ReadyLevel::complete(group_id));
        }
        if members.iter().all(WorkItem::is_terminal) {
            return Ok(ReadyLevel::complete(group_id));
        }

        let candidates: Vec<String> = members
            .iter()
            .filter(|m| m.status == ItemStatus::Open)
            .map(|m| m.id.clone())
            .collect();
        if candidates.is_empty() {
            glog_debug!("group {} has no open steps, waiting", group_id);
            return Ok(ReadyLevel::waiting(group_id));
        }

        // List results carry no edges; only candidates need them.
        let fetched = fetch_fresh(self.store.as_ref(), &candidates).await;
        for id in &fetched.missing {
            glog_warn!("step {} could not be fetched, treating as not ready", id);
        }
        let mut detailed = fetched.items;
        let snapshot: Vec<WorkItem> = members
            .into_iter()
            .filter_map(|member| match detailed.remove(&member.id) {
                Some(mut full) => {
                    full.status = member.status;
                    Some(full)
                }
                None if candidates.contains(&member.id) => None,
                None => Some(member),
            })
            .collect();

        let graph = StepGraph::from_items(&snapshot);
        let by_id: HashMap<&str, &WorkItem> =
            snapshot.iter().map(|i| (i.id.as_str(), i)).collect();
        let ready = graph
            .ready_steps()
            .into_iter()
            .filter_map(|node| by_id.get(node.id.as_str()).map(|i| (*i).clone()))
            .collect();

        Ok(ReadyLevel {
            group_id: group_id.to_string(),
            ready,
            all_complete: false,
        })
    }

    /// Close `step_id` and work out what the group does next.
    ///
    /// - one ready step: it goes `in_progress` under the completed step's
    ///   assignee, so the same worker carries on
    /// - several: all are marked `in_progress`, unassigned
    /// - group complete: the group root is closed
    pub async fn complete_step(&self, step_id: &str) -> Result<StepAdvance> {
        let step = self.store.show(step_id).await?;
        let group_id = group_of(&step)
            .ok_or_else(|| Error::Validation(format!("step {} belongs to no group", step_id)))?;

        if !step.is_terminal() {
            self.store.close(step_id, STEP_DONE_REASON).await?;
        }
        glog!("step {} closed in group {}", step_id, group_id);

        let level = self.ready_level(&group_id).await?;
        let mut advance = self.decide(level);
        match &mut advance {
            StepAdvance::Continue { next, .. } => {
                let update = ItemUpdate::status(ItemStatus::InProgress)
                    .with_assignee(step.assignee.clone());
                self.store.update(&next.id, &update).await?;
                update.apply_to(next);
                glog!(
                    "group {} continues with {} under {}",
                    group_id,
                    next.id,
                    step.assignee.as_deref().unwrap_or("no assignee")
                );
            }
            StepAdvance::FanOut { ready, .. } => {
                let update = ItemUpdate::status(ItemStatus::InProgress);
                for item in ready.iter_mut() {
                    self.store.update(&item.id, &update).await?;
                    update.apply_to(item);
                }
                glog!("group {} fans out to {} steps", group_id, ready.len());
            }
            StepAdvance::GroupComplete { .. } => self.close_group(&group_id).await?,
            StepAdvance::Blocked { .. } => {}
        }
        Ok(advance)
    }

    /// Close the group root if the store has one. Groups named only by the
    /// `<group>.<n>` id shape may have no root record.
    async fn close_group(&self, group_id: &str) -> Result<()> {
        match self.store.show(group_id).await {
            Ok(root) if root.is_terminal() => Ok(()),
            Ok(_) => {
                self.store.close(group_id, GROUP_DONE_REASON).await?;
                glog!("group {} complete", group_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                glog_debug!("group {} has no root record to close", group_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Same decision as [`complete_step`](Self::complete_step) without
    /// writing anything.
    pub async fn preview_complete(&self, step_id: &str) -> Result<StepAdvance> {
        let step = self.store.show(step_id).await?;
        let group_id = group_of(&step)
            .ok_or_else(|| Error::Validation(format!("step {} belongs to no group", step_id)))?;
        let level = self.evaluate(&group_id, Some(step_id)).await?;
        Ok(self.decide(level))
    }

    fn decide(&self, level: ReadyLevel) -> StepAdvance {
        let ReadyLevel {
            group_id,
            mut ready,
            all_complete,
        } = level;
        if all_complete {
            return StepAdvance::GroupComplete { group_id };
        }
        match ready.len() {
            0 => {
                glog_debug!("group {} blocked, no step ready", group_id);
                StepAdvance::Blocked { group_id }
            }
            1 => StepAdvance::Continue {
                group_id,
                next: ready.remove(0),
            },
            _ => StepAdvance::FanOut { group_id, ready },
        }
    }

    /// Members of the group in dependency order, for display.
    pub async fn group_order(&self, group_id: &str) -> Result<Vec<StepNode>> {
        let ids: Vec<String> = self
            .store
            .list(&ListFilter::children_of(group_id))
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();
        let fetched = fetch_fresh(self.store.as_ref(), &ids).await;
        let members: Vec<&WorkItem> = ids.iter().filter_map(|id| fetched.items.get(id)).collect();
        let graph = StepGraph::from_items(members);
        Ok(graph.topological_order()?.into_iter().cloned().collect())
    }
}
