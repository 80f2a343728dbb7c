//! Convoy tracking.
//!
//! A convoy is a work item of type `convoy` whose `tracks` edges point at
//! the items it aggregates. Tracked items may live in other storage
//! domains, so the status cached on an edge is only a hint: every
//! completion decision re-fetches the live record.

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use crate::config::TrackerConfig;
use crate::core::identity::AgentIdentity;
use crate::core::item::{
    DependencyKind, Direction, ItemStatus, ItemType, ItemUpdate, ListFilter, NewItem, WorkItem,
};
use crate::notify::Notifier;
use crate::session::SessionManager;
use crate::store::{fetch_fresh, StoreClient};
use crate::{glog, glog_debug, glog_warn, Error, Result};

use super::liveness::LivenessProber;

pub const EMPTY_CONVOY_REASON: &str = "empty convoy: no tracked items";
pub const ALL_CLOSED_REASON: &str = "all tracked items closed";

pub const META_OWNER: &str = "owner";
pub const META_NOTIFY: &str = "notify";
pub const META_OWNED: &str = "owned";

/// One tracked item merged from the convoy edge and a live fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedItem {
    pub id: String,
    pub title: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub blocked: bool,
    /// Live fetch failed; status is the edge's cached value.
    pub stale: bool,
}

impl TrackedItem {
    /// Stale items never count as complete.
    pub fn is_complete(&self) -> bool {
        !self.stale && self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CloseOutcome {
    AlreadyClosed,
    StillOpen { open_count: usize },
    /// Complete, but the caller manages the convoy's lifecycle.
    Owned { open_count: usize },
    WouldClose { reason: String },
    Closed { reason: String, notified: Vec<String> },
}

impl CloseOutcome {
    pub fn closed(&self) -> bool {
        matches!(self, CloseOutcome::Closed { .. } | CloseOutcome::AlreadyClosed)
    }
}

/// Why a tracked item is, or is not, ready for a new worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyReason {
    Unassigned,
    /// Assignee present but no session name can be derived from it.
    UnresolvableAssignee,
    /// The session manager could not answer; treated as dead.
    LivenessError,
    DeadSession,
    LiveSession,
    Terminal,
    Blocked,
}

impl ReadyReason {
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            ReadyReason::Unassigned
                | ReadyReason::UnresolvableAssignee
                | ReadyReason::LivenessError
                | ReadyReason::DeadSession
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvoyOptions {
    pub owner: Option<String>,
    pub notify: Option<String>,
    pub owned: bool,
    pub allow_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    pub added: usize,
    pub reopened: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvoyStatus {
    pub id: String,
    pub title: String,
    pub status: ItemStatus,
    pub owned: bool,
    pub tracked_items: Vec<TrackedItem>,
    pub completed_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvoyCheck {
    pub convoy_id: String,
    #[serde(flatten)]
    pub outcome: CloseOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrandedConvoy {
    pub id: String,
    pub title: String,
    pub ready_count: usize,
    pub ready_item_ids: Vec<String>,
}

fn shim_regex() -> Option<&'static Regex> {
    static SHIM: OnceLock<Option<Regex>> = OnceLock::new();
    SHIM.get_or_init(|| Regex::new(r"(?mi)^\s*(owner|notify|owned):\s*(\S+)").ok())
        .as_ref()
}

/// Value of a `Key: value` line in a convoy description.
fn described(description: &str, key: &str) -> Option<String> {
    shim_regex()?
        .captures_iter(description)
        .find(|c| c[1].eq_ignore_ascii_case(key))
        .map(|c| c[2].to_string())
}

/// Owner address: metadata first, then an `Owner:` description line.
pub fn convoy_owner(convoy: &WorkItem) -> Option<String> {
    convoy
        .meta(META_OWNER)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| described(&convoy.description, META_OWNER))
}

pub fn convoy_notify(convoy: &WorkItem) -> Option<String> {
    convoy
        .meta(META_NOTIFY)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| described(&convoy.description, META_NOTIFY))
}

pub fn is_owned(convoy: &WorkItem) -> bool {
    match convoy.meta(META_OWNED) {
        Some(v) => v == "true",
        None => described(&convoy.description, META_OWNED)
            .map(|v| v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false),
    }
}

/// Owner and notify addresses, deduplicated in that order.
pub fn notify_addresses(convoy: &WorkItem) -> Vec<String> {
    let mut seen = HashSet::new();
    [convoy_owner(convoy), convoy_notify(convoy)]
        .into_iter()
        .flatten()
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

pub struct ConvoyTracker {
    store: Arc<dyn StoreClient>,
    sessions: Arc<dyn SessionManager>,
    notifier: Arc<dyn Notifier>,
    prober: LivenessProber,
    convoy_prefix: Option<String>,
}

impl ConvoyTracker {
    pub fn new(
        store: Arc<dyn StoreClient>,
        sessions: Arc<dyn SessionManager>,
        notifier: Arc<dyn Notifier>,
        config: &TrackerConfig,
    ) -> Self {
        let prober = LivenessProber::new(Arc::clone(&sessions), config.liveness_parallelism);
        Self {
            store,
            sessions,
            notifier,
            prober,
            convoy_prefix: config.convoy_prefix.clone(),
        }
    }

    async fn load_convoy(&self, convoy_id: &str) -> Result<WorkItem> {
        let convoy = self.store.show(convoy_id).await?;
        if convoy.item_type != ItemType::Convoy {
            return Err(Error::Validation(format!(
                "{} is a {}, not a convoy",
                convoy_id,
                convoy.item_type.as_str()
            )));
        }
        Ok(convoy)
    }

    /// Tracked items with live status.
    pub async fn tracked_items(&self, convoy_id: &str) -> Result<Vec<TrackedItem>> {
        let edges = self
            .store
            .dependency_list(convoy_id, Direction::Down, Some(DependencyKind::Tracks))
            .await?;
        let ids: Vec<String> = edges.iter().map(|e| e.id.clone()).collect();
        let fresh = fetch_fresh(self.store.as_ref(), &ids).await;

        let mut tracked = Vec::with_capacity(edges.len());
        for edge in edges {
            match fresh.items.get(&edge.id) {
                Some(item) => tracked.push(TrackedItem {
                    id: item.id.clone(),
                    title: item.title.clone(),
                    status: item.status,
                    assignee: item.assignee.clone(),
                    blocked: self.is_blocked(item).await,
                    stale: false,
                }),
                None => {
                    glog_warn!(
                        "convoy {}: tracked item {} unavailable, using cached status",
                        convoy_id,
                        edge.id
                    );
                    tracked.push(TrackedItem {
                        title: edge.title.clone().unwrap_or_default(),
                        status: edge.status.unwrap_or_default(),
                        id: edge.id,
                        assignee: None,
                        blocked: false,
                        stale: true,
                    });
                }
            }
        }
        Ok(tracked)
    }

    /// `blocked_by_count` when the store reports it, otherwise any `blocks`
    /// target that is not terminal in a live fetch. Edge statuses are
    /// snapshots and are ignored. A target that cannot be fetched counts as
    /// blocking.
    async fn is_blocked(&self, item: &WorkItem) -> bool {
        if let Some(count) = item.blocked_by_count {
            return count > 0;
        }
        let blockers: Vec<String> = item.blocking_deps().map(|d| d.id.clone()).collect();
        if blockers.is_empty() {
            return false;
        }
        let fresh = fetch_fresh(self.store.as_ref(), &blockers).await;
        if !fresh.missing.is_empty() {
            glog_debug!(
                "item {}: blockers {} unavailable, treating as blocked",
                item.id,
                fresh.missing.join(", ")
            );
            return true;
        }
        fresh.items.values().any(|b| !b.is_terminal())
    }

    /// Close the convoy if every tracked item is terminal.
    pub async fn check_and_close(&self, convoy_id: &str, dry_run: bool) -> Result<CloseOutcome> {
        let convoy = self.load_convoy(convoy_id).await?;
        if convoy.is_terminal() {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        let tracked = self.tracked_items(convoy_id).await?;
        let open_count = tracked.iter().filter(|t| !t.is_complete()).count();
        if open_count > 0 {
            return Ok(CloseOutcome::StillOpen { open_count });
        }
        if is_owned(&convoy) {
            glog_debug!("convoy {} complete but owned, leaving open", convoy_id);
            return Ok(CloseOutcome::Owned { open_count });
        }
        let reason = if tracked.is_empty() {
            EMPTY_CONVOY_REASON
        } else {
            ALL_CLOSED_REASON
        };
        if dry_run {
            return Ok(CloseOutcome::WouldClose {
                reason: reason.to_string(),
            });
        }
        self.close_and_notify(&convoy, reason).await
    }

    async fn close_and_notify(&self, convoy: &WorkItem, reason: &str) -> Result<CloseOutcome> {
        self.store.close(&convoy.id, reason).await?;
        glog!("convoy {} closed: {}", convoy.id, reason);
        let notified = self.notify_closed(convoy, reason).await;
        Ok(CloseOutcome::Closed {
            reason: reason.to_string(),
            notified,
        })
    }

    /// One message per distinct address. Failures are logged only.
    async fn notify_closed(&self, convoy: &WorkItem, reason: &str) -> Vec<String> {
        let subject = format!("Convoy landed: {}", convoy.title);
        let body = format!("Convoy {} closed: {}", convoy.id, reason);
        let mut delivered = Vec::new();
        for address in notify_addresses(convoy) {
            match self.notifier.send(&address, &subject, &body).await {
                Ok(()) => delivered.push(address),
                Err(e) => glog_warn!(
                    "convoy {}: notification to {} failed: {}",
                    convoy.id,
                    address,
                    e
                ),
            }
        }
        delivered
    }

    pub async fn ready_reason(&self, item: &TrackedItem) -> ReadyReason {
        self.ready_reasons(std::slice::from_ref(item))
            .await
            .into_iter()
            .next()
            .unwrap_or(ReadyReason::Terminal)
    }

    pub async fn is_ready(&self, item: &TrackedItem) -> bool {
        self.ready_reason(item).await.is_ready()
    }

    /// Readiness for many items; session lookups go through the prober.
    pub async fn ready_reasons(&self, items: &[TrackedItem]) -> Vec<ReadyReason> {
        let mut reasons: Vec<Option<ReadyReason>> = Vec::with_capacity(items.len());
        let mut to_probe: Vec<(usize, String)> = Vec::new();
        for (slot, item) in items.iter().enumerate() {
            let reason = if item.status.is_terminal() {
                Some(ReadyReason::Terminal)
            } else if item.blocked {
                Some(ReadyReason::Blocked)
            } else {
                match item.assignee.as_deref().filter(|a| !a.is_empty()) {
                    None => Some(ReadyReason::Unassigned),
                    Some(assignee) => match AgentIdentity::parse_path(assignee) {
                        Ok(identity) => {
                            to_probe.push((slot, self.sessions.session_name(&identity)));
                            None
                        }
                        Err(e) => {
                            glog_warn!(
                                "item {}: assignee {} has no session name ({}), treating as ready",
                                item.id,
                                assignee,
                                e
                            );
                            Some(ReadyReason::UnresolvableAssignee)
                        }
                    },
                }
            };
            reasons.push(reason);
        }

        let names: Vec<String> = to_probe.iter().map(|(_, n)| n.clone()).collect();
        let probes = self.prober.probe(&names).await;
        for ((slot, _), probe) in to_probe.into_iter().zip(probes) {
            reasons[slot] = Some(match probe.running {
                Ok(true) => ReadyReason::LiveSession,
                Ok(false) => ReadyReason::DeadSession,
                Err(e) => {
                    glog_warn!(
                        "item {}: liveness of {} unknown ({}), treating as ready",
                        items[slot].id,
                        probe.name,
                        e
                    );
                    ReadyReason::LivenessError
                }
            });
        }
        reasons
            .into_iter()
            .map(|r| r.unwrap_or(ReadyReason::LivenessError))
            .collect()
    }

    pub async fn create(
        &self,
        title: &str,
        tracked_ids: &[String],
        options: ConvoyOptions,
    ) -> Result<WorkItem> {
        if tracked_ids.is_empty() && !options.allow_empty {
            return Err(Error::Validation(format!(
                "convoy '{}' must track at least one item",
                title
            )));
        }
        let mut new = NewItem::new(title, ItemType::Convoy)
            .with_description(format!("Convoy tracking {} items", tracked_ids.len()));
        if let Some(prefix) = &self.convoy_prefix {
            new = new.with_prefix(prefix);
        }
        if let Some(owner) = options.owner {
            new = new.with_meta(META_OWNER, owner);
        }
        if let Some(notify) = options.notify {
            new = new.with_meta(META_NOTIFY, notify);
        }
        if options.owned {
            new = new.with_meta(META_OWNED, "true");
        }
        let convoy = self.store.create(new).await?;

        for id in tracked_ids {
            if let Err(e) = self
                .store
                .dependency_add(&convoy.id, id, DependencyKind::Tracks)
                .await
            {
                glog_warn!(
                    "convoy {}: tracking {} failed, deleting orphan: {}",
                    convoy.id,
                    id,
                    e
                );
                if let Err(del) = self.store.delete(&convoy.id).await {
                    glog_warn!("convoy {}: orphan delete failed: {}", convoy.id, del);
                }
                return Err(e);
            }
        }
        glog!("convoy {} created tracking {} items", convoy.id, tracked_ids.len());
        Ok(convoy)
    }

    /// Track more items. A closed convoy is reopened unless it is owned.
    pub async fn add(&self, convoy_id: &str, tracked_ids: &[String]) -> Result<AddOutcome> {
        let convoy = self.load_convoy(convoy_id).await?;
        for id in tracked_ids {
            self.store
                .dependency_add(convoy_id, id, DependencyKind::Tracks)
                .await?;
        }
        let reopened = !tracked_ids.is_empty() && convoy.is_terminal() && !is_owned(&convoy);
        if reopened {
            self.store
                .update(convoy_id, &ItemUpdate::status(ItemStatus::Open))
                .await?;
            glog!("convoy {} reopened by new tracked items", convoy_id);
        }
        Ok(AddOutcome {
            added: tracked_ids.len(),
            reopened,
        })
    }

    /// Explicit close. Refuses while items are open unless `force`.
    pub async fn close(&self, convoy_id: &str, reason: &str, force: bool) -> Result<CloseOutcome> {
        let convoy = self.load_convoy(convoy_id).await?;
        if convoy.is_terminal() {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        if !force {
            let open_count = self
                .tracked_items(convoy_id)
                .await?
                .iter()
                .filter(|t| !t.is_complete())
                .count();
            if open_count > 0 {
                return Err(Error::Validation(format!(
                    "convoy {} still has {} open items",
                    convoy_id, open_count
                )));
            }
        }
        self.close_and_notify(&convoy, reason).await
    }

    pub async fn status(&self, convoy_id: &str) -> Result<ConvoyStatus> {
        let convoy = self.load_convoy(convoy_id).await?;
        let tracked_items = self.tracked_items(convoy_id).await?;
        let completed_count = tracked_items.iter().filter(|t| t.is_complete()).count();
        Ok(ConvoyStatus {
            owned: is_owned(&convoy),
            id: convoy.id,
            title: convoy.title,
            status: convoy.status,
            total_count: tracked_items.len(),
            completed_count,
            tracked_items,
        })
    }

    /// An open convoy already tracking `item_id`, if any.
    pub async fn find_tracking_convoy(&self, item_id: &str) -> Result<Option<String>> {
        let sources: Vec<String> = self
            .store
            .dependency_list(item_id, Direction::Up, Some(DependencyKind::Tracks))
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let fresh = fetch_fresh(self.store.as_ref(), &sources).await;
        Ok(sources.into_iter().find(|id| {
            fresh
                .items
                .get(id)
                .map(|c| c.item_type == ItemType::Convoy && !c.is_terminal())
                .unwrap_or(false)
        }))
    }

    pub async fn list_open(&self) -> Result<Vec<WorkItem>> {
        self.store
            .list(&ListFilter::open_of_type(ItemType::Convoy))
            .await
    }

    /// Check every open convoy. A convoy whose check fails is skipped.
    pub async fn check_all(&self, dry_run: bool) -> Result<Vec<ConvoyCheck>> {
        let mut checks = Vec::new();
        for convoy in self.list_open().await? {
            match self.check_and_close(&convoy.id, dry_run).await {
                Ok(outcome) => checks.push(ConvoyCheck {
                    convoy_id: convoy.id,
                    outcome,
                }),
                Err(e) => glog_warn!("convoy {} check skipped: {}", convoy.id, e),
            }
        }
        Ok(checks)
    }

    /// Open convoys with at least one item ready for a worker.
    pub async fn stranded(&self) -> Result<Vec<StrandedConvoy>> {
        let mut stranded = Vec::new();
        for convoy in self.list_open().await? {
            let tracked = match self.tracked_items(&convoy.id).await {
                Ok(tracked) => tracked,
                Err(e) => {
                    glog_warn!("convoy {} skipped in stranded scan: {}", convoy.id, e);
                    continue;
                }
            };
            let reasons = self.ready_reasons(&tracked).await;
            let ready_item_ids: Vec<String> = tracked
                .into_iter()
                .zip(reasons)
                .filter(|(_, r)| r.is_ready())
                .map(|(t, _)| t.id)
                .collect();
            if !ready_item_ids.is_empty() {
                stranded.push(StrandedConvoy {
                    id: convoy.id,
                    title: convoy.title,
                    ready_count: ready_item_ids.len(),
                    ready_item_ids,
                });
            }
        }
        Ok(stranded)
    }
}
