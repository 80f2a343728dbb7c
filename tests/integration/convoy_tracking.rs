//! Convoy tracker integration tests.
//!
//! These tests verify completion detection, exactly-once notification,
//! reopen on add and stranded detection across live and dead sessions.

use gantry::core::item::{DependencyKind, ItemStatus, ItemType, NewItem, WorkItem};
use gantry::orchestration::{
    CloseOutcome, ConvoyOptions, ReadyReason, ALL_CLOSED_REASON, EMPTY_CONVOY_REASON,
};
use gantry::store::StoreClient;
use gantry::Error;

use crate::fixtures::Harness;

fn owned_by(owner: &str, notify: Option<&str>) -> ConvoyOptions {
    ConvoyOptions {
        owner: Some(owner.to_string()),
        notify: notify.map(str::to_string),
        ..Default::default()
    }
}

/// Test: Closing twice
/// Given a convoy whose only tracked item is closed
/// When check_and_close runs twice
/// Then the first call closes and notifies, the second is a quiet no-op
#[tokio::test]
async fn test_close_twice_notifies_once() {
    let h = Harness::new();
    let item = h.task("work").await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &[item.clone()], owned_by("mayor/", None))
        .await
        .unwrap();
    h.store.close(&item, "done").await.unwrap();

    let first = tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert_eq!(
        first,
        CloseOutcome::Closed {
            reason: ALL_CLOSED_REASON.to_string(),
            notified: vec!["mayor/".to_string()],
        }
    );
    let second = tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert_eq!(second, CloseOutcome::AlreadyClosed);
    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(h.store.close_reason(&convoy.id).as_deref(), Some(ALL_CLOSED_REASON));
}

/// Test: Empty convoy is definitionally complete
/// Given a convoy with zero tracked items
/// When check_and_close runs
/// Then it closes with the empty-convoy reason
#[tokio::test]
async fn test_empty_convoy_closes_with_distinct_reason() {
    let h = Harness::new();
    let tracker = h.tracker();
    let convoy = tracker
        .create(
            "nothing",
            &[],
            ConvoyOptions {
                allow_empty: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert!(matches!(outcome, CloseOutcome::Closed { ref reason, .. } if reason == EMPTY_CONVOY_REASON));
    assert_eq!(h.item(&convoy.id).status, ItemStatus::Closed);
}

/// Test: Empty creation needs explicit opt-in
#[tokio::test]
async fn test_create_without_items_is_rejected() {
    let h = Harness::new();
    let err = h
        .tracker()
        .create("nothing", &[], ConvoyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(h.store.mutations(), 0);
}

/// Test: Open items keep the convoy open
/// Given a convoy tracking one closed and one open item
/// When check_and_close runs
/// Then it reports one open item and does not notify
#[tokio::test]
async fn test_open_items_keep_convoy_open() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &ids, owned_by("mayor/", None))
        .await
        .unwrap();
    h.store.close(&ids[0], "done").await.unwrap();

    let outcome = tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert_eq!(outcome, CloseOutcome::StillOpen { open_count: 1 });
    assert!(h.notifier.sent().is_empty());
}

/// Test: Owner and notify are deduplicated
/// Given owner and notify naming the same address
/// When the convoy closes
/// Then exactly one message is sent
#[tokio::test]
async fn test_owner_and_notify_dedup() {
    let h = Harness::new();
    let item = h.task("work").await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &[item.clone()], owned_by("mayor/", Some("mayor/")))
        .await
        .unwrap();
    h.store.close(&item, "done").await.unwrap();
    tracker.check_and_close(&convoy.id, false).await.unwrap();

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].address, "mayor/");
    assert!(sent[0].subject.contains("batch"));
}

/// Test: Notification failure never fails the close
/// Given an owner whose mailbox rejects messages and a working notify address
/// When the convoy closes
/// Then the close succeeds and only the working address is reported
#[tokio::test]
async fn test_notification_failure_is_not_fatal() {
    let h = Harness::new();
    h.notifier.fail_for("broken/");
    let item = h.task("work").await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &[item.clone()], owned_by("broken/", Some("ops/")))
        .await
        .unwrap();
    h.store.close(&item, "done").await.unwrap();

    let outcome = tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert!(matches!(outcome, CloseOutcome::Closed { ref notified, .. } if notified == &vec!["ops/".to_string()]));
    assert_eq!(h.item(&convoy.id).status, ItemStatus::Closed);
}

/// Test: Description shim
/// Given a legacy convoy carrying Owner/Notify lines only in its description
/// When it closes
/// Then both addresses are notified
#[tokio::test]
async fn test_description_shim_addresses() {
    let h = Harness::new();
    let item = h.task("work").await;
    h.store.close(&item, "done").await.unwrap();
    let convoy = h
        .store
        .create(
            NewItem::new("legacy", ItemType::Convoy)
                .with_description("Tracking one item\nOwner: mayor/\nNotify: gastown/witness\n"),
        )
        .await
        .unwrap();
    h.store
        .dependency_add(&convoy.id, &item, DependencyKind::Tracks)
        .await
        .unwrap();

    h.tracker().check_and_close(&convoy.id, false).await.unwrap();
    let addresses: Vec<String> = h.notifier.sent().into_iter().map(|s| s.address).collect();
    assert_eq!(addresses, vec!["mayor/", "gastown/witness"]);
}

/// Test: Owned convoys are never auto-closed
/// Given an owned convoy whose items are all closed
/// When check_and_close runs
/// Then it stays open, and an explicit close still works
#[tokio::test]
async fn test_owned_convoy_is_not_auto_closed() {
    let h = Harness::new();
    let item = h.task("work").await;
    let tracker = h.tracker();
    let convoy = tracker
        .create(
            "caller managed",
            &[item.clone()],
            ConvoyOptions {
                owned: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.store.close(&item, "done").await.unwrap();

    let outcome = tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert!(matches!(outcome, CloseOutcome::Owned { .. }));
    assert_eq!(h.item(&convoy.id).status, ItemStatus::Open);

    let outcome = tracker.close(&convoy.id, "landed", false).await.unwrap();
    assert!(outcome.closed());
    assert_eq!(h.store.close_reason(&convoy.id).as_deref(), Some("landed"));
}

/// Test: Dry run reports without mutating
#[tokio::test]
async fn test_check_dry_run_does_not_close() {
    let h = Harness::new();
    let item = h.task("work").await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &[item.clone()], owned_by("mayor/", None))
        .await
        .unwrap();
    h.store.close(&item, "done").await.unwrap();
    let mutations = h.store.mutations();

    let outcome = tracker.check_and_close(&convoy.id, true).await.unwrap();
    assert_eq!(
        outcome,
        CloseOutcome::WouldClose {
            reason: ALL_CLOSED_REASON.to_string()
        }
    );
    assert_eq!(h.store.mutations(), mutations);
    assert!(h.notifier.sent().is_empty());
}

/// Test: Cached edge status is never authoritative
/// Given a convoy whose edge snapshot says the item is open
/// When the item closes later
/// Then the live fetch wins and the convoy closes
#[tokio::test]
async fn test_live_status_overrides_cached_edge() {
    let h = Harness::new();
    let item = h.task("work").await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &[item.clone()], ConvoyOptions::default())
        .await
        .unwrap();
    let cached = h.item(&convoy.id);
    assert_eq!(cached.dependencies[0].status, Some(ItemStatus::Open));

    h.store.close(&item, "done").await.unwrap();
    h.store.fail_show_multiple(true);
    let outcome = tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert!(outcome.closed());
}

/// Test: Unfetchable items are stale and keep the convoy open
/// Given a convoy tracking an item in another domain the store cannot see
/// When tracked items are listed and the convoy checked
/// Then the item is flagged stale and the convoy stays open
#[tokio::test]
async fn test_unfetchable_item_is_stale() {
    let h = Harness::new();
    let tracker = h.tracker();
    let convoy = tracker
        .create("cross domain", &["bd-77".to_string()], ConvoyOptions::default())
        .await
        .unwrap();

    let tracked = tracker.tracked_items(&convoy.id).await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert!(tracked[0].stale);
    let outcome = tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert_eq!(outcome, CloseOutcome::StillOpen { open_count: 1 });
}

/// Test: Reopen on add
/// Given a closed convoy
/// When new items are added
/// Then it reopens, unless it is owned
#[tokio::test]
async fn test_add_reopens_closed_convoy() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &ids[..1], ConvoyOptions::default())
        .await
        .unwrap();
    h.store.close(&ids[0], "done").await.unwrap();
    tracker.check_and_close(&convoy.id, false).await.unwrap();
    assert_eq!(h.item(&convoy.id).status, ItemStatus::Closed);

    let added = tracker.add(&convoy.id, &ids[1..]).await.unwrap();
    assert_eq!(added.added, 1);
    assert!(added.reopened);
    assert_eq!(h.item(&convoy.id).status, ItemStatus::Open);

    let owned = tracker
        .create(
            "owned",
            &ids[..1],
            ConvoyOptions {
                owned: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    tracker.close(&owned.id, "done", true).await.unwrap();
    let added = tracker.add(&owned.id, &ids[1..]).await.unwrap();
    assert!(!added.reopened);
    assert_eq!(h.item(&owned.id).status, ItemStatus::Closed);
}

/// Test: Explicit close refuses open items unless forced
#[tokio::test]
async fn test_explicit_close_requires_force_with_open_items() {
    let h = Harness::new();
    let item = h.task("work").await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &[item], owned_by("mayor/", None))
        .await
        .unwrap();

    let err = tracker.close(&convoy.id, "abandon", false).await.unwrap_err();
    assert!(err.to_string().contains(&convoy.id));

    let outcome = tracker.close(&convoy.id, "abandon", true).await.unwrap();
    assert!(outcome.closed());
    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(
        tracker.close(&convoy.id, "again", true).await.unwrap(),
        CloseOutcome::AlreadyClosed
    );
}

/// Test: Orphan convoy cleanup
/// Given a store that rejects tracks edges
/// When a convoy is created
/// Then creation fails and the half-made convoy is deleted
#[tokio::test]
async fn test_failed_edge_deletes_orphan_convoy() {
    let h = Harness::new();
    let item = h.task("work").await;
    h.store.fail_dependency_kind(DependencyKind::Tracks);

    let result = h
        .tracker()
        .create("batch", &[item], ConvoyOptions::default())
        .await;
    assert!(result.is_err());
    assert!(h
        .store
        .all()
        .iter()
        .all(|i| i.item_type != ItemType::Convoy));
    assert_eq!(h.store.call_count("delete"), 1);
}

/// Test: Status and lookup
/// Given a convoy tracking two items, one closed
/// When status is requested
/// Then counts are reported and the convoy is found from either item
#[tokio::test]
async fn test_status_and_find_tracking_convoy() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    let tracker = h.tracker();
    let convoy = tracker
        .create("batch", &ids, ConvoyOptions::default())
        .await
        .unwrap();
    h.store.close(&ids[0], "done").await.unwrap();

    let status = tracker.status(&convoy.id).await.unwrap();
    assert_eq!(status.total_count, 2);
    assert_eq!(status.completed_count, 1);
    assert_eq!(status.tracked_items[1].status, ItemStatus::Open);

    assert_eq!(
        tracker.find_tracking_convoy(&ids[1]).await.unwrap(),
        Some(convoy.id.clone())
    );
    tracker.close(&convoy.id, "done", true).await.unwrap();
    assert_eq!(tracker.find_tracking_convoy(&ids[1]).await.unwrap(), None);
}

/// Test: Readiness sub-cases
/// Given tracked items in every readiness situation
/// When ready reasons are computed
/// Then each sub-case is reported distinctly
#[tokio::test]
async fn test_ready_reasons() {
    let h = Harness::new();
    let ids = h.tasks(7).await;
    h.assign(&ids[1], ItemStatus::InProgress, "gastown/polecats/nux").await;
    h.assign(&ids[2], ItemStatus::InProgress, "gastown/polecats/slit").await;
    h.sessions.set_running("gt-gastown-slit");
    h.store.close(&ids[3], "done").await.unwrap();
    h.assign(&ids[4], ItemStatus::InProgress, "not a path").await;
    h.assign(&ids[5], ItemStatus::Hooked, "gastown/polecats/toast").await;
    h.sessions.fail_probe("gt-gastown-toast");
    let mut blocked = h.item(&ids[6]);
    blocked.blocked_by_count = Some(2);
    h.store.insert(blocked);

    let tracker = h.tracker();
    let convoy = tracker
        .create("everything", &ids, ConvoyOptions::default())
        .await
        .unwrap();
    let tracked = tracker.tracked_items(&convoy.id).await.unwrap();
    let reasons = tracker.ready_reasons(&tracked).await;
    assert_eq!(
        reasons,
        vec![
            ReadyReason::Unassigned,
            ReadyReason::DeadSession,
            ReadyReason::LiveSession,
            ReadyReason::Terminal,
            ReadyReason::UnresolvableAssignee,
            ReadyReason::LivenessError,
            ReadyReason::Blocked,
        ]
    );
    assert!(tracker.is_ready(&tracked[1]).await);
    assert!(!tracker.is_ready(&tracked[2]).await);
}

/// Test: Blocked from live dependency edges
/// Given an item blocked by an open item and no blocked_by_count
/// When it is tracked
/// Then it is blocked until the blocker closes
#[tokio::test]
async fn test_blocked_from_dependency_edges() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    h.store
        .dependency_add(&ids[1], &ids[0], DependencyKind::Blocks)
        .await
        .unwrap();
    let tracker = h.tracker();
    let convoy = tracker
        .create("gated", &ids[1..], ConvoyOptions::default())
        .await
        .unwrap();
    assert!(tracker.tracked_items(&convoy.id).await.unwrap()[0].blocked);

    h.store.close(&ids[0], "done").await.unwrap();
    let cached = h.item(&ids[1]);
    assert_eq!(cached.dependencies[0].status, Some(ItemStatus::Open));
    assert!(!tracker.tracked_items(&convoy.id).await.unwrap()[0].blocked);
}

/// Test: Unfetchable blocker
/// Given an item blocked by an id the store cannot resolve
/// When it is tracked
/// Then it stays blocked
#[tokio::test]
async fn test_unfetchable_blocker_counts_as_blocking() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    h.store
        .dependency_add(&ids[1], &ids[0], DependencyKind::Blocks)
        .await
        .unwrap();
    let tracker = h.tracker();
    let convoy = tracker
        .create("gated", &ids[1..], ConvoyOptions::default())
        .await
        .unwrap();
    h.store.delete(&ids[0]).await.unwrap();

    assert!(tracker.tracked_items(&convoy.id).await.unwrap()[0].blocked);
}

/// Test: Stranded once a blocker closes
/// Given a tracked item whose only blocker closes after the edge was recorded
/// When stranded convoys are scanned
/// Then the item is ready and its convoy is reported
#[tokio::test]
async fn test_stranded_after_blocker_closes() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    h.store
        .dependency_add(&ids[1], &ids[0], DependencyKind::Blocks)
        .await
        .unwrap();
    let tracker = h.tracker();
    let convoy = tracker
        .create("gated", &ids[1..], ConvoyOptions::default())
        .await
        .unwrap();
    assert!(tracker.stranded().await.unwrap().is_empty());

    h.store.close(&ids[0], "done").await.unwrap();

    let stranded = tracker.stranded().await.unwrap();
    assert_eq!(stranded.len(), 1);
    assert_eq!(stranded[0].id, convoy.id);
    assert_eq!(stranded[0].ready_item_ids, vec![ids[1].clone()]);
}

/// Test: Stranded convoys
/// Given open, dead-session, closed and live-session items across convoys
/// When stranded convoys are scanned
/// Then only convoys with ready items are reported, with those items
#[tokio::test]
async fn test_stranded_detection() {
    let h = Harness::new();
    let ids = h.tasks(4).await;
    h.assign(&ids[1], ItemStatus::InProgress, "gastown/polecats/nux").await;
    h.store.close(&ids[2], "done").await.unwrap();
    h.assign(&ids[3], ItemStatus::InProgress, "gastown/polecats/slit").await;
    h.sessions.set_running("gt-gastown-slit");

    let tracker = h.tracker();
    let stranded_convoy = tracker
        .create("stranded", &ids[..3], ConvoyOptions::default())
        .await
        .unwrap();
    tracker
        .create("healthy", &ids[3..], ConvoyOptions::default())
        .await
        .unwrap();

    let stranded = tracker.stranded().await.unwrap();
    assert_eq!(stranded.len(), 1);
    assert_eq!(stranded[0].id, stranded_convoy.id);
    assert_eq!(stranded[0].ready_count, 2);
    assert_eq!(stranded[0].ready_item_ids, vec![ids[0].clone(), ids[1].clone()]);
}

/// Test: Sweep closes finished convoys only
#[tokio::test]
async fn test_check_all_sweeps_open_convoys() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    let tracker = h.tracker();
    let done = tracker
        .create("done", &ids[..1], ConvoyOptions::default())
        .await
        .unwrap();
    let open = tracker
        .create("open", &ids[1..], ConvoyOptions::default())
        .await
        .unwrap();
    h.store.close(&ids[0], "done").await.unwrap();

    let checks = tracker.check_all(false).await.unwrap();
    assert_eq!(checks.len(), 2);
    let by_id = |id: &str| checks.iter().find(|c| c.convoy_id == id).map(|c| c.outcome.clone());
    assert!(by_id(&done.id).unwrap().closed());
    assert_eq!(by_id(&open.id), Some(CloseOutcome::StillOpen { open_count: 1 }));

    let remaining: Vec<WorkItem> = tracker.list_open().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, open.id);
}
