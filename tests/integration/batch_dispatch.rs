//! Batch dispatcher integration tests.
//!
//! These tests verify per-item rollback isolation, admission control,
//! attach retries, dry runs, pre-flight checks and formula attachment.

use gantry::core::identity::AgentIdentity;
use gantry::core::item::{DependencyKind, ItemStatus, ItemType, NewItem};
use gantry::orchestration::{ConvoyOptions, META_ATTACHED_MOLECULE, META_DISPATCHED_BY};
use gantry::store::StoreClient;
use gantry::Error;

use crate::fixtures::{Harness, POOL, REVIEW_FORMULA};

/// Test: Rollback is isolated to the failing item
/// Given three items and a session manager that fails the second start
/// When the batch is dispatched
/// Then items one and three are hooked and running, item two is released
#[tokio::test]
async fn test_partial_failure_rolls_back_only_that_item() {
    let h = Harness::new();
    let ids = h.tasks(3).await;
    h.sessions.fail_nth_start(2);

    let result = h
        .dispatcher()
        .dispatch(&ids, POOL, &h.options())
        .await
        .unwrap();

    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 1);
    assert!(result.outcomes[0].success);
    assert!(!result.outcomes[1].success);
    assert!(result.outcomes[2].success);
    let message = result.outcomes[1].error_message.as_deref().unwrap();
    assert!(message.contains(&ids[1]));

    assert_eq!(h.workers.removed(), vec!["slit".to_string()]);
    let released = h.item(&ids[1]);
    assert_eq!(released.status, ItemStatus::Open);
    assert_eq!(released.assignee, None);
    assert!(released.meta(META_DISPATCHED_BY).is_none());

    for (idx, name) in [(0, "nux"), (2, "slit")] {
        let item = h.item(&ids[idx]);
        assert_eq!(item.status, ItemStatus::Hooked);
        assert_eq!(
            item.assignee.as_deref(),
            Some(format!("gastown/polecats/{}", name).as_str())
        );
        assert_eq!(item.meta(META_DISPATCHED_BY), Some("mayor/"));
    }
    assert_eq!(
        h.sessions.running(),
        vec!["gt-gastown-nux".to_string(), "gt-gastown-slit".to_string()]
    );
    assert!(h.sessions.killed().is_empty());
}

/// Test: Admission control
/// Given max_concurrent = 1 and sessions that exit after one probe
/// When two items are dispatched
/// Then the second waits and at most one session runs at a time
#[tokio::test]
async fn test_admission_limits_running_sessions() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    h.sessions.exit_after_probes(1);
    let mut opts = h.options();
    opts.max_concurrent = 1;

    let result = h.dispatcher().dispatch(&ids, POOL, &opts).await.unwrap();

    assert_eq!(result.succeeded, 2);
    assert_eq!(h.sessions.started().len(), 2);
    assert_eq!(h.sessions.peak_running(), 1);
}

/// Test: Transient attach failures are retried
/// Given a store that times out the first two updates of an item
/// When it is dispatched
/// Then the third attempt attaches it
#[tokio::test]
async fn test_attach_retries_transient_failures() {
    let h = Harness::new();
    let id = h.task("flaky").await;
    h.store.fail_updates(&id, 2);

    let result = h
        .dispatcher()
        .dispatch(&[id.clone()], POOL, &h.options())
        .await
        .unwrap();

    assert!(result.outcomes[0].success);
    assert_eq!(h.item(&id).status, ItemStatus::Hooked);
}

/// Test: Attach that never succeeds
/// Given a store that keeps timing out updates of an item
/// When it is dispatched
/// Then the item fails, the worker is removed and the item stays open
#[tokio::test]
async fn test_attach_exhaustion_removes_worker() {
    let h = Harness::new();
    let id = h.task("stuck").await;
    h.store.fail_updates(&id, 10);

    let result = h
        .dispatcher()
        .dispatch(&[id.clone()], POOL, &h.options())
        .await
        .unwrap();

    assert!(!result.outcomes[0].success);
    assert_eq!(h.workers.removed(), vec!["nux".to_string()]);
    assert!(h.sessions.started().is_empty());
    let item = h.item(&id);
    assert_eq!(item.status, ItemStatus::Open);
    assert_eq!(item.assignee, None);
}

/// Test: Materialize failure
/// Given a worker whose worktree cannot be created
/// When an item is dispatched to it
/// Then the stored fields are released and the worker removed
#[tokio::test]
async fn test_materialize_failure_rolls_back() {
    let h = Harness::new();
    let id = h.task("no tree").await;
    h.workers.fail_materialize("nux");

    let result = h
        .dispatcher()
        .dispatch(&[id.clone()], POOL, &h.options())
        .await
        .unwrap();

    assert!(!result.outcomes[0].success);
    assert_eq!(h.workers.removed(), vec!["nux".to_string()]);
    assert!(h.workers.active_names(POOL).is_empty());
    assert_eq!(h.item(&id).status, ItemStatus::Open);
    assert!(h.sessions.started().is_empty());
}

/// Test: Dry run
/// Given two open items
/// When a dry run is dispatched
/// Then the plan names workers and sessions without touching anything
#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let h = Harness::new();
    h.write_formula("review", REVIEW_FORMULA);
    let ids = h.tasks(2).await;
    let mutations = h.store.mutations();
    let mut opts = h.options();
    opts.dry_run = true;
    opts.formula = Some("review".to_string());

    let result = h.dispatcher().dispatch(&ids, POOL, &opts).await.unwrap();

    assert!(result.dry_run);
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.outcomes[0].worker_name.as_deref(), Some("nux"));
    assert_eq!(result.outcomes[1].worker_name.as_deref(), Some("slit"));
    assert_eq!(
        result.outcomes[1].session_name.as_deref(),
        Some("gt-gastown-slit")
    );
    assert_eq!(h.store.mutations(), mutations);
    assert!(h.sessions.started().is_empty());
    assert_eq!(h.workers.provisioned_count(), 0);
}

/// Test: Pre-flight rejects an empty request
#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let h = Harness::new();
    let err = h
        .dispatcher()
        .dispatch(&[], POOL, &h.options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

/// Test: Pre-flight rejects missing items before any side effect
#[tokio::test]
async fn test_missing_item_fails_whole_batch() {
    let h = Harness::new();
    let id = h.task("real").await;

    let err = h
        .dispatcher()
        .dispatch(&[id, "gt-404".to_string()], POOL, &h.options())
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(err.to_string().contains("gt-404"));
    assert_eq!(h.workers.provisioned_count(), 0);
}

/// Test: Cross-domain guard
/// Given an item from another domain
/// When it is dispatched without and then with force
/// Then the first call fails pre-flight and the second dispatches it
#[tokio::test]
async fn test_cross_domain_guard_and_force() {
    let h = Harness::new();
    let foreign = h
        .store
        .create(NewItem::new("elsewhere", ItemType::Task).with_prefix("bd"))
        .await
        .unwrap();
    let ids = vec![foreign.id.clone()];

    let err = h
        .dispatcher()
        .dispatch(&ids, POOL, &h.options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("bd"));
    assert_eq!(h.workers.provisioned_count(), 0);

    let mut opts = h.options();
    opts.force = true;
    let result = h.dispatcher().dispatch(&ids, POOL, &opts).await.unwrap();
    assert!(result.outcomes[0].success);
}

/// Test: Terminal items need force
#[tokio::test]
async fn test_closed_item_needs_force() {
    let h = Harness::new();
    let id = h.task("finished").await;
    h.store.close(&id, "done").await.unwrap();

    let err = h
        .dispatcher()
        .dispatch(&[id.clone()], POOL, &h.options())
        .await
        .unwrap_err();
    assert!(err.to_string().contains(&id));

    let mut opts = h.options();
    opts.force = true;
    let result = h
        .dispatcher()
        .dispatch(&[id.clone()], POOL, &opts)
        .await
        .unwrap();
    assert!(result.outcomes[0].success);
    assert_eq!(h.item(&id).status, ItemStatus::Hooked);
}

/// Test: Items held by a live worker
/// Given an item whose assignee still has a running session
/// When it is dispatched alongside a free item
/// Then only the held item fails, without touching its assignment
#[tokio::test]
async fn test_live_assignee_fails_per_item() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    h.assign(&ids[0], ItemStatus::Hooked, "gastown/polecats/toast").await;
    h.sessions.set_running("gt-gastown-toast");

    let result = h
        .dispatcher()
        .dispatch(&ids, POOL, &h.options())
        .await
        .unwrap();

    assert!(!result.outcomes[0].success);
    assert!(result.outcomes[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("gastown/polecats/toast"));
    assert!(result.outcomes[1].success);
    assert_eq!(
        h.item(&ids[0]).assignee.as_deref(),
        Some("gastown/polecats/toast")
    );
}

/// Test: A dead assignee does not hold its item
#[tokio::test]
async fn test_dead_assignee_is_redispatched() {
    let h = Harness::new();
    let id = h.task("abandoned").await;
    h.assign(&id, ItemStatus::InProgress, "gastown/polecats/toast").await;

    let result = h
        .dispatcher()
        .dispatch(&[id.clone()], POOL, &h.options())
        .await
        .unwrap();

    assert!(result.outcomes[0].success);
    assert_eq!(
        h.item(&id).assignee.as_deref(),
        Some("gastown/polecats/nux")
    );
}

/// Test: Auto-convoy
/// Given one untracked item and one already tracked by an open convoy
/// When both are dispatched
/// Then the first gets a new convoy owned by the actor, the second reuses its own
#[tokio::test]
async fn test_auto_convoy_creates_or_reuses() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    let existing = h
        .tracker()
        .create("planned", &ids[1..], ConvoyOptions::default())
        .await
        .unwrap();

    let result = h
        .dispatcher()
        .dispatch(&ids, POOL, &h.options())
        .await
        .unwrap();

    let created = result.outcomes[0].convoy_id.clone().unwrap();
    assert_ne!(created, existing.id);
    let convoy = h.item(&created);
    assert_eq!(convoy.item_type, ItemType::Convoy);
    assert_eq!(convoy.title, "Work: task 1");
    assert_eq!(convoy.meta("owner"), Some("mayor/"));
    assert_eq!(result.outcomes[1].convoy_id.as_deref(), Some(existing.id.as_str()));
}

/// Test: Orphan convoy is cleaned up and dispatch continues
/// Given a store that rejects tracks edges
/// When an item is dispatched with auto-convoy
/// Then the item still dispatches, with no convoy left behind
#[tokio::test]
async fn test_failed_convoy_link_does_not_fail_item() {
    let h = Harness::new();
    let id = h.task("work").await;
    h.store.fail_dependency_kind(DependencyKind::Tracks);

    let result = h
        .dispatcher()
        .dispatch(&[id], POOL, &h.options())
        .await
        .unwrap();

    assert!(result.outcomes[0].success);
    assert_eq!(result.outcomes[0].convoy_id, None);
    assert!(h
        .store
        .all()
        .iter()
        .all(|i| i.item_type != ItemType::Convoy));
    assert_eq!(h.store.call_count("delete"), 1);
}

/// Test: Formula attachment
/// Given a review formula on disk
/// When three items are dispatched with it
/// Then it is loaded once and each item gets its own molecule
#[tokio::test]
async fn test_formula_loaded_once_per_batch() {
    let h = Harness::new();
    h.write_formula("review", REVIEW_FORMULA);
    let ids = h.tasks(3).await;
    let mut opts = h.options();
    opts.formula = Some("review".to_string());
    opts.auto_convoy = false;

    let dispatcher = h.dispatcher();
    let result = dispatcher.dispatch(&ids, POOL, &opts).await.unwrap();

    assert_eq!(result.succeeded, 3);
    assert_eq!(dispatcher.formulas().load_count(), 1);
    let mut molecules: Vec<String> = result
        .outcomes
        .iter()
        .map(|o| o.molecule_id.clone().unwrap())
        .collect();
    for (id, molecule) in ids.iter().zip(&molecules) {
        assert_eq!(h.item(id).meta(META_ATTACHED_MOLECULE), Some(molecule.as_str()));
        assert_eq!(h.item(molecule).item_type, ItemType::Molecule);
    }
    molecules.sort();
    molecules.dedup();
    assert_eq!(molecules.len(), 3);
}

/// Test: Missing formula
/// Given a formula name with no file behind it
/// When items are dispatched with it
/// Then they are attached bare and the lookup is not repeated
#[tokio::test]
async fn test_missing_formula_still_dispatches() {
    let h = Harness::new();
    let ids = h.tasks(2).await;
    let mut opts = h.options();
    opts.formula = Some("nonexistent".to_string());

    let dispatcher = h.dispatcher();
    let result = dispatcher.dispatch(&ids, POOL, &opts).await.unwrap();

    assert_eq!(result.succeeded, 2);
    assert!(result.outcomes.iter().all(|o| o.molecule_id.is_none()));
    assert_eq!(dispatcher.formulas().load_count(), 1);
    assert!(h.item(&ids[0]).meta(META_ATTACHED_MOLECULE).is_none());
}

/// Test: Identity round trip
/// Given a dispatched item
/// When its stored assignee is parsed back
/// Then it yields the session the dispatcher reported
#[tokio::test]
async fn test_assignee_resolves_to_reported_session() {
    let h = Harness::new();
    let id = h.task("work").await;

    let result = h
        .dispatcher()
        .dispatch(&[id.clone()], POOL, &h.options())
        .await
        .unwrap();

    let assignee = h.item(&id).assignee.unwrap();
    let identity = AgentIdentity::parse_path(&assignee).unwrap();
    assert_eq!(
        Some(identity.session_name("gt")),
        result.outcomes[0].session_name
    );
    assert!(h.sessions.running().contains(&identity.session_name("gt")));
}

/// Test: Idle workers are reused and never removed on rollback
#[tokio::test]
async fn test_reused_worker_survives_early_rollback() {
    let h = Harness::new();
    h.workers.add_idle(POOL, "toast");
    let id = h.task("work").await;
    h.store.fail_updates(&id, 10);

    let result = h
        .dispatcher()
        .dispatch(&[id], POOL, &h.options())
        .await
        .unwrap();

    assert_eq!(result.outcomes[0].worker_name.as_deref(), Some("toast"));
    assert!(!result.outcomes[0].success);
    assert!(h.workers.removed().is_empty());
}

/// Test: A worker holds one hook
/// Given an idle worker that still has another item hooked
/// When a new item is dispatched and the pool hands that worker back
/// Then the item fails untouched and the existing hook is kept
#[tokio::test]
async fn test_reused_worker_with_existing_hook_is_refused() {
    let h = Harness::new();
    h.workers.add_idle(POOL, "toast");
    let ids = h.tasks(2).await;
    h.assign(&ids[0], ItemStatus::Hooked, "gastown/polecats/toast").await;

    let result = h
        .dispatcher()
        .dispatch(&ids[1..], POOL, &h.options())
        .await
        .unwrap();

    let outcome = &result.outcomes[0];
    assert!(!outcome.success);
    assert_eq!(outcome.worker_name.as_deref(), Some("toast"));
    assert!(outcome.error_message.as_deref().unwrap().contains(&ids[0]));
    assert!(h.sessions.started().is_empty());
    assert!(h.workers.removed().is_empty());

    let held = h.item(&ids[0]);
    assert_eq!(held.status, ItemStatus::Hooked);
    assert_eq!(held.assignee.as_deref(), Some("gastown/polecats/toast"));
    let refused = h.item(&ids[1]);
    assert_eq!(refused.status, ItemStatus::Open);
    assert_eq!(refused.assignee, None);
}

/// Test: Force overrides an existing hook
#[tokio::test]
async fn test_force_hooks_over_existing_assignment() {
    let h = Harness::new();
    h.workers.add_idle(POOL, "toast");
    let ids = h.tasks(2).await;
    h.assign(&ids[0], ItemStatus::Hooked, "gastown/polecats/toast").await;
    let mut opts = h.options();
    opts.force = true;

    let result = h.dispatcher().dispatch(&ids[1..], POOL, &opts).await.unwrap();

    assert!(result.outcomes[0].success);
    assert_eq!(
        h.item(&ids[1]).assignee.as_deref(),
        Some("gastown/polecats/toast")
    );
}

/// Test: Rollback discards the item's molecule
/// Given the review formula and a session manager that fails the first start
/// When an item is dispatched with the formula
/// Then the molecule root and every step are tombstoned and the item is open
#[tokio::test]
async fn test_session_failure_discards_molecule() {
    let h = Harness::new();
    h.write_formula("review", REVIEW_FORMULA);
    let id = h.task("work").await;
    h.sessions.fail_nth_start(1);
    let mut opts = h.options();
    opts.formula = Some("review".to_string());
    opts.auto_convoy = false;

    let result = h.dispatcher().dispatch(&[id.clone()], POOL, &opts).await.unwrap();

    let outcome = &result.outcomes[0];
    assert!(!outcome.success);
    let root = outcome.molecule_id.clone().unwrap();
    assert_eq!(h.item(&root).status, ItemStatus::Tombstone);
    let steps: Vec<_> = h
        .store
        .all()
        .into_iter()
        .filter(|i| i.parent.as_deref() == Some(root.as_str()))
        .collect();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == ItemStatus::Tombstone));

    let item = h.item(&id);
    assert_eq!(item.status, ItemStatus::Open);
    assert!(item.meta(META_ATTACHED_MOLECULE).is_none());
}
