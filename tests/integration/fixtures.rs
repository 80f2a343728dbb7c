//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A harness wiring every port to its in-memory fake
//! - Seeding work items and groups
//! - Temporary formula directories and git repositories

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use gantry::config::{Config, PoolConfig};
use gantry::core::item::{DependencyKind, ItemStatus, ItemType, ItemUpdate, NewItem, WorkItem};
use gantry::notify::MemoryNotifier;
use gantry::orchestration::{
    BatchDispatcher, ConvoyTracker, DispatchOptions, FormulaCatalog, StepExecutor,
};
use gantry::session::MemorySessions;
use gantry::store::{MemoryStore, StoreClient};
use gantry::workers::{MemoryWorkers, WorkerPool};

pub const POOL: &str = "gastown";
pub const ROSTER: &[&str] = &["nux", "slit", "toast", "dag"];

pub const REVIEW_FORMULA: &str = r#"
name = "review"
description = "Implement, test, land"

[[steps]]
id = "implement"
title = "Implement"

[[steps]]
id = "test"
title = "Test"
needs = ["implement"]

[[steps]]
id = "land"
title = "Land"
needs = ["test"]
"#;

/// Configuration with a `gastown` pool for `gt-` items and fast retries.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.dispatch.attach_backoff_ms = 1;
    config.dispatch.admission_poll_ms = 1;
    config.dispatch.admission_max_backoff_ms = 4;
    config.dispatch.admission_timeout_secs = 5;
    config.pools.insert(
        POOL.to_string(),
        PoolConfig {
            repo: None,
            domain_prefix: Some("gt".to_string()),
            names: ROSTER.iter().map(|s| s.to_string()).collect(),
        },
    );
    config
}

/// Every port backed by a fake, plus a formula directory.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub sessions: Arc<MemorySessions>,
    pub workers: Arc<MemoryWorkers>,
    pub notifier: Arc<MemoryNotifier>,
    pub config: Config,
    pub formula_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new("gt")),
            sessions: Arc::new(MemorySessions::new("gt")),
            workers: Arc::new(MemoryWorkers::new(ROSTER)),
            notifier: Arc::new(MemoryNotifier::new()),
            config: test_config(),
            formula_dir: TempDir::new().expect("Failed to create formula directory"),
        }
    }

    pub fn dispatcher(&self) -> BatchDispatcher {
        self.dispatcher_with(self.workers.clone())
    }

    pub fn dispatcher_with(&self, workers: Arc<dyn WorkerPool>) -> BatchDispatcher {
        BatchDispatcher::with_formulas(
            self.store.clone(),
            self.sessions.clone(),
            workers,
            self.notifier.clone(),
            self.config.clone(),
            FormulaCatalog::new(self.formula_dir.path()),
        )
        .with_actor("mayor/")
    }

    pub fn tracker(&self) -> ConvoyTracker {
        ConvoyTracker::new(
            self.store.clone(),
            self.sessions.clone(),
            self.notifier.clone(),
            &self.config.tracker,
        )
    }

    pub fn executor(&self) -> StepExecutor {
        StepExecutor::new(self.store.clone())
    }

    pub fn options(&self) -> DispatchOptions {
        DispatchOptions::from_config(&self.config.dispatch)
    }

    pub fn write_formula(&self, name: &str, raw: &str) {
        std::fs::write(
            self.formula_dir.path().join(format!("{}.formula.toml", name)),
            raw,
        )
        .expect("Failed to write formula");
    }

    pub async fn task(&self, title: &str) -> String {
        self.store
            .create(NewItem::new(title, ItemType::Task))
            .await
            .expect("Failed to create task")
            .id
    }

    pub async fn tasks(&self, n: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            ids.push(self.task(&format!("task {}", i + 1)).await);
        }
        ids
    }

    pub async fn set_status(&self, id: &str, status: ItemStatus) {
        self.store
            .update(id, &ItemUpdate::status(status))
            .await
            .expect("Failed to update status");
    }

    pub async fn assign(&self, id: &str, status: ItemStatus, assignee: &str) {
        self.store
            .update(
                id,
                &ItemUpdate::status(status).with_assignee(Some(assignee.to_string())),
            )
            .await
            .expect("Failed to assign");
    }

    pub fn item(&self, id: &str) -> WorkItem {
        self.store.get(id).expect("item should exist")
    }
}

/// A molecule root and its steps, in creation order.
pub struct Group {
    pub id: String,
    pub steps: Vec<String>,
}

impl Group {
    /// Create `n` open steps under a fresh molecule root.
    pub async fn create(store: &MemoryStore, n: usize) -> Self {
        let root = store
            .create(NewItem::new("molecule", ItemType::Molecule))
            .await
            .expect("Failed to create root");
        let mut steps = Vec::with_capacity(n);
        for i in 0..n {
            let step = store
                .create(
                    NewItem::new(format!("step {}", i), ItemType::Step).with_parent(&root.id),
                )
                .await
                .expect("Failed to create step");
            steps.push(step.id);
        }
        Self {
            id: root.id,
            steps,
        }
    }

    /// `step` cannot start until `blocker` closes.
    pub async fn block(&self, store: &MemoryStore, step: usize, blocker: usize) {
        store
            .dependency_add(&self.steps[step], &self.steps[blocker], DependencyKind::Blocks)
            .await
            .expect("Failed to add blocks edge");
    }
}

/// A temporary git repository with one commit.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = git2::Repository::init(&path).expect("Failed to init git");
        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        let mut index = repo.index().expect("Failed to open index");
        index
            .add_path(Path::new("README.md"))
            .expect("Failed to stage README");
        index.write().expect("Failed to write index");
        let tree_id = index.write_tree().expect("Failed to write tree");
        let tree = repo.find_tree(tree_id).expect("Failed to find tree");
        let sig = git2::Signature::now("Test User", "test@test.com").expect("signature");
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .expect("Failed to commit");
        Self { temp_dir, path }
    }
}
