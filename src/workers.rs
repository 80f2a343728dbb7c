//! Worker pool port.
//!
//! A pool hands out worker identities from a name roster. Provisioning only
//! reserves the identity; the isolated branch and worktree are materialized
//! later, after the unit of work has been attached, so the fork sees every
//! write made before it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::config::Config;
use crate::core::identity::AgentIdentity;
use crate::git::GitOps;
use crate::util::blocking;
use crate::{glog_debug, glog_warn, Error, Result};

/// A provisioned worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub identity: AgentIdentity,
    pub pool: String,
    pub workdir: PathBuf,
    /// Set once the branch has been materialized.
    pub branch: Option<String>,
    /// True when an idle worker was handed out again instead of a new one.
    #[serde(default)]
    pub reused: bool,
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.identity.name
    }
}

#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Allocate a fresh identity in `pool`, or reuse an idle one.
    async fn provision(&self, pool: &str) -> Result<Worker>;

    /// Names `provision` would hand out next, in order. Does not reserve.
    async fn available_names(&self, pool: &str) -> Result<Vec<String>>;

    /// Create the worker's branch for `item_id` and its working copy.
    async fn materialize(&self, worker: &Worker, item_id: &str) -> Result<Worker>;

    /// Release the identity and delete anything materialized for it.
    async fn remove(&self, worker: &Worker) -> Result<()>;

    async fn workers(&self, pool: &str) -> Result<Vec<Worker>>;
}

fn branch_for(worker: &Worker, item_id: &str) -> String {
    format!("polecat/{}/{}", worker.name(), item_id)
}

/// Persistent reservation for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkerRecord {
    worker: Worker,
    created_at: DateTime<Utc>,
}

/// Git-worktree-backed pool.
///
/// Reservations are JSON files under `<workers_dir>/<pool>/<name>.json`;
/// worktrees live under `<worktrees_dir>/<pool>/<name>`. Creating the
/// reservation file with `create_new` makes allocation safe across
/// concurrent dispatchers.
#[derive(Debug, Clone)]
pub struct GitWorkerPool {
    config: Config,
    workers_dir: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitWorkerPool {
    pub fn new(config: Config) -> Result<Self> {
        let workers_dir = config.workers_dir()?;
        let worktrees_dir = config.worktrees_dir()?;
        Ok(Self::with_dirs(config, workers_dir, worktrees_dir))
    }

    pub fn with_dirs(config: Config, workers_dir: PathBuf, worktrees_dir: PathBuf) -> Self {
        Self {
            config,
            workers_dir,
            worktrees_dir,
        }
    }

    fn record_path(&self, pool: &str, name: &str) -> PathBuf {
        self.workers_dir.join(pool).join(format!("{}.json", name))
    }

    fn repo_for(&self, pool: &str) -> Result<PathBuf> {
        self.config
            .pool(pool)
            .repo
            .map(PathBuf::from)
            .ok_or_else(|| Error::Worker(format!("pool {} has no repository configured", pool)))
    }

    fn read_records(dir: &Path) -> Result<Vec<WorkerRecord>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<WorkerRecord>(&raw)?))
            {
                Ok(record) => records.push(record),
                Err(e) => glog_warn!("skipping unreadable worker record {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.worker.identity.name.cmp(&b.worker.identity.name));
        Ok(records)
    }

    fn write_record(path: &Path, record: &WorkerRecord, create_new: bool) -> Result<()> {
        let raw = serde_json::to_string_pretty(record)?;
        if create_new {
            use std::io::Write;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)?;
            file.write_all(raw.as_bytes())?;
        } else {
            fs::write(path, raw)?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerPool for GitWorkerPool {
    async fn provision(&self, pool: &str) -> Result<Worker> {
        let names = self.config.worker_names(pool);
        let pool_dir = self.workers_dir.join(pool);
        let worktrees = self.worktrees_dir.join(pool);
        let pool = pool.to_string();
        let this = self.clone();
        blocking(move || {
            fs::create_dir_all(&pool_dir)?;
            for name in names {
                let worker = Worker {
                    identity: AgentIdentity::polecat(&pool, &name),
                    pool: pool.clone(),
                    workdir: worktrees.join(&name),
                    branch: None,
                    reused: false,
                };
                let record = WorkerRecord {
                    worker: worker.clone(),
                    created_at: Utc::now(),
                };
                match Self::write_record(&this.record_path(&pool, &name), &record, true) {
                    Ok(()) => {
                        glog_debug!("provisioned worker {}", worker.identity);
                        return Ok(worker);
                    }
                    Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(Error::Worker(format!("pool {} has no free worker names", pool)))
        })
        .await
    }

    async fn available_names(&self, pool: &str) -> Result<Vec<String>> {
        let names = self.config.worker_names(pool);
        Ok(names
            .into_iter()
            .filter(|n| !self.record_path(pool, n).exists())
            .collect())
    }

    async fn materialize(&self, worker: &Worker, item_id: &str) -> Result<Worker> {
        let repo = self.repo_for(&worker.pool)?;
        let record_path = self.record_path(&worker.pool, worker.name());
        let mut worker = worker.clone();
        let branch = branch_for(&worker, item_id);
        blocking(move || {
            let git = GitOps::new(&repo)?;
            git.create_worktree(&branch, &worker.workdir)?;
            worker.branch = Some(branch);
            let record = WorkerRecord {
                worker: worker.clone(),
                created_at: Utc::now(),
            };
            Self::write_record(&record_path, &record, false)?;
            Ok(worker)
        })
        .await
    }

    async fn remove(&self, worker: &Worker) -> Result<()> {
        let repo = self.repo_for(&worker.pool).ok();
        let record_path = self.record_path(&worker.pool, worker.name());
        let worker = worker.clone();
        blocking(move || {
            if let Some(repo) = repo {
                let git = GitOps::new(&repo)?;
                git.remove_worktree(&worker.workdir)?;
                if let Some(branch) = &worker.branch {
                    git.delete_branch(branch)?;
                }
            } else if worker.workdir.exists() {
                fs::remove_dir_all(&worker.workdir)?;
            }
            if record_path.exists() {
                fs::remove_file(&record_path)?;
            }
            glog_debug!("removed worker {}", worker.identity);
            Ok(())
        })
        .await
    }

    async fn workers(&self, pool: &str) -> Result<Vec<Worker>> {
        let dir = self.workers_dir.join(pool);
        blocking(move || Ok(Self::read_records(&dir)?.into_iter().map(|r| r.worker).collect()))
            .await
    }
}

#[derive(Default)]
struct MemoryWorkerState {
    active: BTreeMap<String, Vec<Worker>>,
    idle: BTreeMap<String, Vec<Worker>>,
    removed: Vec<String>,
    fail_materialize: Vec<String>,
    provisioned: usize,
}

/// In-process pool with a fixed roster per pool.
pub struct MemoryWorkers {
    roster: Vec<String>,
    state: Mutex<MemoryWorkerState>,
}

impl MemoryWorkers {
    pub fn new(roster: &[&str]) -> Self {
        Self {
            roster: roster.iter().map(|s| s.to_string()).collect(),
            state: Mutex::new(MemoryWorkerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryWorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn taken(state: &MemoryWorkerState, pool: &str, name: &str) -> bool {
        let has = |m: &BTreeMap<String, Vec<Worker>>| {
            m.get(pool)
                .map(|ws| ws.iter().any(|w| w.name() == name))
                .unwrap_or(false)
        };
        has(&state.active) || has(&state.idle)
    }

    /// Register an idle worker that `provision` will hand out first.
    pub fn add_idle(&self, pool: &str, name: &str) {
        let worker = Worker {
            identity: AgentIdentity::polecat(pool, name),
            pool: pool.to_string(),
            workdir: PathBuf::from(format!("/workers/{}/{}", pool, name)),
            branch: None,
            reused: true,
        };
        self.lock()
            .idle
            .entry(pool.to_string())
            .or_default()
            .push(worker);
    }

    pub fn fail_materialize(&self, name: &str) {
        self.lock().fail_materialize.push(name.to_string());
    }

    pub fn active_names(&self, pool: &str) -> Vec<String> {
        self.lock()
            .active
            .get(pool)
            .map(|ws| ws.iter().map(|w| w.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn provisioned_count(&self) -> usize {
        self.lock().provisioned
    }
}

#[async_trait]
impl WorkerPool for MemoryWorkers {
    async fn provision(&self, pool: &str) -> Result<Worker> {
        let mut state = self.lock();
        let reused = state.idle.get_mut(pool).and_then(|ws| ws.pop());
        let worker = match reused {
            Some(worker) => worker,
            None => {
                let name = self
                    .roster
                    .iter()
                    .find(|n| !Self::taken(&state, pool, n))
                    .cloned()
                    .ok_or_else(|| Error::Worker(format!("pool {} has no free worker names", pool)))?;
                Worker {
                    identity: AgentIdentity::polecat(pool, &name),
                    pool: pool.to_string(),
                    workdir: PathBuf::from(format!("/workers/{}/{}", pool, name)),
                    branch: None,
                    reused: false,
                }
            }
        };
        state
            .active
            .entry(pool.to_string())
            .or_default()
            .push(worker.clone());
        state.provisioned += 1;
        Ok(worker)
    }

    async fn available_names(&self, pool: &str) -> Result<Vec<String>> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .idle
            .get(pool)
            .map(|ws| ws.iter().rev().map(|w| w.name().to_string()).collect())
            .unwrap_or_default();
        names.extend(
            self.roster
                .iter()
                .filter(|n| !Self::taken(&state, pool, n))
                .cloned(),
        );
        Ok(names)
    }

    async fn materialize(&self, worker: &Worker, item_id: &str) -> Result<Worker> {
        let mut state = self.lock();
        if state.fail_materialize.iter().any(|n| n == worker.name()) {
            return Err(Error::Worker(format!(
                "cannot create worktree for {}",
                worker.identity
            )));
        }
        let mut worker = worker.clone();
        worker.branch = Some(branch_for(&worker, item_id));
        if let Some(ws) = state.active.get_mut(&worker.pool) {
            if let Some(slot) = ws.iter_mut().find(|w| w.name() == worker.name()) {
                *slot = worker.clone();
            }
        }
        Ok(worker)
    }

    async fn remove(&self, worker: &Worker) -> Result<()> {
        let mut state = self.lock();
        if let Some(ws) = state.active.get_mut(&worker.pool) {
            ws.retain(|w| w.name() != worker.name());
        }
        state.removed.push(worker.name().to_string());
        Ok(())
    }

    async fn workers(&self, pool: &str) -> Result<Vec<Worker>> {
        Ok(self.lock().active.get(pool).cloned().unwrap_or_default())
    }
}
