//! Batch dispatch.
//!
//! Hands each requested item to a fresh worker in a pool. Per item the
//! steps run strictly in order: admission, provisioning, hook check, convoy
//! linkage, formula instantiation, attach, materialize, session start.
//! A failure from the hook check onwards rolls back what that item already
//! did, including any molecule it instantiated; other items are unaffected.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::sleep;

use crate::config::{Config, DispatchConfig};
use crate::core::identity::AgentIdentity;
use crate::core::item::{ItemStatus, ItemUpdate, ListFilter, WorkItem};
use crate::notify::Notifier;
use crate::session::{SessionManager, SessionSpec};
use crate::store::{fetch_fresh, StoreClient};
use crate::util::backoff_delay;
use crate::workers::{Worker, WorkerPool};
use crate::{glog, glog_debug, glog_error, glog_warn, Error, Result};

use super::admission::{pool_in_flight, AdmissionPolicy};
use super::convoy::{ConvoyOptions, ConvoyTracker};
use super::formula::{FormulaCatalog, LazyFormula, Molecule};
use super::liveness::LivenessProber;

pub const META_ATTACHED_MOLECULE: &str = "attached_molecule";
pub const META_DISPATCHED_BY: &str = "dispatched_by";
pub const META_DISPATCHED_AT: &str = "dispatched_at";

/// Per-call dispatch behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub force: bool,
    /// 0 means unlimited.
    pub max_concurrent: usize,
    pub auto_convoy: bool,
    pub formula: Option<String>,
    pub dry_run: bool,
    pub cross_domain_guard: bool,
}

impl DispatchOptions {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            force: false,
            max_concurrent: config.max_concurrent,
            auto_convoy: config.auto_convoy,
            formula: None,
            dry_run: false,
            cross_domain_guard: config.cross_domain_guard,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub worker_name: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convoy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub molecule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
}

impl ItemOutcome {
    fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            ..Default::default()
        }
    }

    fn failed(mut self, message: String) -> Self {
        self.success = false;
        self.error_message = Some(message);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub pool: String,
    pub dry_run: bool,
    /// In request order.
    pub outcomes: Vec<ItemOutcome>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchResult {
    fn new(batch_id: String, pool: &str, dry_run: bool, outcomes: Vec<ItemOutcome>) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        Self {
            batch_id,
            pool: pool.to_string(),
            dry_run,
            failed: outcomes.len() - succeeded,
            succeeded,
            outcomes,
        }
    }

    pub fn outcome(&self, item_id: &str) -> Option<&ItemOutcome> {
        self.outcomes.iter().find(|o| o.item_id == item_id)
    }
}

/// One item's dispatch attempt and what rollback has to undo.
#[derive(Debug, Default)]
struct DispatchUnit {
    item_id: String,
    worker: Option<Worker>,
    identity: Option<AgentIdentity>,
    session_name: Option<String>,
    worker_created: bool,
    branch_created: bool,
    session_started: bool,
    fields_stored: bool,
    convoy_created: Option<String>,
    molecule_created: Option<Molecule>,
}

impl DispatchUnit {
    fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            ..Default::default()
        }
    }
}

pub struct BatchDispatcher {
    store: Arc<dyn StoreClient>,
    sessions: Arc<dyn SessionManager>,
    workers: Arc<dyn WorkerPool>,
    tracker: ConvoyTracker,
    prober: LivenessProber,
    formulas: FormulaCatalog,
    config: Config,
    actor: String,
}

impl BatchDispatcher {
    pub fn new(
        store: Arc<dyn StoreClient>,
        sessions: Arc<dyn SessionManager>,
        workers: Arc<dyn WorkerPool>,
        notifier: Arc<dyn Notifier>,
        config: Config,
    ) -> Result<Self> {
        let formulas = FormulaCatalog::new(config.formula_dir()?);
        Ok(Self::with_formulas(
            store, sessions, workers, notifier, config, formulas,
        ))
    }

    pub fn with_formulas(
        store: Arc<dyn StoreClient>,
        sessions: Arc<dyn SessionManager>,
        workers: Arc<dyn WorkerPool>,
        notifier: Arc<dyn Notifier>,
        config: Config,
        formulas: FormulaCatalog,
    ) -> Self {
        let tracker = ConvoyTracker::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            notifier,
            &config.tracker,
        );
        let prober = LivenessProber::new(
            Arc::clone(&sessions),
            config.tracker.liveness_parallelism,
        );
        Self {
            store,
            sessions,
            workers,
            tracker,
            prober,
            formulas,
            config,
            actor: "gantry".to_string(),
        }
    }

    /// Who is recorded as `dispatched_by` and as owner of new convoys.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn formulas(&self) -> &FormulaCatalog {
        &self.formulas
    }

    /// Dispatch `item_ids` to workers in `pool`.
    ///
    /// Only pre-flight problems fail the call; per-item failures are
    /// reported in the result.
    pub async fn dispatch(
        &self,
        item_ids: &[String],
        pool: &str,
        opts: &DispatchOptions,
    ) -> Result<BatchResult> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let count = item_ids.len().to_string();
        let max = opts.max_concurrent.to_string();
        glog!(
            "batch {} start {}",
            batch_id,
            crate::log::fields(&[
                ("items", count.as_str()),
                ("pool", pool),
                ("max_concurrent", max.as_str()),
                ("dry_run", if opts.dry_run { "true" } else { "false" }),
                ("force", if opts.force { "true" } else { "false" }),
            ])
        );

        let items = self.preflight(item_ids, pool, opts).await?;
        let rejected = self.live_assignees(&items, opts).await;

        let outcomes = if opts.dry_run {
            self.plan(&items, &rejected, pool, opts).await?
        } else {
            self.run(&items, &rejected, pool, opts).await
        };

        let result = BatchResult::new(batch_id, pool, opts.dry_run, outcomes);
        glog!(
            "batch {}: {} succeeded, {} failed",
            result.batch_id,
            result.succeeded,
            result.failed
        );
        Ok(result)
    }

    /// Every item must exist, belong to the pool's domain and be open,
    /// unless forced.
    async fn preflight(
        &self,
        item_ids: &[String],
        pool: &str,
        opts: &DispatchOptions,
    ) -> Result<Vec<WorkItem>> {
        if item_ids.is_empty() {
            return Err(Error::Validation("no items to dispatch".to_string()));
        }
        let mut fetched = fetch_fresh(self.store.as_ref(), item_ids).await;
        if !fetched.missing.is_empty() {
            return Err(Error::NotFound(fetched.missing.join(", ")));
        }

        let domain = self.config.pool_domain(pool);
        let mut items = Vec::with_capacity(item_ids.len());
        for id in item_ids {
            let item = fetched
                .items
                .remove(id)
                .ok_or_else(|| Error::NotFound(id.clone()))?;
            if opts.cross_domain_guard && !opts.force && item.domain() != domain {
                return Err(Error::Validation(format!(
                    "item {} is in domain {}, pool {} takes {} (use force to override)",
                    id,
                    item.domain(),
                    pool,
                    domain
                )));
            }
            if item.is_terminal() && !opts.force {
                return Err(Error::Validation(format!(
                    "item {} is already {}",
                    id, item.status
                )));
            }
            items.push(item);
        }
        Ok(items)
    }

    /// Items whose current assignee still has a live session.
    async fn live_assignees(&self, items: &[WorkItem], opts: &DispatchOptions) -> Vec<String> {
        if opts.force {
            return Vec::new();
        }
        let assigned: Vec<(String, String)> = items
            .iter()
            .filter_map(|item| {
                let identity = AgentIdentity::parse_path(item.assignee.as_deref()?).ok()?;
                Some((item.id.clone(), self.sessions.session_name(&identity)))
            })
            .collect();
        let names: Vec<String> = assigned.iter().map(|(_, n)| n.clone()).collect();
        let probes = self.prober.probe(&names).await;
        assigned
            .into_iter()
            .zip(probes)
            .filter(|(_, p)| matches!(p.running, Ok(true)))
            .map(|((id, _), _)| id)
            .collect()
    }

    fn busy_outcome(item: &WorkItem) -> ItemOutcome {
        ItemOutcome::new(&item.id).failed(format!(
            "item {} is held by {} with a live session (use force to override)",
            item.id,
            item.assignee.as_deref().unwrap_or("?")
        ))
    }

    /// The dry-run decision tree. Reads only.
    async fn plan(
        &self,
        items: &[WorkItem],
        rejected: &[String],
        pool: &str,
        opts: &DispatchOptions,
    ) -> Result<Vec<ItemOutcome>> {
        let mut names = self.workers.available_names(pool).await?.into_iter();
        let mut formula = opts
            .formula
            .as_deref()
            .map(|name| LazyFormula::new(&self.formulas, name));

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            if rejected.contains(&item.id) {
                outcomes.push(Self::busy_outcome(item));
                continue;
            }
            let mut outcome = ItemOutcome::new(&item.id);
            if let Some(formula) = formula.as_mut() {
                if let Err(e) = formula.get() {
                    glog_warn!("dry run: {}: {}", item.id, e);
                }
            }
            if opts.auto_convoy {
                match self.tracker.find_tracking_convoy(&item.id).await {
                    Ok(existing) => outcome.convoy_id = existing,
                    Err(e) => glog_warn!("dry run: convoy lookup for {} failed: {}", item.id, e),
                }
            }
            match names.next() {
                Some(name) => {
                    let identity = AgentIdentity::polecat(pool, &name);
                    outcome.session_name = Some(self.sessions.session_name(&identity));
                    outcome.worker_name = Some(name);
                    outcome.success = true;
                }
                None => {
                    outcome = outcome.failed(format!("pool {} has no free worker names", pool));
                }
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run(
        &self,
        items: &[WorkItem],
        rejected: &[String],
        pool: &str,
        opts: &DispatchOptions,
    ) -> Vec<ItemOutcome> {
        let admission = AdmissionPolicy::from_config(&self.config.dispatch, opts.max_concurrent);
        let mut formula = opts
            .formula
            .as_deref()
            .map(|name| LazyFormula::new(&self.formulas, name));

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            if rejected.contains(&item.id) {
                outcomes.push(Self::busy_outcome(item));
                continue;
            }
            let outcome = self
                .dispatch_one(item, pool, opts, &admission, formula.as_mut())
                .await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn dispatch_one(
        &self,
        item: &WorkItem,
        pool: &str,
        opts: &DispatchOptions,
        admission: &AdmissionPolicy,
        formula: Option<&mut LazyFormula<'_>>,
    ) -> ItemOutcome {
        let mut unit = DispatchUnit::new(&item.id);
        let mut outcome = ItemOutcome::new(&item.id);

        let admitted = admission
            .wait_for_slot(|| {
                pool_in_flight(
                    pool,
                    self.workers.as_ref(),
                    self.sessions.as_ref(),
                    &self.prober,
                )
            })
            .await;
        if let Err(e) = admitted {
            glog_warn!("{}: admission failed: {}", item.id, e);
            return outcome.failed(format!("item {}: admission: {}", item.id, e));
        }

        let worker = match self.workers.provision(pool).await {
            Ok(worker) => worker,
            Err(e) => {
                glog_warn!("{}: provisioning failed: {}", item.id, e);
                return outcome.failed(format!("item {}: provision worker: {}", item.id, e));
            }
        };
        let identity = worker.identity.clone();
        let session_name = self.sessions.session_name(&identity);
        outcome.worker_name = Some(worker.name().to_string());
        outcome.session_name = Some(session_name.clone());
        unit.worker = Some(worker.clone());
        unit.identity = Some(identity.clone());
        unit.session_name = Some(session_name.clone());
        unit.worker_created = !worker.reused;

        if !opts.force {
            match self.hooked_to(&identity, &item.id).await {
                Ok(held) if !held.is_empty() => {
                    self.rollback(&unit).await;
                    return outcome.failed(format!(
                        "item {}: worker {} already has {} hooked (use force to override)",
                        item.id,
                        identity,
                        held.join(", ")
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    self.rollback(&unit).await;
                    return outcome.failed(format!(
                        "item {}: check hook of {}: {}",
                        item.id, identity, e
                    ));
                }
            }
        }

        if opts.auto_convoy {
            outcome.convoy_id = self.link_convoy(item, &mut unit).await;
        }

        if let Some(formula) = formula {
            match formula.get() {
                Ok(formula) => match formula.instantiate(self.store.as_ref(), item).await {
                    Ok(molecule) => {
                        outcome.molecule_id = Some(molecule.root_id.clone());
                        unit.molecule_created = Some(molecule);
                    }
                    Err(e) => glog_warn!(
                        "{}: formula {} not instantiated, attaching bare item: {}",
                        item.id,
                        formula.name,
                        e
                    ),
                },
                Err(e) => glog_warn!("{}: {}, attaching bare item", item.id, e),
            }
        }

        let mut attach = ItemUpdate::status(ItemStatus::Hooked)
            .with_assignee(Some(identity.path()))
            .with_meta(META_DISPATCHED_BY, self.actor.clone())
            .with_meta(META_DISPATCHED_AT, Utc::now().to_rfc3339());
        if let Some(molecule) = &outcome.molecule_id {
            attach = attach.with_meta(META_ATTACHED_MOLECULE, molecule.clone());
        }
        if let Err(e) = self.attach_with_retry(&item.id, &attach).await {
            self.rollback(&unit).await;
            return outcome.failed(format!("item {}: attach: {}", item.id, e));
        }
        unit.fields_stored = true;

        let worker = match self.workers.materialize(&worker, &item.id).await {
            Ok(worker) => worker,
            Err(e) => {
                self.rollback(&unit).await;
                return outcome.failed(format!("item {}: materialize worker: {}", item.id, e));
            }
        };
        unit.branch_created = worker.branch.is_some();
        unit.worker = Some(worker.clone());

        let spec = self.session_spec(&worker, item, pool);
        if let Err(e) = self.sessions.start(&session_name, &spec).await {
            self.rollback(&unit).await;
            return outcome.failed(format!("item {}: start session: {}", item.id, e));
        }
        unit.session_started = true;

        glog!(
            "{} dispatched to {} (session {})",
            item.id,
            identity,
            session_name
        );
        outcome.success = true;
        outcome
    }

    /// Non-terminal items other than `item_id` already assigned to `identity`.
    /// A worker holds one hook at a time.
    async fn hooked_to(&self, identity: &AgentIdentity, item_id: &str) -> Result<Vec<String>> {
        let filter = ListFilter {
            assignee: Some(identity.path()),
            ..Default::default()
        };
        Ok(self
            .store
            .list(&filter)
            .await?
            .into_iter()
            .filter(|held| held.id != item_id)
            .map(|held| held.id)
            .collect())
    }

    /// Reuse an open tracking convoy or create one. Failures are warnings.
    async fn link_convoy(&self, item: &WorkItem, unit: &mut DispatchUnit) -> Option<String> {
        match self.tracker.find_tracking_convoy(&item.id).await {
            Ok(Some(existing)) => return Some(existing),
            Ok(None) => {}
            Err(e) => {
                glog_warn!("{}: convoy lookup failed: {}", item.id, e);
                return None;
            }
        }
        let options = ConvoyOptions {
            owner: Some(self.actor.clone()),
            ..Default::default()
        };
        match self
            .tracker
            .create(&format!("Work: {}", item.title), &[item.id.clone()], options)
            .await
        {
            Ok(convoy) => {
                unit.convoy_created = Some(convoy.id.clone());
                Some(convoy.id)
            }
            Err(e) => {
                glog_warn!("{}: auto-convoy failed: {}", item.id, e);
                None
            }
        }
    }

    async fn attach_with_retry(&self, item_id: &str, update: &ItemUpdate) -> Result<()> {
        let config = &self.config.dispatch;
        let attempts = config.attach_retries.max(1);
        let base = config.attach_backoff();
        let mut attempt = 0;
        loop {
            match self.store.update(item_id, update).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = backoff_delay(base, attempt, base.saturating_mul(8));
                    glog_debug!(
                        "{}: attach attempt {} failed, retrying in {:?}: {}",
                        item_id,
                        attempt + 1,
                        delay,
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn session_spec(&self, worker: &Worker, item: &WorkItem, pool: &str) -> SessionSpec {
        SessionSpec {
            workdir: worker.workdir.clone(),
            command: self
                .config
                .sessions
                .command
                .split_whitespace()
                .map(String::from)
                .collect(),
            env: vec![
                ("GANTRY_AGENT".to_string(), worker.identity.path()),
                ("GANTRY_POOL".to_string(), pool.to_string()),
                ("GANTRY_ITEM".to_string(), item.id.clone()),
            ],
        }
    }

    /// Undo one item's side effects in reverse order. Errors are logged.
    async fn rollback(&self, unit: &DispatchUnit) {
        match &unit.identity {
            Some(identity) => glog_warn!("{}: rolling back dispatch to {}", unit.item_id, identity),
            None => glog_warn!("{}: rolling back dispatch", unit.item_id),
        }
        if unit.session_started {
            if let Some(name) = &unit.session_name {
                if let Err(e) = self.sessions.kill(name).await {
                    glog_error!("{}: rollback kill {} failed: {}", unit.item_id, name, e);
                }
            }
        }
        if let Some(worker) = &unit.worker {
            if unit.worker_created || unit.branch_created {
                if let Err(e) = self.workers.remove(worker).await {
                    glog_error!(
                        "{}: rollback remove worker {} failed: {}",
                        unit.item_id,
                        worker.identity,
                        e
                    );
                }
            }
        }
        if unit.fields_stored {
            let release = ItemUpdate::status(ItemStatus::Open)
                .with_assignee(None)
                .without_meta(META_ATTACHED_MOLECULE)
                .without_meta(META_DISPATCHED_BY)
                .without_meta(META_DISPATCHED_AT);
            if let Err(e) = self.store.update(&unit.item_id, &release).await {
                glog_error!("{}: rollback release failed: {}", unit.item_id, e);
            }
        }
        if let Some(molecule) = &unit.molecule_created {
            let discard = ItemUpdate::status(ItemStatus::Tombstone);
            let ids = molecule
                .steps
                .values()
                .chain(std::iter::once(&molecule.root_id));
            for id in ids {
                if let Err(e) = self.store.update(id, &discard).await {
                    glog_error!("{}: rollback discard of {} failed: {}", unit.item_id, id, e);
                }
            }
        }
        if let Some(convoy) = &unit.convoy_created {
            glog_debug!(
                "{}: convoy {} kept, it still tracks the open item",
                unit.item_id,
                convoy
            );
        }
    }
}
