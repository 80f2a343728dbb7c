//! Formula templates.
//!
//! A formula is a TOML list of steps with `needs` edges between them. It is
//! validated against a [`StepGraph`] on load, so instantiation never writes
//! a cyclic group to the store.
//!
//! ```toml
//! name = "review"
//! description = "Implement, test, land"
//!
//! [[steps]]
//! id = "implement"
//! title = "Implement the change"
//!
//! [[steps]]
//! id = "test"
//! title = "Run the tests"
//! needs = ["implement"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::dag::{StepGraph, StepNode};
use crate::core::item::{DependencyKind, ItemStatus, ItemType, NewItem, WorkItem};
use crate::store::StoreClient;
use crate::{glog, glog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaStep {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub needs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<FormulaStep>,
}

/// Ids of an instantiated formula.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Molecule {
    pub root_id: String,
    /// Template step id to created item id.
    pub steps: BTreeMap<String, String>,
}

impl Formula {
    pub fn parse(raw: &str) -> Result<Self> {
        let formula: Formula = toml::from_str(raw)?;
        formula.validate()?;
        Ok(formula)
    }

    pub fn validate(&self) -> Result<()> {
        self.graph().map(|_| ())
    }

    /// The template as a step graph. Fails on empty templates, duplicate
    /// ids, unknown `needs` and cycles.
    pub fn graph(&self) -> Result<StepGraph> {
        if self.steps.is_empty() {
            return Err(Error::Validation(format!(
                "formula {} has no steps",
                self.name
            )));
        }
        let mut graph = StepGraph::new();
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(Error::Validation(format!(
                    "formula {}: duplicate step id {}",
                    self.name, step.id
                )));
            }
            graph.add_step(StepNode::new(&step.id, &step.title, ItemStatus::Open));
        }
        for step in &self.steps {
            for need in &step.needs {
                if !seen.contains(need.as_str()) {
                    return Err(Error::Validation(format!(
                        "formula {}: step {} needs unknown step {}",
                        self.name, step.id, need
                    )));
                }
                graph.add_blocker(need, &step.id)?;
            }
        }
        Ok(graph)
    }

    /// Create the molecule root, its steps and their `blocks` edges.
    ///
    /// The root tracks `target`. Steps are created in template order so the
    /// store's list order matches it.
    pub async fn instantiate(&self, store: &dyn StoreClient, target: &WorkItem) -> Result<Molecule> {
        let root = store
            .create(
                NewItem::new(format!("{}: {}", self.name, target.title), ItemType::Molecule)
                    .with_prefix(target.domain())
                    .with_description(self.description.clone())
                    .with_meta("formula", self.name.clone())
                    .with_meta("target", target.id.clone()),
            )
            .await?;
        store
            .dependency_add(&root.id, &target.id, DependencyKind::Tracks)
            .await?;

        let mut steps = BTreeMap::new();
        for step in &self.steps {
            let created = store
                .create(
                    NewItem::new(step.title.clone(), ItemType::Step)
                        .with_parent(root.id.clone())
                        .with_description(step.description.clone())
                        .with_meta("step", step.id.clone()),
                )
                .await?;
            steps.insert(step.id.clone(), created.id);
        }
        for step in &self.steps {
            for need in &step.needs {
                if let (Some(from), Some(to)) = (steps.get(&step.id), steps.get(need)) {
                    store.dependency_add(from, to, DependencyKind::Blocks).await?;
                }
            }
        }
        glog!(
            "formula {} instantiated as {} for {} ({} steps)",
            self.name,
            root.id,
            target.id,
            steps.len()
        );
        Ok(Molecule {
            root_id: root.id,
            steps,
        })
    }
}

/// Formulas stored as `<name>.formula.toml` or `<name>.toml` in a directory.
#[derive(Debug, Clone)]
pub struct FormulaCatalog {
    dir: PathBuf,
    loads: Arc<AtomicUsize>,
}

impl FormulaCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, name: &str) -> Result<Formula> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let path = [
            self.dir.join(format!("{}.formula.toml", name)),
            self.dir.join(format!("{}.toml", name)),
        ]
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| Error::NotFound(format!("formula {}", name)))?;
        glog_debug!("loading formula {} from {}", name, path.display());
        Formula::parse(&fs::read_to_string(&path)?)
    }

    /// Number of `load` calls so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

/// A formula loaded at most once, on first use.
///
/// A failed load is remembered too, so every later item sees the same
/// error without touching the catalog again.
pub struct LazyFormula<'a> {
    catalog: &'a FormulaCatalog,
    name: &'a str,
    loaded: Option<std::result::Result<Arc<Formula>, String>>,
}

impl<'a> LazyFormula<'a> {
    pub fn new(catalog: &'a FormulaCatalog, name: &'a str) -> Self {
        Self {
            catalog,
            name,
            loaded: None,
        }
    }

    pub fn get(&mut self) -> Result<Arc<Formula>> {
        let catalog = self.catalog;
        let name = self.name;
        self.loaded
            .get_or_insert_with(|| catalog.load(name).map(Arc::new).map_err(|e| e.to_string()))
            .clone()
            .map_err(|e| Error::Validation(format!("formula {} unusable: {}", name, e)))
    }
}
