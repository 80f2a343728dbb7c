//! Store adapter that drives the `bd` issue-tracker CLI.
//!
//! Every call spawns `bd ... --json` with a timeout; a call that times out
//! kills its child.
//! Cross-domain routing (which database an id lives in) is `bd`'s job; the
//! adapter passes ids through untouched.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use super::StoreClient;
use crate::config::StoreConfig;
use crate::core::item::{
    Dependency, DependencyKind, Direction, ItemUpdate, ListFilter, NewItem, WorkItem,
};
use crate::util::output_with_timeout;
use crate::{glog_debug, glog_trace, Error, Result};

/// [`StoreClient`] backed by the `bd` binary.
#[derive(Debug, Clone)]
pub struct BdStore {
    binary: String,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl BdStore {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            workdir: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            workdir: config.workdir.as_ref().map(PathBuf::from),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    /// Run `bd` with `args` and return stdout. `subject` names the id the
    /// call is about, for NotFound mapping.
    async fn run(&self, args: Vec<String>, subject: &str) -> Result<String> {
        glog_debug!("bd {}", args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let output = output_with_timeout(cmd, self.timeout).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        glog_trace!("bd stdout: {}", stdout.trim());
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(&args, subject, stderr.trim()))
    }

    async fn run_json<T: DeserializeOwned>(&self, args: Vec<String>, subject: &str) -> Result<T> {
        let stdout = self.run(args, subject).await?;
        Ok(serde_json::from_str(stdout.trim())?)
    }
}

fn classify_failure(args: &[String], subject: &str, stderr: &str) -> Error {
    let lowered = stderr.to_lowercase();
    if lowered.contains("not found") || lowered.contains("no issue") {
        return Error::NotFound(subject.to_string());
    }
    let verb = args.first().map(String::as_str).unwrap_or("?");
    Error::Store(format!("bd {} {}: {}", verb, subject, stderr))
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// `bd show` prints an array for one or many ids; older builds print a
/// bare object for a single id.
fn parse_items(stdout: &str) -> Result<Vec<WorkItem>> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('[') {
        Ok(serde_json::from_str(trimmed)?)
    } else if trimmed.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(vec![serde_json::from_str(trimmed)?])
    }
}

fn update_args(id: &str, update: &ItemUpdate) -> Result<Vec<String>> {
    let mut a = args(&["update", id]);
    if let Some(status) = update.status {
        a.extend(args(&["--status", status.as_str()]));
    }
    if let Some(assignee) = &update.assignee {
        a.push("--assignee".to_string());
        a.push(assignee.clone().unwrap_or_default());
    }
    if let Some(title) = &update.title {
        a.push("--title".to_string());
        a.push(title.clone());
    }
    if let Some(description) = &update.description {
        a.push("--description".to_string());
        a.push(description.clone());
    }
    if !update.metadata.is_empty() {
        a.push("--metadata".to_string());
        a.push(serde_json::to_string(&update.metadata)?);
    }
    a.push("--json".to_string());
    Ok(a)
}

fn list_args(filter: &ListFilter) -> Vec<String> {
    let mut a = args(&["list", "--json"]);
    if let Some(parent) = &filter.parent {
        a.extend(args(&["--parent", parent]));
    }
    match filter.status {
        Some(status) => a.extend(args(&["--status", status.as_str()])),
        None if filter.include_closed => a.push("--all".to_string()),
        None => {}
    }
    if let Some(item_type) = filter.item_type {
        a.extend(args(&["--type", item_type.as_str()]));
    }
    if let Some(assignee) = &filter.assignee {
        a.extend(args(&["--assignee", assignee]));
    }
    a
}

#[async_trait]
impl StoreClient for BdStore {
    async fn create(&self, new: NewItem) -> Result<WorkItem> {
        let mut a = args(&["create", &new.title, "--type", new.item_type.as_str()]);
        if let Some(id) = &new.id {
            a.extend(args(&["--id", id]));
        }
        if let Some(prefix) = &new.prefix {
            a.extend(args(&["--prefix", prefix]));
        }
        if let Some(parent) = &new.parent {
            a.extend(args(&["--parent", parent]));
        }
        if let Some(assignee) = &new.assignee {
            a.extend(args(&["--assignee", assignee]));
        }
        if !new.description.is_empty() {
            a.extend(args(&["--description", &new.description]));
        }
        for label in &new.labels {
            a.extend(args(&["--label", label]));
        }
        if !new.metadata.is_empty() {
            a.push("--metadata".to_string());
            a.push(serde_json::to_string(&new.metadata)?);
        }
        a.push("--json".to_string());
        let stdout = self.run(a, &new.title).await?;
        parse_items(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Store(format!("bd create '{}' returned nothing", new.title)))
    }

    async fn show(&self, id: &str) -> Result<WorkItem> {
        let stdout = self.run(args(&["show", id, "--json"]), id).await?;
        parse_items(&stdout)?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn show_multiple(&self, ids: &[String]) -> Result<HashMap<String, WorkItem>> {
        let mut a = vec!["show".to_string()];
        a.extend(ids.iter().cloned());
        a.push("--json".to_string());
        let stdout = self.run(a, &ids.join(",")).await?;
        Ok(parse_items(&stdout)?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<WorkItem>> {
        let subject = filter.parent.clone().unwrap_or_default();
        self.run_json(list_args(filter), &subject).await
    }

    async fn update(&self, id: &str, update: &ItemUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.run(update_args(id, update)?, id).await.map(|_| ())
    }

    async fn close(&self, id: &str, reason: &str) -> Result<()> {
        self.run(args(&["close", id, "--reason", reason, "--json"]), id)
            .await
            .map(|_| ())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.run(args(&["delete", id, "--force", "--json"]), id)
            .await
            .map(|_| ())
    }

    async fn dependency_add(&self, from: &str, to: &str, kind: DependencyKind) -> Result<()> {
        self.run(args(&["dep", "add", from, to, "--type", kind.as_str()]), from)
            .await
            .map(|_| ())
    }

    async fn dependency_list(
        &self,
        id: &str,
        direction: Direction,
        kind: Option<DependencyKind>,
    ) -> Result<Vec<Dependency>> {
        let dir = match direction {
            Direction::Down => "down",
            Direction::Up => "up",
        };
        let mut a = args(&["dep", "list", id, "--direction", dir, "--json"]);
        if let Some(kind) = kind {
            a.extend(args(&["--type", kind.as_str()]));
        }
        self.run_json(a, id).await
    }
}
