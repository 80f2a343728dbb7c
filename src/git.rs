//! Git worktree operations used to give each worker an isolated checkout.

use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, Repository, WorktreeAddOptions, WorktreePruneOptions};

use crate::{glog_debug, glog_warn, Result};

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        glog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Create `branch` at HEAD and check it out in a new worktree at `path`.
    pub fn create_worktree(&self, branch: &str, path: &Path) -> Result<()> {
        glog_debug!(
            "GitOps::create_worktree branch={} path={}",
            branch,
            path.display()
        );
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Branch names carry slashes; the folder name is a safe worktree name.
        let name = worktree_name(path).unwrap_or_else(|| branch.replace('/', "-"));
        repo.worktree(&name, path, Some(&opts))?;
        glog_debug!("Worktree {} created from {}", name, commit.id());
        Ok(())
    }

    /// Prune the worktree, delete its directory and admin entry.
    ///
    /// Best effort: a worktree git no longer knows about is still removed
    /// from disk.
    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        glog_debug!("GitOps::remove_worktree path={}", path.display());
        let repo = self.repo()?;
        let folder = worktree_name(path);

        let known = repo.worktrees()?.iter().flatten().find_map(|name| {
            let matches = repo
                .find_worktree(name)
                .map(|wt| wt.path() == path)
                .unwrap_or(false);
            (matches || Some(name) == folder.as_deref()).then(|| name.to_string())
        });

        if let Some(name) = &known {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                let pruned = worktree.prune(Some(
                    WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ));
                if let Err(e) = pruned {
                    glog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
            // A leftover admin dir makes git think the branch is still checked out.
            let admin = repo.path().join("worktrees").join(name);
            if admin.exists() {
                let _ = std::fs::remove_dir_all(&admin);
            }
        }

        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        result
    }

    /// Delete a local branch. Deleting a missing branch succeeds.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let result = match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => Ok(b.delete()?),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        result
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }
}

fn worktree_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
}
