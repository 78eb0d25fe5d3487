//! Branch-backed git worktrees, one per model per benchmark run.
//!
//! Every worktree this crate creates is recorded in `worktrees/manifest.json`
//! under the state root. Removal is best effort: git and filesystem failures
//! are reported as warnings and the manifest entry is dropped regardless.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use modelbench_core::naming::{branch_name, worktree_name};
use modelbench_core::shell::{command_line, run_checked};
use modelbench_core::{BenchConfig, BenchError, JsonDocument, ShellRunner, Worktree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BRANCH_PREFIX: &str = "bench";
const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorktreeManifest {
    #[serde(default)]
    worktrees: BTreeMap<String, Worktree>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalReport {
    pub name: String,
    pub warnings: Vec<String>,
}

impl RemovalReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub run_id: String,
    pub removed: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct WorktreeManager {
    repo: PathBuf,
    state_root: PathBuf,
    root: PathBuf,
    branch_prefix: String,
    git_timeout: Duration,
    shell: Arc<dyn ShellRunner>,
    manifest: JsonDocument<WorktreeManifest>,
}

impl WorktreeManager {
    /// Manage worktrees of the repository at `repo`, keeping them and their
    /// manifest under `state_root/worktrees`.
    pub fn new(
        repo: impl Into<PathBuf>,
        state_root: impl Into<PathBuf>,
        shell: Arc<dyn ShellRunner>,
    ) -> Self {
        let state_root = state_root.into();
        let root = state_root.join("worktrees");
        let manifest = JsonDocument::new(root.join("manifest.json"));
        Self {
            repo: repo.into(),
            state_root,
            root,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            git_timeout: DEFAULT_GIT_TIMEOUT,
            shell,
            manifest,
        }
    }

    pub fn from_config(repo: &Path, cfg: &BenchConfig, shell: Arc<dyn ShellRunner>) -> Self {
        Self::new(repo, cfg.root_path(repo), shell)
            .with_branch_prefix(&cfg.git.branch_prefix)
            .with_git_timeout(cfg.git.timeout())
    }

    pub fn with_branch_prefix(mut self, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            self.branch_prefix = prefix.to_string();
        }
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the worktree for `model_id` in `run_id`, branched from `base`.
    ///
    /// A branch left behind by an earlier attempt is deleted and creation
    /// retried once. Any other git failure propagates.
    pub fn create(&self, run_id: &str, model_id: &str, base: &str) -> Result<Worktree> {
        if run_id.trim().is_empty() || model_id.trim().is_empty() {
            return Err(BenchError::validation("run id and model id must be non-empty").into());
        }
        if base.trim().is_empty() {
            return Err(BenchError::validation("base revision must be non-empty").into());
        }

        let name = worktree_name(run_id, model_id);
        let branch = branch_name(&self.branch_prefix, run_id, model_id);
        let path = self.root.join(&name);

        if self.manifest.load().worktrees.contains_key(&name) {
            return Err(anyhow!("worktree {name} already exists"));
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        if path.exists() {
            tracing::warn!(path = %path.display(), "removing stale worktree directory");
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove stale {}", path.display()))?;
            self.prune_registrations();
        }

        match self.add_worktree(&branch, &path, base) {
            Ok(()) => {}
            Err(err) if is_branch_exists(&err) => {
                tracing::warn!(branch = %branch, "branch already exists, deleting and retrying");
                self.prune_registrations();
                if let Err(err) = self.git(&self.repo, &["branch", "-D", &branch]) {
                    tracing::warn!(branch = %branch, error = %err, "failed to delete stale branch");
                }
                self.add_worktree(&branch, &path, base)?;
            }
            Err(err) => return Err(err),
        }

        let worktree = Worktree {
            name: name.clone(),
            path: path.clone(),
            branch: branch.clone(),
            run_id: run_id.to_string(),
            model_id: model_id.to_string(),
            base_commit: base.to_string(),
            created_at: Utc::now(),
        };
        let recorded = self.manifest.update(|manifest| {
            manifest.worktrees.insert(name.clone(), worktree.clone());
            Ok(())
        });
        if let Err(err) = recorded {
            let path_arg = path.to_string_lossy();
            let removed = self.git(&self.repo, &["worktree", "remove", "--force", &path_arg]);
            if let Err(rm_err) = removed {
                tracing::warn!(
                    path = %path.display(),
                    error = %format!("{rm_err:#}"),
                    "rollback could not remove worktree"
                );
            }
            if let Err(br_err) = self.git(&self.repo, &["branch", "-D", &branch]) {
                tracing::warn!(
                    branch = %branch,
                    error = %format!("{br_err:#}"),
                    "rollback could not delete branch"
                );
            }
            return Err(err.context(format!("failed to record worktree {name}")));
        }

        tracing::debug!(name = %name, branch = %branch, path = %path.display(), "worktree created");
        Ok(worktree)
    }

    /// Remove a worktree's directory, its registration and its branch.
    pub fn remove(&self, name: &str) -> Result<RemovalReport> {
        let worktree = self
            .get(name)
            .ok_or_else(|| BenchError::WorktreeNotFound(name.to_string()))?;
        let mut warnings = Vec::new();

        if worktree.path.exists() {
            let path_arg = worktree.path.to_string_lossy();
            if let Err(err) = self.git(&self.repo, &["worktree", "remove", "--force", &path_arg]) {
                warnings.push(format!("git worktree remove failed: {err:#}"));
            }
            if worktree.path.exists() {
                if let Err(err) = fs::remove_dir_all(&worktree.path) {
                    warnings.push(format!(
                        "failed to delete {}: {err}",
                        worktree.path.display()
                    ));
                }
                if let Err(err) = self.git(&self.repo, &["worktree", "prune"]) {
                    warnings.push(format!("git worktree prune failed: {err:#}"));
                }
            }
        } else if let Err(err) = self.git(&self.repo, &["worktree", "prune"]) {
            warnings.push(format!("git worktree prune failed: {err:#}"));
        }

        if let Err(err) = self.git(&self.repo, &["branch", "-D", &worktree.branch]) {
            warnings.push(format!(
                "failed to delete branch {}: {err:#}",
                worktree.branch
            ));
        }

        self.manifest.update(|manifest| {
            manifest.worktrees.remove(name);
            Ok(())
        })?;

        for warning in &warnings {
            tracing::warn!(worktree = name, "{warning}");
        }
        Ok(RemovalReport {
            name: name.to_string(),
            warnings,
        })
    }

    pub fn list(&self) -> Vec<Worktree> {
        let mut all: Vec<Worktree> = self.manifest.load().worktrees.into_values().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        all
    }

    pub fn get(&self, name: &str) -> Option<Worktree> {
        self.manifest.load().worktrees.remove(name)
    }

    pub fn get_by_run(&self, run_id: &str) -> Vec<Worktree> {
        self.list()
            .into_iter()
            .filter(|w| w.run_id == run_id)
            .collect()
    }

    /// Discard every change in the worktree, back to its base revision.
    pub fn reset(&self, name: &str) -> Result<()> {
        let worktree = self
            .get(name)
            .ok_or_else(|| BenchError::WorktreeNotFound(name.to_string()))?;
        self.git(&worktree.path, &["reset", "--hard", &worktree.base_commit])?;
        self.git(&worktree.path, &["clean", "-fd"])?;
        Ok(())
    }

    pub fn cleanup_run(&self, run_id: &str) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            run_id: run_id.to_string(),
            ..CleanupReport::default()
        };
        for worktree in self.get_by_run(run_id) {
            match self.remove(&worktree.name) {
                Ok(removal) => {
                    report.removed.push(removal.name);
                    report.warnings.extend(
                        removal
                            .warnings
                            .into_iter()
                            .map(|w| format!("{}: {w}", worktree.name)),
                    );
                }
                Err(err) => report
                    .warnings
                    .push(format!("{}: {err:#}", worktree.name)),
            }
        }
        Ok(report)
    }

    /// Forget stale git registrations and manifest entries whose directory
    /// is gone. Returns the names dropped from the manifest.
    pub fn prune(&self) -> Result<Vec<String>> {
        self.prune_registrations();
        self.manifest.update(|manifest| {
            let missing: Vec<String> = manifest
                .worktrees
                .iter()
                .filter(|(_, w)| !w.path.exists())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &missing {
                manifest.worktrees.remove(name);
            }
            Ok(missing)
        })
    }

    pub fn current_revision(&self) -> Result<String> {
        let out = self
            .git(&self.repo, &["rev-parse", "HEAD"])
            .context("failed to resolve HEAD")?;
        Ok(out.trim().to_string())
    }

    /// True when the source repository has no uncommitted changes outside
    /// the state root.
    pub fn is_clean(&self) -> Result<bool> {
        let status = self.git(&self.repo, &["status", "--porcelain"])?;
        let ignored = self
            .state_root
            .strip_prefix(&self.repo)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .filter(|rel| !rel.is_empty());
        Ok(status
            .lines()
            .filter(|line| !line.trim().is_empty())
            .all(|line| {
                let path = line.get(3..).unwrap_or("").trim_matches('"');
                ignored
                    .as_deref()
                    .is_some_and(|rel| path == rel || path.starts_with(&format!("{rel}/")))
            }))
    }

    fn add_worktree(&self, branch: &str, path: &Path, base: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        let cmd = command_line(["git", "worktree", "add", "-b", branch, &path_arg, base]);
        let out = self.shell.run(&cmd, &self.repo, self.git_timeout)?;
        if out.success() {
            return Ok(());
        }
        let stderr = out.stderr.trim().to_string();
        if stderr.contains("branch named") && stderr.contains("already exists") {
            return Err(BenchError::BranchExists(branch.to_string()).into());
        }
        Err(BenchError::CommandFailed {
            command: cmd,
            status: out.status,
            stderr: if out.timed_out {
                format!("timed out after {}s", self.git_timeout.as_secs())
            } else {
                stderr
            },
        }
        .into())
    }

    fn prune_registrations(&self) {
        if let Err(err) = self.git(&self.repo, &["worktree", "prune"]) {
            tracing::warn!(error = %err, "git worktree prune failed");
        }
    }

    fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let cmd = command_line(std::iter::once("git").chain(args.iter().copied()));
        run_checked(self.shell.as_ref(), &cmd, cwd, self.git_timeout)
    }
}

fn is_branch_exists(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<BenchError>(),
        Some(BenchError::BranchExists(_))
    )
}
