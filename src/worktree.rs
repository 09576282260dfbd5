//! Worktree manager (§4.7): lifecycle of isolated working copies, built by
//! extending `git.rs`'s `worktree add/remove/list` wrapping with the naming,
//! status, and auto-cleanup policy the orchestrator needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::error::{ErrorCode, PipelineError};
use crate::git;
use crate::types::{Workspace, WorkspaceStatus};
use crate::{log_info, log_warn};

pub struct WorktreeManager {
    repo_dir: PathBuf,
    base_dir: PathBuf,
    prefix: String,
}

impl WorktreeManager {
    pub fn new(repo_dir: impl Into<PathBuf>, base_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            base_dir: base_dir.into(),
            prefix: prefix.into(),
        }
    }

    fn workspace_path(&self, suffix: &str) -> PathBuf {
        self.base_dir.join(format!("{}{}", self.prefix, suffix))
    }

    /// Creates a fresh workspace at `{baseDir}/{prefix}{suffix}` on a new
    /// branch `branch` off `base_branch`. `suffix` is typically the group's
    /// key or id; `branch` is the group's already-sanitized `branch_name`.
    pub fn create(
        &self,
        suffix: &str,
        branch: &str,
        base_branch: &str,
        issue_numbers: Vec<u64>,
    ) -> Result<Workspace, PipelineError> {
        let path = self.workspace_path(suffix);

        if path.exists() {
            return Err(PipelineError::new(
                ErrorCode::WorktreeCreateFailed,
                format!("workspace path already exists: {}", path.display()),
            ));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        git::worktree_add(&path, branch, base_branch, Some(&self.repo_dir)).map_err(|e| {
            PipelineError::new(ErrorCode::WorktreeCreateFailed, e)
        })?;

        let head_commit = git::get_head_sha(&path).map_err(|e| {
            PipelineError::new(ErrorCode::WorktreeCreateFailed, e)
        })?;

        let now = Utc::now();
        log_info!("[worktree] created {} on branch {}", path.display(), branch);

        Ok(Workspace {
            path,
            branch: branch.to_string(),
            head_commit,
            status: WorkspaceStatus::Ready,
            issue_numbers,
            created_at: now,
            last_activity_at: now,
        })
    }

    /// Lists every workspace currently registered under this repository,
    /// restricted to ones inside `base_dir` (worktrees created by other
    /// tooling are not this manager's concern).
    pub fn list(&self) -> Result<Vec<Workspace>, PipelineError> {
        let entries = git::worktree_list(Some(&self.repo_dir))
            .map_err(|e| PipelineError::new(ErrorCode::WorktreeError, e))?;

        let mut workspaces = Vec::new();
        for entry in entries {
            let path = PathBuf::from(&entry.path);
            if !path.starts_with(&self.base_dir) {
                continue;
            }
            let status = self.status(&path);
            let (created_at, last_activity_at) = file_times(&path);
            workspaces.push(Workspace {
                path,
                branch: entry.branch.unwrap_or_default(),
                head_commit: entry.head,
                status,
                issue_numbers: Vec::new(),
                created_at,
                last_activity_at,
            });
        }
        Ok(workspaces)
    }

    /// Status of a single workspace by path: `Removed` if the directory no
    /// longer exists, `Ready` otherwise. Callers that hold a live `Workspace`
    /// track `Busy`/`Error`/`Cleanup` themselves during the pipeline.
    pub fn status(&self, path: &Path) -> WorkspaceStatus {
        if path.exists() {
            WorkspaceStatus::Ready
        } else {
            WorkspaceStatus::Removed
        }
    }

    /// Removes a workspace directory. Per §9's open-question resolution,
    /// cleanup NEVER removes the branch regardless of success/failure — only
    /// the worktree directory is disposed of, so a failed pipeline's branch
    /// remains for diagnostics.
    pub fn remove(&self, workspace: &Workspace) -> Result<(), PipelineError> {
        git::worktree_remove(&workspace.path, true, Some(&self.repo_dir)).map_err(|e| {
            PipelineError::new(ErrorCode::WorktreeCleanupFailed, e)
        })?;
        log_info!("[worktree] removed {}", workspace.path.display());
        Ok(())
    }

    /// Scans registered workspaces for ones whose last filesystem activity
    /// predates `max_age` and removes them. Returns the paths removed.
    /// Best-effort: a single workspace's removal failure is logged and does
    /// not abort the scan.
    pub fn auto_cleanup(&self, max_age: Duration) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        let Ok(workspaces) = self.list() else {
            return removed;
        };
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();

        for workspace in workspaces {
            if workspace.last_activity_at > cutoff {
                continue;
            }
            match self.remove(&workspace) {
                Ok(()) => removed.push(workspace.path),
                Err(e) => log_warn!("[worktree] auto-cleanup failed for {}: {}", workspace.path.display(), e),
            }
        }
        removed
    }
}

fn file_times(path: &Path) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let Ok(metadata) = std::fs::metadata(path) else {
        let now = Utc::now();
        return (now, now);
    };
    let created = metadata
        .created()
        .ok()
        .map(chrono::DateTime::<Utc>::from)
        .unwrap_or_else(Utc::now);
    let modified = metadata
        .modified()
        .ok()
        .map(chrono::DateTime::<Utc>::from)
        .unwrap_or(created);
    (created, modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = Command::new("git").args(args).current_dir(dir.path()).status().unwrap();
            assert!(status.success());
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
        dir
    }

    #[test]
    fn create_then_list_then_remove_round_trips() {
        let repo = init_repo();
        let base_dir = repo.path().join(".auto-fix/worktrees");
        let manager = WorktreeManager::new(repo.path(), &base_dir, "autofix-");

        let workspace = manager
            .create("button", "fix/button/issue-1", "main", vec![1])
            .expect("create succeeds");
        assert!(workspace.path.exists());
        assert_eq!(workspace.status, WorkspaceStatus::Ready);

        let listed = manager.list().expect("list succeeds");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].branch, "fix/button/issue-1");

        manager.remove(&workspace).expect("remove succeeds");
        assert!(!workspace.path.exists());
    }

    #[test]
    fn create_refuses_when_branch_already_exists() {
        let repo = init_repo();
        let status = Command::new("git")
            .args(["branch", "fix/dup"])
            .current_dir(repo.path())
            .status()
            .unwrap();
        assert!(status.success());

        let base_dir = repo.path().join(".auto-fix/worktrees");
        let manager = WorktreeManager::new(repo.path(), &base_dir, "autofix-");
        let result = manager.create("dup", "fix/dup", "main", vec![1]);
        assert!(result.is_err());
    }

    #[test]
    fn status_reports_removed_for_missing_path() {
        let repo = init_repo();
        let manager = WorktreeManager::new(repo.path(), repo.path().join(".auto-fix/worktrees"), "autofix-");
        assert_eq!(manager.status(&repo.path().join("nope")), WorkspaceStatus::Removed);
    }
}
