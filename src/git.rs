use std::path::Path;
use std::process::Command;

/// A single entry from `git status --porcelain` output.
///
/// Note: porcelain v1 format uses ASCII for the two-character status code and space separator,
/// so byte-offset slicing at positions 0..2 and 3.. is safe. File paths with special characters
/// may be quoted by git.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    /// Two-character status code (e.g., "M ", "??", "A ")
    pub status_code: String,
    /// The file path
    pub path: String,
}

/// Verify only that a git repository exists in the given directory.
///
/// Does not check working tree cleanliness, branch state, or rebase/merge status.
/// Use this when you only need to confirm git is available (e.g., `init`).
pub fn is_git_repo(repo_dir: Option<&Path>) -> Result<(), String> {
    run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;
    Ok(())
}

/// Verify git preconditions for safe orchestrator operation.
///
/// Checks:
/// - Git repo exists (`git rev-parse --git-dir`)
/// - Working tree is clean (`git status --porcelain` is empty)
/// - Not in detached HEAD or rebase/merge state
pub fn check_preconditions(repo_dir: Option<&Path>) -> Result<(), String> {
    // Verify git repo exists and capture git dir path for later checks
    let git_dir_output = run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;

    // Check for clean working tree
    let status_output = run_git_command(&["status", "--porcelain"], repo_dir)?;
    if !status_output.trim().is_empty() {
        return Err(
            "Working tree is not clean. Commit or stash changes before running the orchestrator."
                .to_string(),
        );
    }

    // Check for detached HEAD
    let head_check = run_git_command(&["symbolic-ref", "--quiet", "HEAD"], repo_dir);
    if head_check.is_err() {
        return Err(
            "Detached HEAD state detected. Check out a branch before running the orchestrator."
                .to_string(),
        );
    }

    // Check for rebase/merge in progress
    let git_dir_path = if let Some(base) = repo_dir {
        base.join(git_dir_output.trim())
    } else {
        std::path::PathBuf::from(git_dir_output.trim())
    };

    if git_dir_path.join("rebase-merge").exists() || git_dir_path.join("rebase-apply").exists() {
        return Err(
            "Rebase in progress. Complete or abort the rebase before running the orchestrator."
                .to_string(),
        );
    }

    if git_dir_path.join("MERGE_HEAD").exists() {
        return Err(
            "Merge in progress. Complete or abort the merge before running the orchestrator."
                .to_string(),
        );
    }

    Ok(())
}

/// Stage specific file paths for commit in a specific repo directory.
///
/// Uses `git add` with explicit paths only (never `-A` or `.`).
pub fn stage_paths(paths: &[&Path], repo_dir: Option<&Path>) -> Result<(), String> {
    if paths.is_empty() {
        return Ok(());
    }

    let mut args = vec!["add".to_string(), "--".to_string()];
    for p in paths {
        args.push(
            p.to_str()
                .ok_or_else(|| format!("Path contains invalid UTF-8: {:?}", p))?
                .to_string(),
        );
    }

    let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    run_git_command(&args_ref, repo_dir)?;
    Ok(())
}

/// Create a git commit with the given message.
///
/// Returns the commit hash on success. If the commit fails, returns an error
/// (caller treats as phase failure).
pub fn commit(message: &str, repo_dir: Option<&Path>) -> Result<String, String> {
    run_git_command(&["commit", "-m", message], repo_dir)?;
    let hash = run_git_command(&["rev-parse", "HEAD"], repo_dir)?;
    Ok(hash.trim().to_string())
}

/// Parse `git status --porcelain` output into structured entries.
pub fn get_status(repo_dir: Option<&Path>) -> Result<Vec<StatusEntry>, String> {
    let output = run_git_command(&["status", "--porcelain"], repo_dir)?;

    let entries = output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            if line.len() < 3 {
                // Malformed porcelain output line -- skip
                None
            } else {
                Some(StatusEntry {
                    status_code: line[..2].to_string(),
                    path: line[3..].to_string(),
                })
            }
        })
        .collect();

    Ok(entries)
}

/// Returns the full 40-character SHA of HEAD.
pub fn get_head_sha(project_root: &Path) -> Result<String, String> {
    let output = run_git_command(&["rev-parse", "HEAD"], Some(project_root))?;
    Ok(output.trim().to_string())
}

/// Checks whether `sha` is an ancestor of the current HEAD.
///
/// Uses `git merge-base --is-ancestor`:
/// - Exit 0 → true (sha is an ancestor of HEAD)
/// - Exit 1 → false (sha is not an ancestor)
/// - Exit 128 → Err (unknown commit / other git error)
pub fn is_ancestor(sha: &str, project_root: &Path) -> Result<bool, String> {
    if sha.is_empty() || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("Invalid SHA: '{}'", sha));
    }

    let mut cmd = Command::new("git");
    cmd.args(["merge-base", "--is-ancestor", sha, "HEAD"]);
    cmd.current_dir(project_root);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git merge-base: {}", e))?;

    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        Some(128) | None => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("git merge-base failed: {}", stderr.trim()))
        }
        Some(code) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "git merge-base exited with unexpected code {}: {}",
                code,
                stderr.trim()
            ))
        }
    }
}

/// Create a worktree at `path` on a new branch `branch` based off `base_branch`.
/// Refuses (returns `Err`) if the branch already exists locally.
pub fn worktree_add(
    path: &Path,
    branch: &str,
    base_branch: &str,
    repo_dir: Option<&Path>,
) -> Result<(), String> {
    if branch_exists(branch, repo_dir)? {
        return Err(format!("branch '{}' already exists", branch));
    }

    let path_str = path
        .to_str()
        .ok_or_else(|| format!("Path contains invalid UTF-8: {:?}", path))?;

    run_git_command(
        &["worktree", "add", "-b", branch, path_str, base_branch],
        repo_dir,
    )?;
    Ok(())
}

/// Removes a worktree at `path`. `force` discards uncommitted changes in it.
pub fn worktree_remove(path: &Path, force: bool, repo_dir: Option<&Path>) -> Result<(), String> {
    let path_str = path
        .to_str()
        .ok_or_else(|| format!("Path contains invalid UTF-8: {:?}", path))?;

    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(path_str);

    run_git_command(&args, repo_dir)?;
    Ok(())
}

/// Deletes a local branch. `force` allows deleting a branch not fully merged.
pub fn delete_branch(branch: &str, force: bool, repo_dir: Option<&Path>) -> Result<(), String> {
    let flag = if force { "-D" } else { "-d" };
    run_git_command(&["branch", flag, branch], repo_dir)?;
    Ok(())
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeEntry {
    pub path: String,
    pub head: String,
    pub branch: Option<String>,
}

/// Lists all worktrees registered against this repository.
pub fn worktree_list(repo_dir: Option<&Path>) -> Result<Vec<WorktreeEntry>, String> {
    let output = run_git_command(&["worktree", "list", "--porcelain"], repo_dir)?;
    Ok(parse_worktree_list(&output))
}

fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut path: Option<String> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    for line in output.lines() {
        if let Some(value) = line.strip_prefix("worktree ") {
            if let Some(p) = path.take() {
                entries.push(WorktreeEntry {
                    path: p,
                    head: head.take().unwrap_or_default(),
                    branch: branch.take(),
                });
            }
            path = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("HEAD ") {
            head = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("branch ") {
            branch = Some(
                value
                    .strip_prefix("refs/heads/")
                    .unwrap_or(value)
                    .to_string(),
            );
        }
    }
    if let Some(p) = path {
        entries.push(WorktreeEntry {
            path: p,
            head: head.unwrap_or_default(),
            branch,
        });
    }
    entries
}

fn branch_exists(branch: &str, repo_dir: Option<&Path>) -> Result<bool, String> {
    let mut cmd = Command::new("git");
    cmd.args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")]);
    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }
    let status = cmd
        .status()
        .map_err(|e| format!("Failed to run git show-ref: {}", e))?;
    Ok(status.success())
}

/// Run a git command and return its stdout as a string.
fn run_git_command(args: &[&str], repo_dir: Option<&Path>) -> Result<String, String> {
    let mut cmd = Command::new("git");
    cmd.args(args);

    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        ));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("git output is not valid UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_worktree_list_reads_multiple_entries() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\n\
             worktree /repo/.auto-fix/worktrees/autofix-button\n\
             HEAD def456\nbranch refs/heads/fix/button/issue-1\n";
        let entries = parse_worktree_list(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/repo");
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].branch.as_deref(), Some("fix/button/issue-1"));
    }

    #[test]
    fn parse_worktree_list_handles_detached_head_without_branch_line() {
        let output = "worktree /repo/detached\nHEAD abc123\ndetached\n";
        let entries = parse_worktree_list(output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].branch, None);
    }
}
