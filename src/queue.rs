//! Bounded-concurrency work queue dispatcher (§4.2): hands each `IssueGroup`
//! to its own task via `tokio::task::JoinSet`, capped at `max_parallel`
//! concurrent groups, mirroring the teacher's `scheduler.rs` dispatch loop
//! generalized from its backlog-item model to this codebase's group model.

use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::ai::AiCollaborator;
use crate::dry_run::DryRunLog;
use crate::github::{IssueTracker, PullRequestHost};
use crate::orchestrator::{run_group, Deps, GroupOutcome};
use crate::signals::is_shutdown_requested;
use crate::types::{HaltReason, IssueGroup, RunSummary};
use crate::{log_info, log_warn};

/// Runs every group in `groups` with at most `max_parallel` running
/// concurrently. Returns once every group has either completed or been
/// abandoned because of a shutdown request.
pub async fn run_all<A, I, P>(
    groups: Vec<IssueGroup>,
    deps: Deps<A, I, P>,
    max_parallel: u32,
    cancel: CancellationToken,
) -> (RunSummary, DryRunLog)
where
    A: AiCollaborator + 'static,
    I: IssueTracker + 'static,
    P: PullRequestHost + 'static,
{
    let started = Instant::now();
    let max_parallel = max_parallel.clamp(1, 10) as usize;
    let mut pending = groups.into_iter();
    let mut join_set: JoinSet<(GroupOutcome, DryRunLog)> = JoinSet::new();

    let mut groups_completed = Vec::new();
    let mut groups_failed = Vec::new();
    let mut prs_opened = 0u32;
    let mut dry_run_log = DryRunLog::new();
    let mut halt_reason = HaltReason::AllDone;

    // Prime the initial batch of concurrent slots.
    for _ in 0..max_parallel {
        if !spawn_next(&mut pending, &mut join_set, &deps, &cancel) {
            break;
        }
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok((outcome, log)) => {
                dry_run_log.merge(log);
                if outcome.success {
                    log_info!("[queue] group {} completed", outcome.group_key);
                    groups_completed.push(outcome.group_key);
                    if outcome.pr.is_some() {
                        prs_opened += 1;
                    }
                } else {
                    let reason = outcome.error.map(|e| e.message).unwrap_or_default();
                    log_warn!("[queue] group {} failed: {}", outcome.group_key, reason);
                    groups_failed.push(outcome.group_key);
                }
            }
            Err(join_error) => {
                log_warn!("[queue] group task panicked or was cancelled: {}", join_error);
            }
        }

        if is_shutdown_requested() && halt_reason != HaltReason::ShutdownRequested {
            halt_reason = HaltReason::ShutdownRequested;
            cancel.cancel();
            // Any group that never got a chance to start is marked failed
            // with the interrupt reason rather than silently dropped (§8
            // scenario 5). Groups already running are left in `join_set` to
            // drain naturally: each notices `cancel`/the shutdown flag at its
            // next stage boundary and runs its own `cleanup` stage, so
            // worktrees and branches are never abandoned mid-checkout. An
            // `abort_all()` here would skip straight past that cleanup.
            for group in pending.by_ref() {
                log_warn!("[queue] group {} never started: shutdown requested", group.key);
                groups_failed.push(group.key);
            }
        }

        if halt_reason != HaltReason::ShutdownRequested {
            spawn_next(&mut pending, &mut join_set, &deps, &cancel);
        }
    }

    if !groups_failed.is_empty() && halt_reason == HaltReason::AllDone {
        halt_reason = HaltReason::Error;
    }

    let summary = RunSummary {
        groups_completed,
        groups_failed,
        prs_opened,
        halt_reason,
        total_duration_ms: started.elapsed().as_millis() as u64,
    };
    (summary, dry_run_log)
}

fn spawn_next<A, I, P>(
    pending: &mut std::vec::IntoIter<IssueGroup>,
    join_set: &mut JoinSet<(GroupOutcome, DryRunLog)>,
    deps: &Deps<A, I, P>,
    cancel: &CancellationToken,
) -> bool
where
    A: AiCollaborator + 'static,
    I: IssueTracker + 'static,
    P: PullRequestHost + 'static,
{
    let Some(group) = pending.next() else {
        return false;
    };
    if is_shutdown_requested() {
        return false;
    }
    let deps = deps.clone();
    let cancel = cancel.clone();
    join_set.spawn(async move { run_group(group, &deps, cancel).await });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockAiCollaborator;
    use crate::checks::CheckRunner;
    use crate::config::ChecksConfig;
    use crate::progress::ProgressReporter;
    use crate::types::{FixAnalysis, FixResult, GroupBy, Issue, IssueContext, IssueState, IssueType, Priority};
    use crate::worktree::WorktreeManager;
    use std::sync::Arc;

    struct NoopTracker;
    impl IssueTracker for NoopTracker {
        async fn fetch_open_issues(&self, _label: Option<&str>) -> Result<Vec<Issue>, crate::error::PipelineError> {
            Ok(vec![])
        }
        async fn create_issue(&self, _issue: crate::github::NewIssue<'_>) -> Result<Issue, crate::error::PipelineError> {
            unreachable!()
        }
        async fn add_labels(&self, _issue_number: u64, _labels: &[String]) -> Result<(), crate::error::PipelineError> {
            Ok(())
        }
        async fn remove_label(&self, _issue_number: u64, _label: &str) -> Result<(), crate::error::PipelineError> {
            Ok(())
        }
        async fn add_comment(&self, _issue_number: u64, _body: &str) -> Result<(), crate::error::PipelineError> {
            Ok(())
        }
    }

    struct NoopPrHost;
    impl PullRequestHost for NoopPrHost {
        async fn create_pull_request(
            &self,
            pr: crate::github::NewPullRequest<'_>,
        ) -> Result<crate::types::PullRequestRef, crate::error::PipelineError> {
            Ok(crate::types::PullRequestRef {
                number: 1,
                url: "https://example.com/pr/1".to_string(),
                head: pr.head.to_string(),
                base: pr.base.to_string(),
                reused_existing: false,
            })
        }
        async fn find_pull_request_by_head(
            &self,
            _head: &str,
        ) -> Result<Option<crate::types::PullRequestRef>, crate::error::PipelineError> {
            Ok(None)
        }
        async fn request_reviewers(&self, _pr_number: u64, _reviewers: &[String]) -> Result<(), crate::error::PipelineError> {
            Ok(())
        }
    }

    fn sample_group(key: &str) -> IssueGroup {
        let issue = Issue {
            number: 1,
            title: "x".to_string(),
            body: "x".to_string(),
            state: IssueState::Open,
            issue_type: IssueType::Bug,
            labels: vec![],
            assignees: vec![],
            context: IssueContext::default(),
            acceptance_criteria: vec![],
            related_issues: vec![],
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            url: "https://example.com".to_string(),
        };
        IssueGroup {
            id: key.to_string(),
            name: key.to_string(),
            group_by: GroupBy::Component,
            key: key.to_string(),
            issues: vec![issue],
            branch_name: format!("fix/{key}"),
            related_files: vec![],
            components: vec![key.to_string()],
            priority: Priority::Low,
        }
    }

    fn sample_deps() -> Deps<MockAiCollaborator, NoopTracker, NoopPrHost> {
        let analysis = FixAnalysis {
            root_cause: "r".to_string(),
            suggested_fix: "s".to_string(),
            affected_files: vec![],
            complexity: "small".to_string(),
            confidence: 0.9,
        };
        let fix = FixResult {
            success: true,
            summary: "done".to_string(),
            files_modified: vec![],
            commit_message: "fix".to_string(),
        };
        let ai = MockAiCollaborator::new()
            .with_analyze_results(vec![Ok(analysis.clone()), Ok(analysis.clone()), Ok(analysis)])
            .with_fix_results(vec![Ok(fix.clone()), Ok(fix.clone()), Ok(fix)]);
        Deps {
            ai: Arc::new(ai),
            issue_tracker: Arc::new(NoopTracker),
            pr_host: Arc::new(NoopPrHost),
            worktree: Arc::new(WorktreeManager::new("/tmp/unused-repo", "/tmp/unused-worktrees", "autofix-")),
            checks: Arc::new(CheckRunner::new(ChecksConfig::default())),
            progress: ProgressReporter::new(),
            default_branch: "main".to_string(),
            auto_fix_label: "auto-fix".to_string(),
            max_retries: 1,
            dry_run: true,
        }
    }

    #[tokio::test]
    async fn run_all_processes_every_group_and_reports_success() {
        let groups = vec![sample_group("a"), sample_group("b"), sample_group("c")];
        let (summary, log) = run_all(groups, sample_deps(), 2, CancellationToken::new()).await;
        assert_eq!(summary.groups_completed.len(), 3);
        assert!(summary.groups_failed.is_empty());
        assert_eq!(summary.halt_reason, HaltReason::AllDone);
        assert!(!log.is_empty());
    }

    #[tokio::test]
    async fn run_all_on_empty_input_completes_immediately() {
        let (summary, _log) = run_all(vec![], sample_deps(), 3, CancellationToken::new()).await;
        assert!(summary.groups_completed.is_empty());
        assert!(summary.groups_failed.is_empty());
    }

    /// A collaborator whose `analyze` takes long enough to land in the
    /// middle of a stage when the shutdown flag flips, so the group task is
    /// still in flight inside `join_set` at that moment.
    struct SlowAiCollaborator;

    impl crate::ai::AiCollaborator for SlowAiCollaborator {
        async fn analyze(
            &self,
            _group: &IssueGroup,
            _workspace: &std::path::Path,
        ) -> Result<FixAnalysis, crate::error::PipelineError> {
            tokio::time::sleep(std::time::Duration::from_millis(120)).await;
            Ok(FixAnalysis {
                root_cause: "r".to_string(),
                suggested_fix: "s".to_string(),
                affected_files: vec![],
                complexity: "small".to_string(),
                confidence: 0.9,
            })
        }

        async fn fix(
            &self,
            _group: &IssueGroup,
            _analysis: &FixAnalysis,
            _workspace: &std::path::Path,
        ) -> Result<FixResult, crate::error::PipelineError> {
            Ok(FixResult {
                success: true,
                summary: "done".to_string(),
                files_modified: vec![],
                commit_message: "fix".to_string(),
            })
        }

        async fn retry_fix(
            &self,
            _group: &IssueGroup,
            _analysis: &FixAnalysis,
            _previous_summary: &str,
            _test_error: &str,
            _workspace: &std::path::Path,
        ) -> Result<FixResult, crate::error::PipelineError> {
            unreachable!("not exercised by this test")
        }

        async fn classify(
            &self,
            _params: &crate::prompt::TriagePromptParams<'_>,
            _workspace: &std::path::Path,
        ) -> Result<crate::types::AnalysisRecord, crate::error::PipelineError> {
            unreachable!("not exercised by this test")
        }
    }

    /// Regression test for the cancellation/cleanup-leak fix: a shutdown
    /// signal arriving mid-run must not abort the group task already in
    /// flight. It should be left to drain through the orchestrator's own
    /// `cleanup` stage (recorded as a normal, graceful outcome) rather than
    /// vanishing as a `JoinError` from an aborted task.
    #[tokio::test]
    async fn shutdown_lets_in_flight_group_drain_instead_of_aborting() {
        let deps = Deps {
            ai: Arc::new(SlowAiCollaborator),
            issue_tracker: Arc::new(NoopTracker),
            pr_host: Arc::new(NoopPrHost),
            worktree: Arc::new(WorktreeManager::new("/tmp/unused-repo", "/tmp/unused-worktrees", "autofix-")),
            checks: Arc::new(CheckRunner::new(ChecksConfig::default())),
            progress: ProgressReporter::new(),
            default_branch: "main".to_string(),
            auto_fix_label: "auto-fix".to_string(),
            max_retries: 1,
            dry_run: true,
        };

        let groups = vec![sample_group("a"), sample_group("b")];

        tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            crate::signals::set_shutdown_flag_for_testing(true);
        });

        let (summary, _log) = run_all(groups, deps, 1, CancellationToken::new()).await;
        crate::signals::set_shutdown_flag_for_testing(false);

        assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
        // Neither group is lost: the in-flight one drains through its own
        // cleanup stage (failed, with an interrupted reason) and the
        // never-started one is marked failed explicitly. A `JoinError` from
        // an aborted task would mean neither counter was incremented for it.
        assert_eq!(summary.groups_completed.len() + summary.groups_failed.len(), 2);
    }
}
