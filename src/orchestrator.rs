//! Per-group pipeline (§4.3): drives one `IssueGroup` through the stage
//! state machine. Each group is handed to its own task by the queue
//! dispatcher, which already gives the group's `PipelineContext` exclusive,
//! single-owner access for its whole lifetime — the same guarantee the
//! teacher's coordinator actor provides via an mpsc command channel, so no
//! additional actor wiring is needed here; the stage loop below IS the
//! actor body.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::ai::AiCollaborator;
use crate::checks::{CheckRunner, PackageManager};
use crate::dry_run::{self, DryRunLog};
use crate::error::{ErrorCode, PipelineError};
use crate::git;
use crate::github::{IssueTracker, NewPullRequest, PullRequestHost};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::signals::{is_shutdown_requested, run_supervised};
use crate::types::{IssueGroup, PipelineContext, PullRequestRef, Stage};
use crate::worktree::WorktreeManager;
use crate::{log_info, log_warn};

/// A stage function's report to the top-level loop. Never exceptions —
/// control flow over stage transitions is a plain match on this enum.
#[derive(Debug)]
pub enum StageOutcome {
    Advance,
    Retry(PipelineError),
    Fatal(PipelineError),
}

/// Everything a group's pipeline needs, shared read-only across every group
/// task via `Arc`. Generic over the tracker/host implementations so tests
/// can substitute mocks without trait objects (the traits return `impl
/// Future`, which isn't object-safe).
pub struct Deps<A, I, P>
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    pub ai: Arc<A>,
    pub issue_tracker: Arc<I>,
    pub pr_host: Arc<P>,
    pub worktree: Arc<WorktreeManager>,
    pub checks: Arc<CheckRunner>,
    pub progress: ProgressReporter,
    pub default_branch: String,
    pub auto_fix_label: String,
    pub max_retries: u32,
    pub dry_run: bool,
}

impl<A, I, P> Clone for Deps<A, I, P>
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    fn clone(&self) -> Self {
        Self {
            ai: self.ai.clone(),
            issue_tracker: self.issue_tracker.clone(),
            pr_host: self.pr_host.clone(),
            worktree: self.worktree.clone(),
            checks: self.checks.clone(),
            progress: self.progress.clone(),
            default_branch: self.default_branch.clone(),
            auto_fix_label: self.auto_fix_label.clone(),
            max_retries: self.max_retries,
            dry_run: self.dry_run,
        }
    }
}

#[derive(Debug)]
pub struct GroupOutcome {
    pub group_key: String,
    pub success: bool,
    pub pr: Option<PullRequestRef>,
    pub error: Option<PipelineError>,
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(2))
}

pub async fn run_group<A, I, P>(
    group: IssueGroup,
    deps: &Deps<A, I, P>,
    cancel: CancellationToken,
) -> (GroupOutcome, DryRunLog)
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    let group_key = group.key.clone();
    deps.progress.publish(ProgressEvent::GroupStarted {
        group_key: group_key.clone(),
        at: Utc::now(),
    });

    let mut ctx = PipelineContext::new(group, deps.max_retries, deps.dry_run);
    let mut dry_run_log = DryRunLog::new();
    let mut fatal_error: Option<PipelineError> = None;

    loop {
        if ctx.stage == Stage::Done {
            break;
        }
        if (cancel.is_cancelled() || is_shutdown_requested()) && ctx.stage != Stage::Cleanup {
            fatal_error.get_or_insert_with(|| {
                PipelineError::new(ErrorCode::Interrupted, "shutdown requested mid-pipeline")
            });
            ctx.stage = Stage::Cleanup;
        }

        deps.progress.publish(ProgressEvent::StageStarted {
            group_key: group_key.clone(),
            stage: ctx.stage,
            at: Utc::now(),
        });

        let outcome = run_stage(&mut ctx, deps, &mut dry_run_log).await;

        match outcome {
            StageOutcome::Advance => {
                deps.progress.publish(ProgressEvent::StageCompleted {
                    group_key: group_key.clone(),
                    stage: ctx.stage,
                    at: Utc::now(),
                });
                ctx.attempt = 0;
                ctx.stage = ctx.stage.next();
            }
            StageOutcome::Retry(err) => {
                // `checks` shares its retry budget with the whole
                // checks/ai_fix/install_deps cycle via `check_cycle_attempt`,
                // which outlives the `ctx.attempt` resets the intervening
                // stages' own `Advance`s trigger; every other stage gates on
                // its own `ctx.attempt` as before.
                let in_checks_cycle = ctx.stage == Stage::Checks;
                let cycle_attempt = if in_checks_cycle { ctx.check_cycle_attempt } else { ctx.attempt };

                if cycle_attempt >= ctx.max_retries {
                    fatal_error = Some(err);
                    ctx.stage = Stage::Cleanup;
                } else {
                    let reason = err.message.clone();
                    deps.progress.publish(ProgressEvent::StageRetried {
                        group_key: group_key.clone(),
                        stage: ctx.stage,
                        attempt: cycle_attempt + 1,
                        reason,
                        at: Utc::now(),
                    });
                    ctx.record_error(err);
                    tokio::time::sleep(backoff_delay(cycle_attempt)).await;
                    // A failed `checks` re-enters `ai_fix` with the failure as
                    // context rather than re-running checks on unchanged code.
                    if in_checks_cycle {
                        ctx.check_cycle_attempt += 1;
                        ctx.stage = Stage::AiFix;
                    } else {
                        ctx.attempt += 1;
                    }
                }
            }
            StageOutcome::Fatal(err) => {
                if ctx.stage == Stage::Cleanup {
                    fatal_error = Some(err);
                    break;
                }
                ctx.attempt = 0;
                ctx.stage = Stage::Cleanup;
                fatal_error = Some(err);
            }
        }
    }

    if let Some(err) = &fatal_error {
        deps.progress.publish(ProgressEvent::GroupFailed {
            group_key: group_key.clone(),
            reason: err.message.clone(),
            at: Utc::now(),
        });
    } else {
        deps.progress.publish(ProgressEvent::GroupCompleted {
            group_key: group_key.clone(),
            outcome: "success".to_string(),
            at: Utc::now(),
        });
    }

    let outcome = GroupOutcome {
        group_key,
        success: fatal_error.is_none(),
        pr: ctx.pr.clone(),
        error: fatal_error,
    };
    (outcome, dry_run_log)
}

async fn run_stage<A, I, P>(
    ctx: &mut PipelineContext,
    deps: &Deps<A, I, P>,
    dry_run_log: &mut DryRunLog,
) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    match ctx.stage {
        Stage::Init => stage_init(ctx),
        Stage::WorktreeCreate => stage_worktree_create(ctx, deps, dry_run_log).await,
        Stage::AiAnalysis => stage_ai_analysis(ctx, deps).await,
        Stage::AiFix => stage_ai_fix(ctx, deps, dry_run_log).await,
        Stage::InstallDeps => stage_install_deps(ctx, deps).await,
        Stage::Checks => stage_checks(ctx, deps).await,
        Stage::Commit => stage_commit(ctx, dry_run_log),
        Stage::PrCreate => stage_pr_create(ctx, deps, dry_run_log).await,
        Stage::IssueUpdate => stage_issue_update(ctx, deps, dry_run_log).await,
        Stage::Cleanup => stage_cleanup(ctx, deps),
        Stage::Done => StageOutcome::Advance,
    }
}

fn stage_init(ctx: &mut PipelineContext) -> StageOutcome {
    if ctx.group.issues.is_empty() {
        return StageOutcome::Fatal(PipelineError::new(ErrorCode::EmptyIssues, "group has no issues"));
    }
    StageOutcome::Advance
}

async fn stage_worktree_create<A, I, P>(
    ctx: &mut PipelineContext,
    deps: &Deps<A, I, P>,
    dry_run_log: &mut DryRunLog,
) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    if ctx.dry_run {
        dry_run::simulate_worktree(dry_run_log, &ctx.group.key, &ctx.group.branch_name, &deps.default_branch);
        return StageOutcome::Advance;
    }

    match deps.worktree.create(
        &ctx.group.key,
        &ctx.group.branch_name,
        &deps.default_branch,
        ctx.group.issue_numbers(),
    ) {
        Ok(workspace) => {
            ctx.workspace = Some(workspace);
            StageOutcome::Advance
        }
        Err(e) => StageOutcome::Retry(e),
    }
}

async fn stage_ai_analysis<A, I, P>(ctx: &mut PipelineContext, deps: &Deps<A, I, P>) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    let workspace = workspace_path(ctx);
    match deps.ai.analyze(&ctx.group, workspace).await {
        Ok(analysis) => {
            ctx.analysis_result = Some(analysis);
            StageOutcome::Advance
        }
        Err(e) => {
            if e.is_fatal() {
                StageOutcome::Fatal(e)
            } else {
                StageOutcome::Retry(e)
            }
        }
    }
}

async fn stage_ai_fix<A, I, P>(
    ctx: &mut PipelineContext,
    deps: &Deps<A, I, P>,
    dry_run_log: &mut DryRunLog,
) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    let Some(analysis) = ctx.analysis_result.clone() else {
        return StageOutcome::Fatal(PipelineError::new(ErrorCode::AiFixFailed, "no analysis available for fix stage"));
    };

    if ctx.dry_run {
        dry_run::simulate_branch(dry_run_log, &ctx.group.key, &ctx.group.branch_name);
        return StageOutcome::Advance;
    }

    let workspace = workspace_path(ctx);
    let result = match (&ctx.fix_result, &ctx.check_result) {
        (Some(previous), Some(check_result)) if !check_result.passed => {
            let test_error = crate::checks::failure_summary(check_result).unwrap_or_default();
            deps.ai
                .retry_fix(&ctx.group, &analysis, &previous.summary, &test_error, workspace)
                .await
        }
        _ => deps.ai.fix(&ctx.group, &analysis, workspace).await,
    };

    match result {
        Ok(fix) => {
            ctx.fix_result = Some(fix);
            ctx.check_result = None;
            StageOutcome::Advance
        }
        Err(e) => {
            if e.is_fatal() {
                StageOutcome::Fatal(e)
            } else {
                StageOutcome::Retry(e)
            }
        }
    }
}

async fn stage_install_deps<A, I, P>(ctx: &mut PipelineContext, _deps: &Deps<A, I, P>) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    if ctx.dry_run {
        return StageOutcome::Advance;
    }
    let workspace = workspace_path(ctx).to_path_buf();
    let pm = PackageManager::detect(&workspace);
    let program = match pm {
        PackageManager::Npm => "npm",
        PackageManager::Yarn => "yarn",
        PackageManager::Pnpm => "pnpm",
    };
    let mut cmd = tokio::process::Command::new(program);
    cmd.arg("install");
    cmd.current_dir(&workspace);

    match run_supervised(cmd, Duration::from_secs(300)).await {
        Ok(outcome) if outcome.status.success() => StageOutcome::Advance,
        Ok(outcome) => StageOutcome::Retry(PipelineError::new(
            ErrorCode::PipelineFailed,
            format!("dependency install failed: {}", outcome.stderr.trim()),
        )),
        Err(e) => StageOutcome::Retry(PipelineError::new(ErrorCode::PipelineFailed, e.to_string())),
    }
}

async fn stage_checks<A, I, P>(ctx: &mut PipelineContext, deps: &Deps<A, I, P>) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    if ctx.dry_run {
        return StageOutcome::Advance;
    }
    let workspace = workspace_path(ctx);
    let result = deps.checks.run_all(workspace, ctx.check_cycle_attempt, ctx.check_failure_history.clone()).await;
    let passed = result.passed;
    ctx.check_result = Some(result);

    if passed {
        StageOutcome::Advance
    } else {
        let summary = crate::checks::failure_summary(ctx.check_result.as_ref().unwrap())
            .unwrap_or_else(|| "checks failed".to_string());
        ctx.check_failure_history.push(summary.clone());
        StageOutcome::Retry(PipelineError::new(ErrorCode::CheckFailed, summary))
    }
}

fn stage_commit(ctx: &mut PipelineContext, dry_run_log: &mut DryRunLog) -> StageOutcome {
    let Some(fix) = ctx.fix_result.clone() else {
        return StageOutcome::Fatal(PipelineError::new(ErrorCode::PipelineFailed, "no fix result to commit"));
    };

    let trailers: Vec<String> = ctx
        .group
        .issue_numbers()
        .into_iter()
        .map(|n| format!("Closes #{n}"))
        .collect();
    let message = format!("{}\n\n{}", fix.commit_message, trailers.join("\n"));

    if ctx.dry_run {
        dry_run::simulate_commit(dry_run_log, &ctx.group.key, &fix.files_modified, &fix.commit_message);
        return StageOutcome::Advance;
    }

    let Some(workspace) = ctx.workspace.as_ref() else {
        return StageOutcome::Fatal(PipelineError::new(ErrorCode::PipelineFailed, "no workspace to commit in"));
    };
    let paths: Vec<&Path> = fix.files_modified.iter().map(Path::new).collect();
    if let Err(e) = git::stage_paths(&paths, Some(&workspace.path)) {
        return StageOutcome::Retry(PipelineError::new(ErrorCode::PipelineFailed, e));
    }
    match git::commit(&message, Some(&workspace.path)) {
        Ok(_) => StageOutcome::Advance,
        Err(e) => StageOutcome::Retry(PipelineError::new(ErrorCode::PipelineFailed, e)),
    }
}

async fn stage_pr_create<A, I, P>(
    ctx: &mut PipelineContext,
    deps: &Deps<A, I, P>,
    dry_run_log: &mut DryRunLog,
) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    if ctx.dry_run {
        dry_run::simulate_pr(dry_run_log, &ctx.group.key, &ctx.group.branch_name, &deps.default_branch);
        return StageOutcome::Advance;
    }

    let closes: Vec<String> = ctx
        .group
        .issue_numbers()
        .into_iter()
        .map(|n| format!("Closes #{n}"))
        .collect();
    let body = format!("Automated fix for {}.\n\n{}", ctx.group.name, closes.join("\n"));
    let title = format!("fix: {}", ctx.group.name);

    let new_pr = NewPullRequest {
        title: &title,
        body: &body,
        head: &ctx.group.branch_name,
        base: &deps.default_branch,
        draft: false,
    };

    match deps.pr_host.create_pull_request(new_pr).await {
        Ok(pr) => {
            ctx.pr = Some(pr);
            StageOutcome::Advance
        }
        Err(e) if e.code == ErrorCode::AlreadyExists => {
            match deps.pr_host.find_pull_request_by_head(&ctx.group.branch_name).await {
                Ok(Some(pr)) => {
                    ctx.pr = Some(pr);
                    StageOutcome::Advance
                }
                Ok(None) => StageOutcome::Fatal(e),
                Err(e2) => StageOutcome::Fatal(e2),
            }
        }
        Err(e) => StageOutcome::Fatal(e),
    }
}

async fn stage_issue_update<A, I, P>(
    ctx: &mut PipelineContext,
    deps: &Deps<A, I, P>,
    dry_run_log: &mut DryRunLog,
) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    let issue_numbers = ctx.group.issue_numbers();

    if ctx.dry_run {
        dry_run::simulate_issue_update(dry_run_log, &ctx.group.key, &issue_numbers, "would comment with PR link");
        return StageOutcome::Advance;
    }

    let Some(pr) = ctx.pr.clone() else {
        return StageOutcome::Advance;
    };

    for number in issue_numbers {
        let body = format!("Opened {}", pr.url);
        if let Err(e) = deps.issue_tracker.add_comment(number, &body).await {
            log_warn!("[orchestrator] issue_update: failed to comment on #{}: {}", number, e);
        }
    }
    StageOutcome::Advance
}

fn stage_cleanup<A, I, P>(ctx: &mut PipelineContext, deps: &Deps<A, I, P>) -> StageOutcome
where
    A: AiCollaborator,
    I: IssueTracker,
    P: PullRequestHost,
{
    if ctx.dry_run {
        return StageOutcome::Advance;
    }
    if let Some(workspace) = ctx.workspace.take() {
        if let Err(e) = deps.worktree.remove(&workspace) {
            log_warn!("[orchestrator] cleanup failed for {}: {}", ctx.group.key, e);
        }
    }
    log_info!("[orchestrator] cleanup complete for group {}", ctx.group.key);
    StageOutcome::Advance
}

fn workspace_path(ctx: &PipelineContext) -> &Path {
    ctx.workspace
        .as_ref()
        .map(|w| w.path.as_path())
        .unwrap_or_else(|| Path::new("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockAiCollaborator;
    use crate::progress::ProgressReporter;
    use crate::types::{FixAnalysis, FixResult, GroupBy, Priority};

    struct NoopTracker;
    impl IssueTracker for NoopTracker {
        async fn fetch_open_issues(&self, _label: Option<&str>) -> Result<Vec<crate::types::Issue>, PipelineError> {
            Ok(vec![])
        }
        async fn create_issue(&self, _issue: crate::github::NewIssue<'_>) -> Result<crate::types::Issue, PipelineError> {
            unreachable!()
        }
        async fn add_labels(&self, _issue_number: u64, _labels: &[String]) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn remove_label(&self, _issue_number: u64, _label: &str) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn add_comment(&self, _issue_number: u64, _body: &str) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    struct NoopPrHost;
    impl PullRequestHost for NoopPrHost {
        async fn create_pull_request(&self, pr: NewPullRequest<'_>) -> Result<PullRequestRef, PipelineError> {
            Ok(PullRequestRef {
                number: 1,
                url: "https://example.com/pr/1".to_string(),
                head: pr.head.to_string(),
                base: pr.base.to_string(),
                reused_existing: false,
            })
        }
        async fn find_pull_request_by_head(&self, _head: &str) -> Result<Option<PullRequestRef>, PipelineError> {
            Ok(None)
        }
        async fn request_reviewers(&self, _pr_number: u64, _reviewers: &[String]) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn sample_group() -> IssueGroup {
        use crate::types::{AcceptanceCriterion, Issue, IssueContext, IssueState, IssueType};
        let issue = Issue {
            number: 42,
            title: "Button broken".to_string(),
            body: "body".to_string(),
            state: IssueState::Open,
            issue_type: IssueType::Bug,
            labels: vec![],
            assignees: vec![],
            context: IssueContext::default(),
            acceptance_criteria: Vec::<AcceptanceCriterion>::new(),
            related_issues: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            url: "https://example.com/issues/42".to_string(),
        };
        IssueGroup {
            id: "g1".to_string(),
            name: "Button".to_string(),
            group_by: GroupBy::Component,
            key: "button".to_string(),
            issues: vec![issue],
            branch_name: "fix/button".to_string(),
            related_files: vec![],
            components: vec!["button".to_string()],
            priority: Priority::Low,
        }
    }

    fn sample_deps(dry_run: bool) -> Deps<MockAiCollaborator, NoopTracker, NoopPrHost> {
        let analysis = FixAnalysis {
            root_cause: "null check missing".to_string(),
            suggested_fix: "add a guard".to_string(),
            affected_files: vec!["src/button.ts".to_string()],
            complexity: "small".to_string(),
            confidence: 0.9,
        };
        let fix = FixResult {
            success: true,
            summary: "added guard".to_string(),
            files_modified: vec!["src/button.ts".to_string()],
            commit_message: "fix: guard null button ref".to_string(),
        };
        let ai = MockAiCollaborator::new()
            .with_analyze_results(vec![Ok(analysis)])
            .with_fix_results(vec![Ok(fix)]);

        Deps {
            ai: Arc::new(ai),
            issue_tracker: Arc::new(NoopTracker),
            pr_host: Arc::new(NoopPrHost),
            worktree: Arc::new(WorktreeManager::new("/tmp/unused-repo", "/tmp/unused-worktrees", "autofix-")),
            checks: Arc::new(CheckRunner::new(crate::config::ChecksConfig::default())),
            progress: ProgressReporter::new(),
            default_branch: "main".to_string(),
            auto_fix_label: "auto-fix".to_string(),
            max_retries: 2,
            dry_run,
        }
    }

    #[tokio::test]
    async fn dry_run_group_never_touches_filesystem_and_succeeds() {
        let deps = sample_deps(true);
        let (outcome, log) = run_group(sample_group(), &deps, CancellationToken::new()).await;
        assert!(outcome.success);
        assert!(!log.is_empty());
        assert!(log.operations().iter().any(|op| op.kind == dry_run::SimulatedOperationKind::Worktree));
    }

    #[tokio::test]
    async fn init_stage_is_fatal_for_empty_group() {
        let mut group = sample_group();
        group.issues.clear();
        let deps = sample_deps(true);
        let (outcome, _log) = run_group(group, &deps, CancellationToken::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().code, ErrorCode::EmptyIssues);
    }

    #[tokio::test]
    async fn shutdown_request_short_circuits_to_cleanup() {
        crate::signals::set_shutdown_flag_for_testing(true);
        let deps = sample_deps(true);
        let (outcome, _log) = run_group(sample_group(), &deps, CancellationToken::new()).await;
        crate::signals::set_shutdown_flag_for_testing(false);
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().code, ErrorCode::Interrupted);
    }

    /// A `checks` stage that never passes must go fatal after `max_retries`
    /// checks/ai_fix cycles rather than looping forever: `ctx.attempt` gets
    /// reset to 0 by every intervening `ai_fix`/`install_deps` `Advance`, so
    /// the cutoff has to live on a counter those resets don't touch.
    #[tokio::test]
    async fn failing_checks_go_fatal_after_max_retries_instead_of_looping_forever() {
        use crate::config::ChecksConfig;
        use crate::types::{Workspace, WorkspaceStatus};

        let mut checks_config = ChecksConfig::default();
        checks_config.type_check_command = "false".to_string();
        checks_config.lint_command = "true".to_string();
        checks_config.test_command = "true".to_string();
        checks_config.type_check_timeout_secs = 5;

        let analysis = FixAnalysis {
            root_cause: "null check missing".to_string(),
            suggested_fix: "add a guard".to_string(),
            affected_files: vec!["src/button.ts".to_string()],
            complexity: "small".to_string(),
            confidence: 0.9,
        };
        let fix = FixResult {
            success: true,
            summary: "added guard".to_string(),
            files_modified: vec!["src/button.ts".to_string()],
            commit_message: "fix: guard null button ref".to_string(),
        };
        let ai = MockAiCollaborator::new()
            .with_analyze_results(vec![Ok(analysis.clone())])
            .with_fix_results(vec![Ok(fix.clone()), Ok(fix.clone()), Ok(fix.clone())]);

        let deps: Deps<MockAiCollaborator, NoopTracker, NoopPrHost> = Deps {
            ai: Arc::new(ai),
            issue_tracker: Arc::new(NoopTracker),
            pr_host: Arc::new(NoopPrHost),
            worktree: Arc::new(WorktreeManager::new("/tmp/unused-repo", "/tmp/unused-worktrees", "autofix-")),
            checks: Arc::new(CheckRunner::new(checks_config)),
            progress: ProgressReporter::new(),
            default_branch: "main".to_string(),
            auto_fix_label: "auto-fix".to_string(),
            max_retries: 2,
            dry_run: false,
        };

        let dir = tempfile::TempDir::new().unwrap();
        let mut ctx = PipelineContext::new(sample_group(), deps.max_retries, false);
        ctx.workspace = Some(Workspace {
            path: dir.path().to_path_buf(),
            branch: "fix/button".to_string(),
            head_commit: "deadbeef".to_string(),
            status: WorkspaceStatus::Ready,
            issue_numbers: vec![42],
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
        });
        ctx.analysis_result = Some(analysis);
        ctx.fix_result = Some(fix);
        ctx.stage = Stage::Checks;

        let mut dry_run_log = DryRunLog::new();
        let mut fatal = None;
        let mut checks_entries = 0;

        loop {
            if ctx.stage == Stage::Checks {
                checks_entries += 1;
            }
            // `install_deps` would shell out to a real package manager here;
            // the fix under test is about the checks/ai_fix cycle's retry
            // budget, so treat it as trivially successful instead.
            let outcome = if ctx.stage == Stage::InstallDeps {
                StageOutcome::Advance
            } else {
                run_stage(&mut ctx, &deps, &mut dry_run_log).await
            };
            match outcome {
                StageOutcome::Advance => {
                    ctx.attempt = 0;
                    ctx.stage = ctx.stage.next();
                }
                StageOutcome::Retry(err) => {
                    let in_checks_cycle = ctx.stage == Stage::Checks;
                    let cycle_attempt = if in_checks_cycle { ctx.check_cycle_attempt } else { ctx.attempt };
                    if cycle_attempt >= ctx.max_retries {
                        fatal = Some(err);
                        break;
                    }
                    if in_checks_cycle {
                        ctx.check_cycle_attempt += 1;
                        ctx.stage = Stage::AiFix;
                    } else {
                        ctx.attempt += 1;
                    }
                }
                StageOutcome::Fatal(err) => {
                    fatal = Some(err);
                    break;
                }
            }
        }

        assert!(fatal.is_some(), "checks that never pass must eventually go fatal");
        assert_eq!(ctx.check_cycle_attempt, 2, "must exhaust the full retry budget, not reset mid-cycle");
        assert_eq!(ctx.check_failure_history.len(), 3, "every failed checks attempt must be recorded, including the one that trips the cutoff");
        assert_eq!(checks_entries, 3, "checks runs once per cycle attempt plus the one that trips the cutoff");
    }
}
