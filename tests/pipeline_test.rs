//! Cross-module wiring tests: grouping feeding the queue dispatcher in
//! dry-run mode, and the triage processor driving a fake tracker end to end.
//! Exercises the public `auto_fix_orchestrator` API the way `main.rs` wires
//! it, rather than re-testing what each module's own unit tests already
//! cover in isolation.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use auto_fix_orchestrator::ai::MockAiCollaborator;
use auto_fix_orchestrator::asana::ProjectTracker;
use auto_fix_orchestrator::checks::CheckRunner;
use auto_fix_orchestrator::config::{ChecksConfig, TriageConfig};
use auto_fix_orchestrator::error::PipelineError;
use auto_fix_orchestrator::github::{IssueTracker, NewIssue, NewPullRequest, PullRequestHost};
use auto_fix_orchestrator::grouping::{group_issues, GroupingParams, LabelFilter};
use auto_fix_orchestrator::orchestrator::Deps;
use auto_fix_orchestrator::progress::ProgressReporter;
use auto_fix_orchestrator::queue::run_all;
use auto_fix_orchestrator::triage::{TriageOutcome, TriageProcessor};
use auto_fix_orchestrator::types::{
    AnalysisRecord, FixAnalysis, FixResult, GroupBy, HaltReason, Issue, IssueContext, IssueState, IssueType,
    Priority, ProjectTask, PullRequestRef,
};
use auto_fix_orchestrator::worktree::WorktreeManager;

fn sample_issue(number: u64, component: &str) -> Issue {
    Issue {
        number,
        title: format!("Issue {number}"),
        body: "Something is broken.".to_string(),
        state: IssueState::Open,
        issue_type: IssueType::Bug,
        labels: vec!["auto-fix".to_string()],
        assignees: vec![],
        context: IssueContext {
            component: component.to_string(),
            ..IssueContext::default()
        },
        acceptance_criteria: vec![],
        related_issues: vec![],
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        url: format!("https://example.com/issues/{number}"),
    }
}

struct FakeTracker;

impl IssueTracker for FakeTracker {
    async fn fetch_open_issues(&self, _label: Option<&str>) -> Result<Vec<Issue>, PipelineError> {
        Ok(vec![])
    }
    async fn create_issue(&self, _issue: NewIssue<'_>) -> Result<Issue, PipelineError> {
        unreachable!("not exercised by this test")
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

struct FakePrHost;

impl PullRequestHost for FakePrHost {
    async fn create_pull_request(&self, pr: NewPullRequest<'_>) -> Result<PullRequestRef, PipelineError> {
        Ok(PullRequestRef {
            number: 7,
            url: "https://example.com/pr/7".to_string(),
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

#[tokio::test]
async fn grouped_issues_flow_through_the_dry_run_queue_to_completion() {
    let issues = vec![
        sample_issue(1, "button"),
        sample_issue(2, "button"),
        sample_issue(3, "nav"),
    ];

    let params = GroupingParams {
        group_by: GroupBy::Component,
        max_group_size: 3,
        min_group_size: 1,
        filter: LabelFilter::from_csv(None, None),
        branch_prefix: "fix".to_string(),
        max_branch_length: 200,
    };
    let outcome = group_issues(issues, &params).expect("grouping must succeed");
    assert_eq!(outcome.groups.len(), 2);
    assert!(outcome.ungrouped.is_empty());

    let analysis = FixAnalysis {
        root_cause: "missing null check".to_string(),
        suggested_fix: "guard the handler".to_string(),
        affected_files: vec!["src/button.ts".to_string()],
        complexity: "small".to_string(),
        confidence: 0.9,
    };
    let fix = FixResult {
        success: true,
        summary: "guarded the handler".to_string(),
        files_modified: vec!["src/button.ts".to_string()],
        commit_message: "fix: guard click handler".to_string(),
    };
    let ai = MockAiCollaborator::new()
        .with_analyze_results(vec![Ok(analysis.clone()), Ok(analysis)])
        .with_fix_results(vec![Ok(fix.clone()), Ok(fix)]);

    let deps: Deps<MockAiCollaborator, FakeTracker, FakePrHost> = Deps {
        ai: Arc::new(ai),
        issue_tracker: Arc::new(FakeTracker),
        pr_host: Arc::new(FakePrHost),
        worktree: Arc::new(WorktreeManager::new(
            "/tmp/auto-fix-pipeline-test-repo",
            "/tmp/auto-fix-pipeline-test-worktrees",
            "autofix-",
        )),
        checks: Arc::new(CheckRunner::new(ChecksConfig::default())),
        progress: ProgressReporter::new(),
        default_branch: "main".to_string(),
        auto_fix_label: "auto-fix".to_string(),
        max_retries: 1,
        dry_run: true,
    };

    let (summary, dry_run_log) = run_all(outcome.groups, deps, 2, CancellationToken::new()).await;

    assert_eq!(summary.groups_completed.len(), 2);
    assert!(summary.groups_failed.is_empty());
    assert_eq!(summary.halt_reason, HaltReason::AllDone);
    assert!(!dry_run_log.is_empty(), "dry run must still record simulated operations");
}

struct FakeProjectTracker;

impl ProjectTracker for FakeProjectTracker {
    async fn list_tasks(&self, _project_gid: &str) -> Result<Vec<ProjectTask>, PipelineError> {
        unreachable!("not exercised by this test")
    }
    async fn fetch_task(&self, _task_gid: &str) -> Result<ProjectTask, PipelineError> {
        unreachable!("not exercised by this test")
    }
    async fn fetch_subtasks(&self, _task_gid: &str) -> Result<Vec<ProjectTask>, PipelineError> {
        Ok(vec![])
    }
    async fn update_task(&self, _task_gid: &str, _notes: Option<&str>, _completed: Option<bool>) -> Result<(), PipelineError> {
        Ok(())
    }
    async fn add_tag(&self, _task_gid: &str, _tag_gid: &str) -> Result<(), PipelineError> {
        Ok(())
    }
    async fn remove_tag(&self, _task_gid: &str, _tag_gid: &str) -> Result<(), PipelineError> {
        Ok(())
    }
    async fn add_to_section(&self, _task_gid: &str, _section_gid: &str) -> Result<(), PipelineError> {
        Ok(())
    }
    async fn create_comment(&self, _task_gid: &str, _text: &str) -> Result<(), PipelineError> {
        Ok(())
    }
    async fn workspace_tags(&self, _workspace_gid: &str) -> Result<Vec<(String, String)>, PipelineError> {
        Ok(vec![("tag-gid-1".to_string(), "synced".to_string())])
    }
}

struct RecordingIssueTracker;

impl IssueTracker for RecordingIssueTracker {
    async fn fetch_open_issues(&self, _label: Option<&str>) -> Result<Vec<Issue>, PipelineError> {
        Ok(vec![])
    }
    async fn create_issue(&self, issue: NewIssue<'_>) -> Result<Issue, PipelineError> {
        let mut created = sample_issue(42, "button");
        created.title = issue.title.to_string();
        created.body = issue.body.to_string();
        created.labels = issue.labels;
        Ok(created)
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

fn sample_task() -> ProjectTask {
    ProjectTask {
        gid: "task-1".to_string(),
        name: "Nav menu collapses unexpectedly".to_string(),
        notes: "Reported by two users on iOS Safari".to_string(),
        tags: vec![],
        section_gid: None,
        completed: false,
        permalink_url: "https://app.asana.com/0/1/task-1".to_string(),
    }
}

#[tokio::test]
async fn confident_triage_creates_an_issue_and_syncs_the_source_task() {
    let record = AnalysisRecord {
        issue_type: IssueType::Bug,
        priority: Priority::Medium,
        labels: vec!["bug".to_string()],
        component: "nav".to_string(),
        related_files: vec!["src/nav.ts".to_string()],
        summary: "The nav menu's collapse handler fires on scroll events it shouldn't.".to_string(),
        acceptance_criteria: vec!["Scrolling the page does not collapse the nav menu".to_string()],
        confidence: 0.95,
    };
    let ai = MockAiCollaborator::new().with_classify_results(vec![Ok(record)]);

    let processor = TriageProcessor::new(
        ai,
        RecordingIssueTracker,
        FakeProjectTracker,
        TriageConfig::default(),
        vec!["bug".to_string(), "feature".to_string()],
        "tag-gid-1".to_string(),
        "section-gid-1".to_string(),
    );

    let outcome = processor.process_task(&sample_task(), Path::new("/tmp")).await;
    match outcome {
        TriageOutcome::IssueCreated { issue_number, .. } => assert_eq!(issue_number, 42),
        other => panic!("expected IssueCreated, got {other:?}"),
    }
}

#[tokio::test]
async fn triage_skips_tasks_already_carrying_the_synced_tag() {
    let ai = MockAiCollaborator::new();
    let mut task = sample_task();
    task.tags.push("synced".to_string());

    let processor = TriageProcessor::new(
        ai,
        RecordingIssueTracker,
        FakeProjectTracker,
        TriageConfig::default(),
        vec!["bug".to_string()],
        "tag-gid-1".to_string(),
        "section-gid-1".to_string(),
    );

    let outcome = processor.process_task(&task, Path::new("/tmp")).await;
    assert_eq!(outcome, TriageOutcome::Skipped { task_gid: "task-1".to_string() });
}
