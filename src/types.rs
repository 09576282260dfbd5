//! Core data model: issues, groups, queue items, pipeline context, workspaces,
//! check results, and the triage analysis record.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Open/closed state of an issue on the issue tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

/// Issue classification, assigned by triage or carried over from the source tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Bug,
    Feature,
    Refactor,
    Docs,
    Test,
    Chore,
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Refactor => "refactor",
            IssueType::Docs => "docs",
            IssueType::Test => "test",
            IssueType::Chore => "chore",
        };
        write!(f, "{s}")
    }
}

impl IssueType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bug" => Some(IssueType::Bug),
            "feature" => Some(IssueType::Feature),
            "refactor" => Some(IssueType::Refactor),
            "docs" => Some(IssueType::Docs),
            "test" => Some(IssueType::Test),
            "chore" => Some(IssueType::Chore),
            _ => None,
        }
    }
}

/// Priority, totally ordered `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Priority::Critical),
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }

    /// The maximum of an iterator of priorities, defaulting to `Low` for an empty input.
    pub fn max_of<I: IntoIterator<Item = Priority>>(iter: I) -> Priority {
        iter.into_iter().max().unwrap_or(Priority::Low)
    }
}

/// Where an issue originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSource {
    Github,
    Asana,
    Sentry,
}

/// Enrichment context attached to an issue, either parsed from its body or
/// supplied by triage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueContext {
    pub component: String,
    pub priority: Option<Priority>,
    pub related_files: Vec<String>,
    pub related_symbols: Vec<String>,
    pub source: Option<IssueSource>,
    pub source_id: Option<String>,
    pub source_url: Option<String>,
}

/// A single acceptance criterion extracted from an issue body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub text: String,
    pub completed: bool,
    /// Given/When/Then scenario text, when the criterion was extracted from a GWT block.
    pub scenario: Option<String>,
}

/// Immutable value type. Never mutated after construction; transformations
/// (e.g. grouping, re-parsing) produce new `Issue` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub context: IssueContext,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub related_issues: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
}

impl Issue {
    pub fn priority(&self) -> Priority {
        self.context.priority.unwrap_or(Priority::Low)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// The dimension issues are bucketed by in the grouping engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Component,
    File,
    Label,
    Type,
    Priority,
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupBy::Component => "component",
            GroupBy::File => "file",
            GroupBy::Label => "label",
            GroupBy::Type => "type",
            GroupBy::Priority => "priority",
        };
        write!(f, "{s}")
    }
}

impl GroupBy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "component" => Some(GroupBy::Component),
            "file" => Some(GroupBy::File),
            "label" => Some(GroupBy::Label),
            "type" => Some(GroupBy::Type),
            "priority" => Some(GroupBy::Priority),
            _ => None,
        }
    }
}

/// Immutable once produced by the grouping engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueGroup {
    pub id: String,
    pub name: String,
    pub group_by: GroupBy,
    pub key: String,
    pub issues: Vec<Issue>,
    pub branch_name: String,
    pub related_files: Vec<String>,
    pub components: Vec<String>,
    pub priority: Priority,
}

impl IssueGroup {
    pub fn issue_numbers(&self) -> Vec<u64> {
        self.issues.iter().map(|i| i.number).collect()
    }
}

/// Status of a `QueueItem`, mutated only by the work queue's single dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Retrying,
    Completed,
    Failed,
}

/// One item tracked by the work queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: String,
    pub group: IssueGroup,
    pub status: QueueStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub workspace_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(group: IssueGroup) -> Self {
        let id = group.id.clone();
        Self {
            id,
            group,
            status: QueueStatus::Queued,
            attempt: 0,
            error: None,
            workspace_path: None,
            started_at: None,
        }
    }
}

/// The pipeline's stage sequence. Linear progression; `cleanup` runs on every
/// terminal path and `done` is reached only after a successful `cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    WorktreeCreate,
    AiAnalysis,
    AiFix,
    InstallDeps,
    Checks,
    Commit,
    PrCreate,
    IssueUpdate,
    Cleanup,
    Done,
}

impl Stage {
    pub const ORDER: [Stage; 11] = [
        Stage::Init,
        Stage::WorktreeCreate,
        Stage::AiAnalysis,
        Stage::AiFix,
        Stage::InstallDeps,
        Stage::Checks,
        Stage::Commit,
        Stage::PrCreate,
        Stage::IssueUpdate,
        Stage::Cleanup,
        Stage::Done,
    ];

    pub fn index(self) -> usize {
        Self::ORDER.iter().position(|s| *s == self).unwrap_or(0)
    }

    pub fn next(self) -> Stage {
        let idx = self.index();
        Self::ORDER.get(idx + 1).copied().unwrap_or(Stage::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::WorktreeCreate => "worktree_create",
            Stage::AiAnalysis => "ai_analysis",
            Stage::AiFix => "ai_fix",
            Stage::InstallDeps => "install_deps",
            Stage::Checks => "checks",
            Stage::Commit => "commit",
            Stage::PrCreate => "pr_create",
            Stage::IssueUpdate => "issue_update",
            Stage::Cleanup => "cleanup",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a `Workspace` (worktree). Exclusively mutated by the orchestrator
/// holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Ready,
    Busy,
    Error,
    Cleanup,
    Removed,
}

/// An isolated working copy of the repository tied to a dedicated branch.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: std::path::PathBuf,
    pub branch: String,
    pub head_commit: String,
    pub status: WorkspaceStatus,
    pub issue_numbers: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// A single check outcome within one `checks` stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Lint,
    Typecheck,
    Test,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckKind::Lint => "lint",
            CheckKind::Typecheck => "typecheck",
            CheckKind::Test => "test",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Timeout,
}

/// Result of running one check (lint/typecheck/test).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleCheckResult {
    pub check: CheckKind,
    pub passed: bool,
    pub status: CheckStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Produced once per `checks`-stage entry. `previous_errors` accumulates an
/// append-only history across retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    pub results: Vec<SingleCheckResult>,
    pub attempt: u32,
    pub max_retries_exceeded: bool,
    pub previous_errors: Vec<String>,
    pub total_duration_ms: u64,
}

/// A task fetched from the external project tracker, prior to triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectTask {
    pub gid: String,
    pub name: String,
    pub notes: String,
    pub tags: Vec<String>,
    pub section_gid: Option<String>,
    pub completed: bool,
    pub permalink_url: String,
}

impl ProjectTask {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Structured output of the triage classifier. Field names are camelCase
/// because this is also the wire contract the AI collaborator's classify
/// prompt is validated against (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub issue_type: IssueType,
    pub priority: Priority,
    pub labels: Vec<String>,
    pub component: String,
    pub related_files: Vec<String>,
    pub summary: String,
    pub acceptance_criteria: Vec<String>,
    pub confidence: f64,
}

impl AnalysisRecord {
    /// Field names that are empty/weak enough to flag as missing, in the fixed
    /// order the needs-info comment lists them.
    pub fn weak_fields(&self) -> Vec<&'static str> {
        let mut weak = Vec::new();
        if self.related_files.is_empty() {
            weak.push("files");
        }
        if self.acceptance_criteria.is_empty() {
            weak.push("acceptance criteria");
        }
        if self.summary.trim().len() < 40 {
            weak.push("summary");
        }
        if self.component.is_empty() || self.component.eq_ignore_ascii_case("uncategorized") {
            weak.push("component");
        }
        if self.issue_type == IssueType::Bug && !self.has_repro_steps() {
            weak.push("repro steps");
        }
        weak
    }

    /// Whether the summary or acceptance criteria mention anything that
    /// looks like reproduction steps. There's no dedicated field for this
    /// on the wire contract, so it's inferred from the free-text fields.
    fn has_repro_steps(&self) -> bool {
        let mentions_repro = |s: &str| {
            let lower = s.to_lowercase();
            lower.contains("repro") || lower.contains("steps to") || lower.contains("to reproduce")
        };
        mentions_repro(&self.summary) || self.acceptance_criteria.iter().any(|c| mentions_repro(c))
    }
}

/// Structured analysis produced by the `ai_analysis` pipeline stage. Schema
/// per §6: `rootCause`, `suggestedFix`, `affectedFiles`, `complexity`,
/// `confidence` are required fields of the AI collaborator's JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAnalysis {
    pub root_cause: String,
    pub suggested_fix: String,
    pub affected_files: Vec<String>,
    pub complexity: String,
    pub confidence: f64,
}

/// Result of the `ai_fix` pipeline stage. Schema per §6: `success`,
/// `summary`, `filesModified`, `commitMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixResult {
    pub success: bool,
    pub summary: String,
    pub files_modified: Vec<String>,
    pub commit_message: String,
}

/// Reference to a pull request created or reused by the `pr_create` stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub head: String,
    pub base: String,
    pub reused_existing: bool,
}

/// Per-group mutable record carried through the orchestrator's state machine.
/// Lives only for the duration of one group's pipeline.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub stage: Stage,
    pub group: IssueGroup,
    pub workspace: Option<Workspace>,
    pub analysis_result: Option<FixAnalysis>,
    pub fix_result: Option<FixResult>,
    pub check_result: Option<CheckResult>,
    pub pr: Option<PullRequestRef>,
    pub attempt: u32,
    pub max_retries: u32,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub errors: Vec<crate::error::PipelineError>,
    /// Survives the `checks -> ai_fix -> install_deps -> checks` loopback
    /// (§4.3) so a fix that never makes checks pass still goes fatal after
    /// `max_retries` cycles, instead of resetting every time `ai_fix` or
    /// `install_deps` advances.
    pub check_cycle_attempt: u32,
    /// Per-check failure summaries, append-only across the checks/ai_fix
    /// cycle, fed back into `checks.run_all` as `previousErrors`.
    pub check_failure_history: Vec<String>,
}

impl PipelineContext {
    pub fn new(group: IssueGroup, max_retries: u32, dry_run: bool) -> Self {
        Self {
            stage: Stage::Init,
            group,
            workspace: None,
            analysis_result: None,
            fix_result: None,
            check_result: None,
            pr: None,
            attempt: 0,
            max_retries,
            dry_run,
            started_at: Utc::now(),
            errors: Vec::new(),
            check_cycle_attempt: 0,
            check_failure_history: Vec::new(),
        }
    }

    /// Resets to `init` as the one exception to monotonic stage advancement: a
    /// stage-level retry that exhausts its own budget escalates the whole
    /// pipeline context back to the top, per §3.
    pub fn reset_for_retry(&mut self) {
        self.stage = Stage::Init;
        self.attempt += 1;
    }

    pub fn record_error(&mut self, err: crate::error::PipelineError) {
        self.errors.push(err);
    }

    /// The most-specific terminal error, i.e. the last one recorded.
    pub fn terminal_error(&self) -> Option<&crate::error::PipelineError> {
        self.errors.last()
    }
}

/// Outcome of a full `autofix` or `triage` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    AllDone,
    CapReached,
    ShutdownRequested,
    Error,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaltReason::AllDone => "all groups processed",
            HaltReason::CapReached => "cap reached",
            HaltReason::ShutdownRequested => "shutdown requested",
            HaltReason::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub groups_completed: Vec<String>,
    pub groups_failed: Vec<String>,
    pub prs_opened: u32,
    pub halt_reason: HaltReason,
    pub total_duration_ms: u64,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if !self.groups_failed.is_empty() {
            1
        } else {
            0
        }
    }
}

/// Set union helper used throughout grouping/analysis aggregation; keeps
/// insertion-independent, de-duplicated output.
pub fn union_sorted<T: Ord + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let mut set: BTreeSet<T> = a.iter().cloned().collect();
    set.extend(b.iter().cloned());
    set.into_iter().collect()
}
