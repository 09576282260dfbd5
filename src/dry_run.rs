//! Dry-run simulator (§4.3, §8 scenario 2): when a run is invoked with
//! `--dry-run`, every mutating stage is replaced by a call into this module
//! instead of actually creating worktrees, committing, opening PRs, or
//! updating the tracker. Analysis still runs for real since it has no side
//! effects worth simulating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedOperationKind {
    Worktree,
    Branch,
    Commit,
    Pr,
    IssueUpdate,
}

/// One recorded would-be side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedOperation {
    pub kind: SimulatedOperationKind,
    pub group_key: String,
    pub affected_resources: Vec<String>,
    pub predicted_outcome: String,
    pub recorded_at: DateTime<Utc>,
}

/// Accumulates simulated operations across a dry run. Shared by reference
/// (not `Arc`/`Mutex`) since the orchestrator drives one group's pipeline at
/// a time per `DryRunLog` instance; the queue dispatcher merges per-group
/// logs after each group completes.
#[derive(Debug, Clone, Default)]
pub struct DryRunLog {
    operations: Vec<SimulatedOperation>,
}

impl DryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        kind: SimulatedOperationKind,
        group_key: &str,
        affected_resources: Vec<String>,
        predicted_outcome: impl Into<String>,
    ) {
        self.operations.push(SimulatedOperation {
            kind,
            group_key: group_key.to_string(),
            affected_resources,
            predicted_outcome: predicted_outcome.into(),
            recorded_at: Utc::now(),
        });
    }

    pub fn operations(&self) -> &[SimulatedOperation] {
        &self.operations
    }

    pub fn merge(&mut self, other: DryRunLog) {
        self.operations.extend(other.operations);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Renders the log as the printed summary §8 scenario 2 expects: a list
    /// of simulated operations grouped by kind.
    pub fn render_summary(&self) -> String {
        if self.operations.is_empty() {
            return "No operations would be performed.".to_string();
        }
        let mut lines = Vec::with_capacity(self.operations.len());
        for op in &self.operations {
            lines.push(format!(
                "[dry-run] {:?} {} -> {} ({})",
                op.kind,
                op.group_key,
                op.affected_resources.join(", "),
                op.predicted_outcome
            ));
        }
        lines.join("\n")
    }
}

pub fn simulate_worktree(log: &mut DryRunLog, group_key: &str, branch: &str, base_branch: &str) {
    log.record(
        SimulatedOperationKind::Worktree,
        group_key,
        vec![branch.to_string()],
        format!("would create worktree on branch '{branch}' off '{base_branch}'"),
    );
}

pub fn simulate_branch(log: &mut DryRunLog, group_key: &str, branch: &str) {
    log.record(
        SimulatedOperationKind::Branch,
        group_key,
        vec![branch.to_string()],
        format!("would create branch '{branch}'"),
    );
}

pub fn simulate_commit(log: &mut DryRunLog, group_key: &str, files: &[String], message: &str) {
    log.record(
        SimulatedOperationKind::Commit,
        group_key,
        files.to_vec(),
        format!("would commit {} file(s) with message '{message}'", files.len()),
    );
}

pub fn simulate_pr(log: &mut DryRunLog, group_key: &str, head: &str, base: &str) {
    log.record(
        SimulatedOperationKind::Pr,
        group_key,
        vec![format!("{head} -> {base}")],
        "would open a pull request".to_string(),
    );
}

pub fn simulate_issue_update(log: &mut DryRunLog, group_key: &str, issue_numbers: &[u64], note: &str) {
    log.record(
        SimulatedOperationKind::IssueUpdate,
        group_key,
        issue_numbers.iter().map(|n| n.to_string()).collect(),
        note.to_string(),
    );
}

/// Serializes the full log as JSON for `--verbose` machine-readable output.
pub fn to_json(log: &DryRunLog) -> Value {
    serde_json::json!({ "operations": log.operations })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_operations_in_order() {
        let mut log = DryRunLog::new();
        simulate_worktree(&mut log, "button", "fix/button", "main");
        simulate_commit(&mut log, "button", &["src/button.ts".to_string()], "fix button");
        assert_eq!(log.operations().len(), 2);
        assert_eq!(log.operations()[0].kind, SimulatedOperationKind::Worktree);
        assert_eq!(log.operations()[1].kind, SimulatedOperationKind::Commit);
    }

    #[test]
    fn merge_combines_two_logs_preserving_order() {
        let mut a = DryRunLog::new();
        simulate_branch(&mut a, "button", "fix/button");
        let mut b = DryRunLog::new();
        simulate_pr(&mut b, "nav", "fix/nav", "main");
        a.merge(b);
        assert_eq!(a.operations().len(), 2);
        assert_eq!(a.operations()[1].group_key, "nav");
    }

    #[test]
    fn render_summary_on_empty_log_states_no_operations() {
        let log = DryRunLog::new();
        assert_eq!(log.render_summary(), "No operations would be performed.");
    }

    #[test]
    fn render_summary_includes_every_recorded_operation() {
        let mut log = DryRunLog::new();
        simulate_issue_update(&mut log, "button", &[1, 2], "would mark resolved");
        let summary = log.render_summary();
        assert!(summary.contains("IssueUpdate"));
        assert!(summary.contains("would mark resolved"));
    }
}
