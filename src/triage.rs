//! Triage processor (§4.4): converts external project-tracker tasks into
//! issues, AI-scored for confidence. Low-confidence tasks become
//! needs-info issues instead of being auto-converted; every tracker update
//! afterwards is best-effort and never aborts issue creation.

use crate::ai::AiCollaborator;
use crate::config::TriageConfig;
use crate::error::PipelineError;
use crate::github::{IssueTracker, NewIssue};
use crate::asana::ProjectTracker;
use crate::prompt::TriagePromptParams;
use crate::types::{AnalysisRecord, Priority, ProjectTask};
use crate::{log_info, log_warn};

#[derive(Debug, Clone, PartialEq)]
pub enum TriageOutcome {
    /// A regular issue was created from a confidently classified task.
    IssueCreated { task_gid: String, issue_number: u64, issue_url: String },
    /// Confidence was below threshold; a needs-info issue was opened instead.
    NeedsInfo { task_gid: String, issue_number: u64, issue_url: String, weak_fields: Vec<String> },
    /// The task already carried the synced tag; nothing was done.
    Skipped { task_gid: String },
    Failed { task_gid: String, error: String },
}

/// How many tasks a batch run can process before the caller (the CLI) must
/// ask for confirmation. Exposed so `main.rs` can decide continue/first-20/
/// cancel without this module knowing about terminal prompts.
pub fn needs_batch_confirmation(config: &TriageConfig, task_count: usize) -> bool {
    task_count as u32 > config.batch_warn_threshold
}

pub struct TriageProcessor<A, I, Pt>
where
    A: AiCollaborator,
    I: IssueTracker,
    Pt: ProjectTracker,
{
    ai: A,
    issue_tracker: I,
    project_tracker: Pt,
    config: TriageConfig,
    available_labels: Vec<String>,
    synced_tag_gid: String,
    processed_section_gid: String,
    priority_override: Option<Priority>,
}

impl<A, I, Pt> TriageProcessor<A, I, Pt>
where
    A: AiCollaborator,
    I: IssueTracker,
    Pt: ProjectTracker,
{
    pub fn new(
        ai: A,
        issue_tracker: I,
        project_tracker: Pt,
        config: TriageConfig,
        available_labels: Vec<String>,
        synced_tag_gid: String,
        processed_section_gid: String,
    ) -> Self {
        Self::with_priority_override(
            ai,
            issue_tracker,
            project_tracker,
            config,
            available_labels,
            synced_tag_gid,
            processed_section_gid,
            None,
        )
    }

    /// Same as `new`, but every issue this processor files for this run
    /// carries `priority_override` instead of the classifier's own
    /// judgment (the CLI's `--priority` flag, §6).
    #[allow(clippy::too_many_arguments)]
    pub fn with_priority_override(
        ai: A,
        issue_tracker: I,
        project_tracker: Pt,
        config: TriageConfig,
        available_labels: Vec<String>,
        synced_tag_gid: String,
        processed_section_gid: String,
        priority_override: Option<Priority>,
    ) -> Self {
        Self {
            ai,
            issue_tracker,
            project_tracker,
            config,
            available_labels,
            synced_tag_gid,
            processed_section_gid,
            priority_override,
        }
    }

    pub async fn process_task(&self, task: &ProjectTask, workspace: &std::path::Path) -> TriageOutcome {
        if task.tags.iter().any(|t| t.eq_ignore_ascii_case(&self.config.synced_tag)) {
            return TriageOutcome::Skipped { task_gid: task.gid.clone() };
        }

        let params = TriagePromptParams {
            task_name: &task.name,
            task_notes: &task.notes,
            existing_tags: &task.tags,
            available_labels: &self.available_labels,
        };

        let mut record = match self.ai.classify(&params, workspace).await {
            Ok(record) => record,
            Err(e) => return TriageOutcome::Failed { task_gid: task.gid.clone(), error: e.message },
        };
        if let Some(priority) = self.priority_override {
            record.priority = priority;
        }

        if record.confidence < self.config.confidence_threshold {
            self.handle_needs_info(task, &record).await
        } else {
            self.handle_confident(task, &record).await
        }
    }

    async fn handle_needs_info(&self, task: &ProjectTask, record: &AnalysisRecord) -> TriageOutcome {
        let weak = record.weak_fields();
        let body = needs_info_body(task, &weak);
        let new_issue = NewIssue {
            title: &format!("[needs-info] {}", task.name),
            body: &body,
            labels: self.config.needs_info_labels.clone(),
            assignees: vec![],
        };

        let issue = match self.issue_tracker.create_issue(new_issue).await {
            Ok(issue) => issue,
            Err(e) => return TriageOutcome::Failed { task_gid: task.gid.clone(), error: e.message },
        };

        self.comment_on_source(&task.gid, &issue.url).await;

        TriageOutcome::NeedsInfo {
            task_gid: task.gid.clone(),
            issue_number: issue.number,
            issue_url: issue.url,
            weak_fields: weak.into_iter().map(str::to_string).collect(),
        }
    }

    async fn handle_confident(&self, task: &ProjectTask, record: &AnalysisRecord) -> TriageOutcome {
        let title = format!("[{}] {}", record.issue_type, task.name);
        let body = issue_body(task, record);
        let new_issue = NewIssue {
            title: &title,
            body: &body,
            labels: record.labels.clone(),
            assignees: vec![],
        };

        let issue = match self.issue_tracker.create_issue(new_issue).await {
            Ok(issue) => issue,
            Err(e) => return TriageOutcome::Failed { task_gid: task.gid.clone(), error: e.message },
        };

        self.comment_on_source(&task.gid, &issue.url).await;

        if let Err(e) = self.project_tracker.add_to_section(&task.gid, &self.processed_section_gid).await {
            log_warn!("[triage] failed to move task {} to processed section: {}", task.gid, e);
        }
        if let Err(e) = self.project_tracker.add_tag(&task.gid, &self.synced_tag_gid).await {
            log_warn!("[triage] failed to tag task {} as synced: {}", task.gid, e);
        }

        log_info!("[triage] task {} -> issue #{}", task.gid, issue.number);

        TriageOutcome::IssueCreated {
            task_gid: task.gid.clone(),
            issue_number: issue.number,
            issue_url: issue.url,
        }
    }

    async fn comment_on_source(&self, task_gid: &str, issue_url: &str) {
        let text = format!("Filed as {issue_url}");
        if let Err(e) = self.project_tracker.create_comment(task_gid, &text).await {
            log_warn!("[triage] failed to comment on source task {}: {}", task_gid, e);
        }
    }
}

fn issue_body(task: &ProjectTask, record: &AnalysisRecord) -> String {
    let mut body = String::new();
    body.push_str(&record.summary);
    body.push_str("\n\n## Context\n\n");
    body.push_str(&format!("- Component: {}\n", record.component));
    body.push_str(&format!("- Priority: {}\n", record.priority));
    if !record.related_files.is_empty() {
        body.push_str("\n## Related Files\n\n");
        for file in &record.related_files {
            body.push_str(&format!("- `{file}`\n"));
        }
    }
    if !record.acceptance_criteria.is_empty() {
        body.push_str("\n## Acceptance Criteria\n\n");
        for criterion in &record.acceptance_criteria {
            body.push_str(&format!("- [ ] {criterion}\n"));
        }
    }
    body.push_str(&format!("\n---\nSource: {}\n", task.permalink_url));
    body
}

fn needs_info_body(task: &ProjectTask, weak: &[&'static str]) -> String {
    let mut body = String::from("This task's triage confidence was below threshold.\n\n");
    body.push_str("Missing or insufficient information:\n\n");
    for field in weak {
        body.push_str(&format!("- {field}\n"));
    }
    body.push_str(&format!("\n---\nSource: {}\n", task.permalink_url));
    body
}

/// Errors surfaced by `classify` that the retry policy treats as
/// transient are retried by the caller using this threshold.
pub fn is_retryable_failure(error: &PipelineError) -> bool {
    error.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IssueType, Priority};

    fn sample_task(tags: Vec<&str>) -> ProjectTask {
        ProjectTask {
            gid: "t1".to_string(),
            name: "Button is unresponsive".to_string(),
            notes: "Clicking does nothing on mobile".to_string(),
            tags: tags.into_iter().map(str::to_string).collect(),
            section_gid: None,
            completed: false,
            permalink_url: "https://app.asana.com/0/1/t1".to_string(),
        }
    }

    fn sample_record(confidence: f64) -> AnalysisRecord {
        AnalysisRecord {
            issue_type: IssueType::Bug,
            priority: Priority::Medium,
            labels: vec!["bug".to_string()],
            component: "button".to_string(),
            related_files: vec!["src/button.ts".to_string()],
            summary: "Button click handler is not wired up on mobile Safari, so taps are ignored.".to_string(),
            acceptance_criteria: vec!["Tapping the button triggers the action".to_string()],
            confidence,
        }
    }

    #[test]
    fn needs_batch_confirmation_above_threshold() {
        let config = TriageConfig::default();
        assert!(needs_batch_confirmation(&config, 21));
        assert!(!needs_batch_confirmation(&config, 20));
    }

    #[test]
    fn issue_body_includes_component_and_files() {
        let task = sample_task(vec![]);
        let record = sample_record(0.9);
        let body = issue_body(&task, &record);
        assert!(body.contains("Component: button"));
        assert!(body.contains("src/button.ts"));
    }

    #[test]
    fn needs_info_body_lists_weak_fields() {
        let task = sample_task(vec![]);
        let body = needs_info_body(&task, &["files", "summary"]);
        assert!(body.contains("- files"));
        assert!(body.contains("- summary"));
    }
}
