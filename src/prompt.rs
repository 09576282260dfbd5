//! Prompt construction for the AI collaborator (§6): a small `{{var}}` /
//! `{{#each}}…{{/each}}` template language, plus one params struct and one
//! builder function per prompt kind (analysis, fix, retry, triage classify).
//! Composition follows this codebase's existing pattern of joining
//! independently-built string sections with `"\n\n"` and appending a
//! structured-JSON-schema block to pin the collaborator's response shape.

use crate::types::{AcceptanceCriterion, Issue, IssueGroup};

/// Renders `{{var}}` substitutions and `{{#each items}}...{{/each}}` blocks
/// against a flat key-value context plus named list contexts. Deliberately
/// minimal: no conditionals, no nested `{{#each}}`, no escaping rules beyond
/// literal substitution — this codebase's prompts never need more than that.
pub struct TemplateContext {
    vars: Vec<(String, String)>,
    lists: Vec<(String, Vec<Vec<(String, String)>>)>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self {
            vars: Vec::new(),
            lists: Vec::new(),
        }
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.push((key.to_string(), value.into()));
        self
    }

    /// Registers a named list for `{{#each name}}` blocks. Each item is a
    /// flat set of fields usable inside the block as `{{field}}`.
    pub fn set_each(mut self, name: &str, items: Vec<Vec<(String, String)>>) -> Self {
        self.lists.push((name.to_string(), items));
        self
    }

    fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn list(&self, name: &str) -> Option<&Vec<Vec<(String, String)>>> {
        self.lists.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders `template` against `ctx`. Unknown `{{var}}` references are left
/// as an empty string rather than erroring — prompts degrade gracefully
/// when optional context is absent.
pub fn render(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{#each ") {
        out.push_str(&render_vars(&rest[..start], ctx));
        let after_tag = &rest[start + "{{#each ".len()..];
        let Some(name_end) = after_tag.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let list_name = after_tag[..name_end].trim();
        let body_start = name_end + "}}".len();
        let Some(close_rel) = after_tag[body_start..].find("{{/each}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after_tag[body_start..body_start + close_rel];

        if let Some(items) = ctx.list(list_name) {
            for item in items {
                let item_ctx = TemplateContext {
                    vars: item.clone(),
                    lists: Vec::new(),
                };
                out.push_str(&render_vars(body, &item_ctx));
            }
        }

        rest = &after_tag[body_start + close_rel + "{{/each}}".len()..];
    }
    out.push_str(&render_vars(rest, ctx));
    out
}

fn render_vars(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        out.push_str(ctx.var(key).unwrap_or(""));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn acceptance_criteria_section(criteria: &[AcceptanceCriterion]) -> String {
    if criteria.is_empty() {
        return String::new();
    }
    let mut section = String::from("## Acceptance Criteria\n\n");
    for c in criteria {
        let mark = if c.completed { "x" } else { " " };
        section.push_str(&format!("- [{mark}] {}\n", c.text));
    }
    section
}

fn issue_section(issue: &Issue) -> String {
    let mut section = format!("### Issue #{}: {}\n\n{}\n", issue.number, issue.title, issue.body);
    let criteria = acceptance_criteria_section(&issue.acceptance_criteria);
    if !criteria.is_empty() {
        section.push('\n');
        section.push_str(&criteria);
    }
    section
}

fn group_issues_section(group: &IssueGroup) -> String {
    group
        .issues
        .iter()
        .map(issue_section)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// JSON schema suffix appended to every prompt, per §6: the collaborator's
/// response must be a single JSON object matching the named fields, with no
/// surrounding prose.
fn structured_output_suffix(schema_description: &str) -> String {
    format!(
        "## Structured Output\n\n\
         Respond with ONLY a single JSON object, no surrounding prose or \
         markdown fences. The object must match this shape:\n\n{{\n{schema_description}\n}}\n"
    )
}

const ANALYSIS_SCHEMA: &str = "  \"rootCause\": string,\n  \"suggestedFix\": string,\n  \"affectedFiles\": string[],\n  \"complexity\": \"trivial\" | \"small\" | \"medium\" | \"large\",\n  \"confidence\": number // 0.0 to 1.0";

const FIX_SCHEMA: &str = "  \"success\": boolean,\n  \"summary\": string,\n  \"filesModified\": string[],\n  \"commitMessage\": string";

const TRIAGE_SCHEMA: &str = "  \"issueType\": \"bug\" | \"feature\" | \"refactor\" | \"docs\" | \"test\" | \"chore\",\n  \"priority\": \"critical\" | \"high\" | \"medium\" | \"low\",\n  \"labels\": string[],\n  \"component\": string,\n  \"relatedFiles\": string[],\n  \"summary\": string,\n  \"acceptanceCriteria\": string[],\n  \"confidence\": number // 0.0 to 1.0";

/// Builds the *analysis* prompt (§4.3/§6): asks the collaborator to
/// diagnose a group's issues without modifying anything.
pub fn build_analysis_prompt(group: &IssueGroup) -> String {
    let sections = [
        format!(
            "# Analyze Issue Group: {}\n\nYou are analyzing a group of related issues in this \
             repository. Identify the root cause and propose a fix approach. Do not modify any \
             files yet.",
            group.name
        ),
        format!("## Group Context\n\nComponent(s): {}\nFiles touched historically: {}",
            if group.components.is_empty() { "unknown".to_string() } else { group.components.join(", ") },
            if group.related_files.is_empty() { "none recorded".to_string() } else { group.related_files.join(", ") }),
        group_issues_section(group),
        structured_output_suffix(ANALYSIS_SCHEMA),
    ];
    sections.join("\n\n")
}

/// Builds the *fix* prompt (§4.3/§6): asks the collaborator to apply file
/// changes inside the already-checked-out workspace.
pub fn build_fix_prompt(group: &IssueGroup, root_cause: &str, suggested_fix: &str, affected_files: &[String]) -> String {
    let sections = [
        format!(
            "# Implement Fix: {}\n\nApply the fix described below directly to the files in this \
             workspace. Only modify files that belong to this repository.",
            group.name
        ),
        format!(
            "## Analysis\n\nRoot cause: {root_cause}\n\nSuggested fix: {suggested_fix}\n\nFiles likely affected: {}",
            if affected_files.is_empty() { "unspecified".to_string() } else { affected_files.join(", ") }
        ),
        group_issues_section(group),
        structured_output_suffix(FIX_SCHEMA),
    ];
    sections.join("\n\n")
}

/// Builds a *retry* fix prompt (§4.3): the fix prompt plus the previous
/// attempt's summary and a truncated test error, so the collaborator sees
/// what it already tried and why it failed.
pub fn build_retry_fix_prompt(
    group: &IssueGroup,
    root_cause: &str,
    suggested_fix: &str,
    affected_files: &[String],
    previous_summary: &str,
    test_error: &str,
) -> String {
    let base = build_fix_prompt(group, root_cause, suggested_fix, affected_files);
    let retry_section = format!(
        "## Previous Attempt\n\n{previous_summary}\n\n## Test Failure\n\n```\n{}\n```\n\n\
         The previous attempt did not pass verification. Revise the fix to address this failure.",
        truncate_test_error(test_error, 50)
    );
    // Insert the retry context before the trailing structured-output block so
    // the schema instructions always remain last.
    let Some(split_at) = base.rfind("## Structured Output") else {
        return format!("{base}\n\n{retry_section}");
    };
    format!("{}{retry_section}\n\n{}", &base[..split_at], &base[split_at..])
}

/// Truncates multi-line test error output to at most `max_lines`, appending
/// an elision marker noting how many lines were dropped (§4.3).
pub fn truncate_test_error(test_error: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = test_error.lines().collect();
    if lines.len() <= max_lines {
        return test_error.to_string();
    }
    let kept = lines[..max_lines].join("\n");
    let dropped = lines.len() - max_lines;
    format!("{kept}\n… ({dropped} more lines elided)")
}

/// Parameters for the triage classification prompt (§4.4/§6): a flat struct
/// mirroring this codebase's style of feeding template params through a
/// dedicated struct rather than ad hoc string formatting at the call site.
pub struct TriagePromptParams<'a> {
    pub task_name: &'a str,
    pub task_notes: &'a str,
    pub existing_tags: &'a [String],
    pub available_labels: &'a [String],
}

/// Builds the triage classifier prompt (§4.4/§6): asks the collaborator to
/// turn a raw tracker task into a structured `AnalysisRecord`.
pub fn build_triage_prompt(params: &TriagePromptParams) -> String {
    let ctx = TemplateContext::new()
        .set("task_name", params.task_name)
        .set("task_notes", params.task_notes)
        .set(
            "existing_tags",
            if params.existing_tags.is_empty() {
                "none".to_string()
            } else {
                params.existing_tags.join(", ")
            },
        )
        .set(
            "available_labels",
            if params.available_labels.is_empty() {
                "none configured".to_string()
            } else {
                params.available_labels.join(", ")
            },
        );

    let template = "# Classify Task: {{task_name}}\n\n\
         Read the task below and produce a structured classification. Be \
         conservative with `confidence`: if the task lacks enough detail to \
         identify affected files or write acceptance criteria, reflect that \
         with a low score rather than guessing.\n\n\
         ## Task Notes\n\n{{task_notes}}\n\n\
         ## Existing Tags\n\n{{existing_tags}}\n\n\
         ## Available Labels\n\n{{available_labels}}";

    let mut prompt = render(template, &ctx);
    prompt.push_str("\n\n");
    prompt.push_str(&structured_output_suffix(TRIAGE_SCHEMA));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::{GroupBy, IssueContext, IssueState, IssueType, Priority};

    fn sample_issue(number: u64) -> Issue {
        Issue {
            number,
            title: format!("Issue {number}"),
            body: "Body text".to_string(),
            state: IssueState::Open,
            issue_type: IssueType::Bug,
            labels: vec![],
            assignees: vec![],
            context: IssueContext::default(),
            acceptance_criteria: vec![AcceptanceCriterion {
                text: "Does the thing".to_string(),
                completed: false,
                scenario: None,
            }],
            related_issues: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            url: format!("https://example.com/issues/{number}"),
        }
    }

    fn sample_group() -> IssueGroup {
        IssueGroup {
            id: "g1".to_string(),
            name: "Button".to_string(),
            group_by: GroupBy::Component,
            key: "button".to_string(),
            issues: vec![sample_issue(1), sample_issue(2)],
            branch_name: "fix/button/issue-1-2".to_string(),
            related_files: vec!["src/Button.tsx".to_string()],
            components: vec!["Button".to_string()],
            priority: Priority::High,
        }
    }

    #[test]
    fn render_substitutes_flat_vars() {
        let ctx = TemplateContext::new().set("name", "World");
        assert_eq!(render("Hello {{name}}!", &ctx), "Hello World!");
    }

    #[test]
    fn render_unknown_var_becomes_empty() {
        let ctx = TemplateContext::new();
        assert_eq!(render("Hello {{name}}!", &ctx), "Hello !");
    }

    #[test]
    fn render_expands_each_block() {
        let ctx = TemplateContext::new().set_each(
            "items",
            vec![
                vec![("n".to_string(), "1".to_string())],
                vec![("n".to_string(), "2".to_string())],
            ],
        );
        let out = render("{{#each items}}- {{n}}\n{{/each}}", &ctx);
        assert_eq!(out, "- 1\n- 2\n");
    }

    #[test]
    fn analysis_prompt_includes_every_issue_and_schema() {
        let group = sample_group();
        let prompt = build_analysis_prompt(&group);
        assert!(prompt.contains("Issue #1"));
        assert!(prompt.contains("Issue #2"));
        assert!(prompt.contains("rootCause"));
    }

    #[test]
    fn fix_prompt_includes_analysis_fields() {
        let group = sample_group();
        let prompt = build_fix_prompt(&group, "null check missing", "add guard", &["src/Button.tsx".to_string()]);
        assert!(prompt.contains("null check missing"));
        assert!(prompt.contains("filesModified"));
    }

    #[test]
    fn retry_prompt_places_failure_context_before_schema() {
        let group = sample_group();
        let prompt = build_retry_fix_prompt(
            &group,
            "null check missing",
            "add guard",
            &[],
            "Added a guard clause",
            "assertion failed at line 10",
        );
        let failure_idx = prompt.find("Test Failure").unwrap();
        let schema_idx = prompt.find("Structured Output").unwrap();
        assert!(failure_idx < schema_idx);
    }

    #[test]
    fn truncate_test_error_elides_beyond_max_lines() {
        let error = (0..60).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let truncated = truncate_test_error(&error, 50);
        assert_eq!(truncated.lines().count(), 51);
        assert!(truncated.ends_with("(10 more lines elided)"));
    }

    #[test]
    fn truncate_test_error_under_limit_is_unchanged() {
        let error = "one\ntwo\nthree";
        assert_eq!(truncate_test_error(error, 50), error);
    }

    #[test]
    fn triage_prompt_includes_task_name_and_schema() {
        let params = TriagePromptParams {
            task_name: "Fix login bug",
            task_notes: "Users cannot log in on mobile",
            existing_tags: &[],
            available_labels: &["bug".to_string()],
        };
        let prompt = build_triage_prompt(&params);
        assert!(prompt.contains("Fix login bug"));
        assert!(prompt.contains("issueType"));
    }
}
